pub mod booking;
pub mod email_send;
pub mod usage_summary;
pub mod user;
pub mod voting_option;
pub mod voting_question;
pub mod voting_vote;
