pub mod bookings;
pub mod email;
pub mod users;
pub mod voting;
