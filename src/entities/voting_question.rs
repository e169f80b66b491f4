use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "voting_questions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: String, // scheduled | open | closed
    pub starts_at: Option<DateTimeWithTimeZone>,
    pub expires_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::voting_option::Entity")]
    VotingOption,
    #[sea_orm(has_many = "super::voting_vote::Entity")]
    VotingVote,
}

impl Related<super::voting_option::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::VotingOption.def()
    }
}

impl Related<super::voting_vote::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::VotingVote.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
