use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "voting_options")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub question_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub option_id: String,
    pub label: String,
    pub position: i32,
    /// Denormalized tally, maintained in the vote transaction
    pub vote_count: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::voting_question::Entity",
        from = "Column::QuestionId",
        to = "super::voting_question::Column::Id"
    )]
    VotingQuestion,
}

impl Related<super::voting_question::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::VotingQuestion.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
