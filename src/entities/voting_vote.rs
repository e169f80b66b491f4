use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "voting_votes")]
pub struct Model {
    /// `{question_id}:{property_key}`, one row per property per question
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub question_id: String,
    pub option_id: String,
    pub property: String,
    pub voter_name: Option<String>,
    pub voter_email: String,
    pub user_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
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
