use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "bookings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(column_type = "String(StringLen::N(254))")]
    pub user_email: String,
    #[sea_orm(column_type = "String(StringLen::N(64))")]
    pub facility: String,
    pub date: Date,
    /// Slot start, `HH:MM`
    #[sea_orm(column_type = "String(StringLen::N(5))")]
    pub time: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
