use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "usage_summaries")]
pub struct Model {
    /// `YYYYMM`, UTC
    #[sea_orm(primary_key, auto_increment = false)]
    pub month_key: String,
    pub total_bookings: i64,
    pub distinct_users: i64,
    pub by_facility: Json,
    pub generated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
