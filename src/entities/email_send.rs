//! Delivered email batches, used to enforce the daily recipient cap.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_sends")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// UTC day the batch went out
    pub sent_on: Date,
    /// `admin` or `committee`
    #[sea_orm(column_type = "String(StringLen::N(32))")]
    pub channel: String,
    #[sea_orm(column_type = "String(StringLen::N(128))")]
    pub sender_uid: String,
    pub recipient_count: i32,
    #[sea_orm(column_type = "String(StringLen::N(256))")]
    pub subject: String,
    pub provider_message_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
