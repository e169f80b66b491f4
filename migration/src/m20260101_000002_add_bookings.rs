use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.create_table(bookings_table()).await?;

        // Reminder job reads a single day
        manager.create_index(bookings_by_date_index()).await?;
        manager.create_index(bookings_by_user_index()).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bookings::Table).to_owned())
            .await
    }
}

fn bookings_table() -> TableCreateStatement {
    Table::create()
        .table(Bookings::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Bookings::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(Bookings::UserEmail).string_len(254).not_null())
        .col(ColumnDef::new(Bookings::Facility).string_len(64).not_null())
        .col(ColumnDef::new(Bookings::Date).date().not_null())
        .col(ColumnDef::new(Bookings::Time).string_len(5).not_null())
        .col(
            ColumnDef::new(Bookings::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        // One booking per facility slot
        .index(
            Index::create()
                .name("idx_bookings_slot")
                .col(Bookings::Facility)
                .col(Bookings::Date)
                .col(Bookings::Time)
                .unique(),
        )
        .to_owned()
}

fn bookings_by_date_index() -> IndexCreateStatement {
    Index::create()
        .name("idx_bookings_date")
        .table(Bookings::Table)
        .col(Bookings::Date)
        .to_owned()
}

fn bookings_by_user_index() -> IndexCreateStatement {
    Index::create()
        .name("idx_bookings_user")
        .table(Bookings::Table)
        .col(Bookings::UserEmail)
        .col(Bookings::Date)
        .to_owned()
}

#[derive(DeriveIden)]
enum Bookings {
    Table,
    Id,
    UserEmail,
    Facility,
    Date,
    Time,
    CreatedAt,
}
