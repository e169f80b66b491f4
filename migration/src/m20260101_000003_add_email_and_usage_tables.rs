use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per delivered batch, summed per UTC day for the recipient cap
        manager.create_table(email_sends_table()).await?;
        manager.create_index(email_sends_by_day_index()).await?;

        manager
            .create_table(
                Table::create()
                    .table(UsageSummaries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UsageSummaries::MonthKey)
                            .string_len(6)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UsageSummaries::TotalBookings)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UsageSummaries::DistinctUsers)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UsageSummaries::ByFacility)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UsageSummaries::GeneratedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UsageSummaries::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(EmailSends::Table).to_owned())
            .await
    }
}

fn email_sends_table() -> TableCreateStatement {
    Table::create()
        .table(EmailSends::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(EmailSends::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(EmailSends::SentOn).date().not_null())
        .col(ColumnDef::new(EmailSends::Channel).string_len(32).not_null())
        .col(
            ColumnDef::new(EmailSends::SenderUid)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(EmailSends::RecipientCount)
                .integer()
                .not_null(),
        )
        .col(ColumnDef::new(EmailSends::Subject).string_len(256).not_null())
        .col(
            ColumnDef::new(EmailSends::ProviderMessageId)
                .string_len(128)
                .null(),
        )
        .col(
            ColumnDef::new(EmailSends::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned()
}

fn email_sends_by_day_index() -> IndexCreateStatement {
    Index::create()
        .name("idx_email_sends_day")
        .table(EmailSends::Table)
        .col(EmailSends::SentOn)
        .to_owned()
}

#[derive(DeriveIden)]
enum EmailSends {
    Table,
    Id,
    SentOn,
    Channel,
    SenderUid,
    RecipientCount,
    Subject,
    ProviderMessageId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum UsageSummaries {
    Table,
    MonthKey,
    TotalBookings,
    DistinctUsers,
    ByFacility,
    GeneratedAt,
}

#[cfg(test)]
mod tests {
    use sea_orm_migration::sea_query::PostgresQueryBuilder;

    use super::*;
    use crate::bare_constraints;

    #[test]
    fn email_sends_table_renders_for_postgres() {
        let table = email_sends_table().to_string(PostgresQueryBuilder);
        assert!(bare_constraints(&table).is_empty(), "{table}");
        assert!(!table.contains("idx_email_sends_day"));

        let index = email_sends_by_day_index().to_string(PostgresQueryBuilder);
        assert!(index.starts_with(r#"CREATE INDEX "idx_email_sends_day" ON "email_sends""#));
    }
}
