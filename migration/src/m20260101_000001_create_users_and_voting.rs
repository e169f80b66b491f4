use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Uid)
                            .string_len(128)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Users::Email).string_len(254).not_null())
                    .col(ColumnDef::new(Users::Username).string_len(64).null())
                    .col(ColumnDef::new(Users::FullName).string_len(128).null())
                    .col(ColumnDef::new(Users::Property).string_len(64).null())
                    .col(
                        ColumnDef::new(Users::RoleOwner)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Users::IsAdmin)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Users::CustomClaims)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(Users::ClaimsSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Users::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Users::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .index(
                        Index::create()
                            .name("idx_users_email")
                            .col(Users::Email)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(VotingQuestions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VotingQuestions::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(VotingQuestions::Title)
                            .string_len(256)
                            .not_null(),
                    )
                    .col(ColumnDef::new(VotingQuestions::Description).text().not_null())
                    .col(
                        ColumnDef::new(VotingQuestions::Status)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VotingQuestions::StartsAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(VotingQuestions::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(VotingQuestions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(VotingQuestions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(VotingOptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VotingOptions::QuestionId)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VotingOptions::OptionId)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VotingOptions::Label)
                            .string_len(256)
                            .not_null(),
                    )
                    .col(ColumnDef::new(VotingOptions::Position).integer().not_null())
                    .col(
                        ColumnDef::new(VotingOptions::VoteCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .primary_key(
                        Index::create()
                            .col(VotingOptions::QuestionId)
                            .col(VotingOptions::OptionId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_voting_options_question")
                            .from(VotingOptions::Table, VotingOptions::QuestionId)
                            .to(VotingQuestions::Table, VotingQuestions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager.create_table(votes_table()).await?;
        manager.create_index(votes_by_option_index()).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(VotingVotes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(VotingOptions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(VotingQuestions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await
    }
}

fn votes_table() -> TableCreateStatement {
    Table::create()
        .table(VotingVotes::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(VotingVotes::Id)
                .string_len(160)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(VotingVotes::QuestionId)
                .string_len(64)
                .not_null(),
        )
        .col(
            ColumnDef::new(VotingVotes::OptionId)
                .string_len(64)
                .not_null(),
        )
        .col(
            ColumnDef::new(VotingVotes::Property)
                .string_len(64)
                .not_null(),
        )
        .col(
            ColumnDef::new(VotingVotes::VoterName)
                .string_len(128)
                .null(),
        )
        .col(
            ColumnDef::new(VotingVotes::VoterEmail)
                .string_len(254)
                .not_null(),
        )
        .col(ColumnDef::new(VotingVotes::UserId).string_len(128).null())
        .col(
            ColumnDef::new(VotingVotes::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(
            ColumnDef::new(VotingVotes::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .index(
            Index::create()
                .name("idx_voting_votes_question_property")
                .col(VotingVotes::QuestionId)
                .col(VotingVotes::Property)
                .unique(),
        )
        .foreign_key(
            ForeignKey::create()
                .name("fk_voting_votes_question")
                .from(VotingVotes::Table, VotingVotes::QuestionId)
                .to(VotingQuestions::Table, VotingQuestions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_owned()
}

fn votes_by_option_index() -> IndexCreateStatement {
    Index::create()
        .name("idx_voting_votes_question_option")
        .table(VotingVotes::Table)
        .col(VotingVotes::QuestionId)
        .col(VotingVotes::OptionId)
        .to_owned()
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Uid,
    Email,
    Username,
    FullName,
    Property,
    RoleOwner,
    IsAdmin,
    CustomClaims,
    ClaimsSyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum VotingQuestions {
    Table,
    Id,
    Title,
    Description,
    Status,
    StartsAt,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum VotingOptions {
    Table,
    QuestionId,
    OptionId,
    Label,
    Position,
    VoteCount,
}

#[derive(DeriveIden)]
enum VotingVotes {
    Table,
    Id,
    QuestionId,
    OptionId,
    Property,
    VoterName,
    VoterEmail,
    UserId,
    CreatedAt,
    UpdatedAt,
}
