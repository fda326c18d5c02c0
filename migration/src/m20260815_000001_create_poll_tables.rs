use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Polls::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Polls::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Polls::Title).string_len(256).not_null())
                    .col(
                        ColumnDef::new(Polls::Description)
                            .string_len(10_000)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Polls::StartAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Polls::EndAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Polls::Visibility)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Polls::AllowedDomains)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Polls::PollType).string_len(32).not_null())
                    .col(ColumnDef::new(Polls::Status).string_len(32).not_null())
                    .col(
                        ColumnDef::new(Polls::TotalVotes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Polls::CreatedBy).string_len(128).not_null())
                    .col(
                        ColumnDef::new(Polls::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Polls::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_polls_status")
                    .table(Polls::Table)
                    .col(Polls::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_polls_created_by")
                    .table(Polls::Table)
                    .col(Polls::CreatedBy)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PollCandidates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PollCandidates::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PollCandidates::PollId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PollCandidates::Position)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PollCandidates::Name)
                            .string_len(256)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PollCandidates::Description)
                            .string_len(1024)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PollCandidates::VoteCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_poll_candidates_poll")
                            .from(PollCandidates::Table, PollCandidates::PollId)
                            .to(Polls::Table, Polls::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_poll_candidates_poll")
                    .table(PollCandidates::Table)
                    .col(PollCandidates::PollId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Votes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Votes::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Votes::PollId).big_integer().not_null())
                    .col(ColumnDef::new(Votes::VoterId).string_len(128).not_null())
                    .col(ColumnDef::new(Votes::CandidateId).big_integer().not_null())
                    .col(
                        ColumnDef::new(Votes::CastAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_votes_poll")
                            .from(Votes::Table, Votes::PollId)
                            .to(Polls::Table, Polls::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_votes_candidate")
                            .from(Votes::Table, Votes::CandidateId)
                            .to(PollCandidates::Table, PollCandidates::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One vote per (poll, voter). The tally path relies on this index to
        // turn a lost duplicate-insert race into a no-op.
        manager
            .create_index(
                Index::create()
                    .name("uq_votes_poll_voter")
                    .table(Votes::Table)
                    .col(Votes::PollId)
                    .col(Votes::VoterId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_votes_voter")
                    .table(Votes::Table)
                    .col(Votes::VoterId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Votes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PollCandidates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Polls::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Polls {
    Table,
    Id,
    Title,
    Description,
    StartAt,
    EndAt,
    Visibility,
    AllowedDomains,
    PollType,
    Status,
    TotalVotes,
    CreatedBy,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PollCandidates {
    Table,
    Id,
    PollId,
    Position,
    Name,
    Description,
    VoteCount,
}

#[derive(DeriveIden)]
enum Votes {
    Table,
    Id,
    PollId,
    VoterId,
    CandidateId,
    CastAt,
}
