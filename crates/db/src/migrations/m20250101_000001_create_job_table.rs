//! Create job table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Job::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Job::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Job::Queue).string_len(32).not_null())
                    .col(ColumnDef::new(Job::Status).string_len(16).not_null())
                    .col(
                        ColumnDef::new(Job::QueuedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Job::StartedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Job::FinishedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Job::DelayedUntil).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Job::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Job::ExceptionMessage).text())
                    .col(ColumnDef::new(Job::ExceptionSource).text())
                    .col(ColumnDef::new(Job::StackTrace).text())
                    .col(ColumnDef::new(Job::Exception).text())
                    .col(ColumnDef::new(Job::Data).json_binary().not_null())
                    .col(ColumnDef::new(Job::Mutex).string_len(256))
                    .to_owned(),
            )
            .await?;

        // Index: (queue, status) (backlog counts, claim candidate scan)
        manager
            .create_index(
                Index::create()
                    .name("idx_job_queue_status")
                    .table(Job::Table)
                    .col(Job::Queue)
                    .col(Job::Status)
                    .to_owned(),
            )
            .await?;

        // Index: (queue, status, delayed_until) (delayed-job promotion)
        manager
            .create_index(
                Index::create()
                    .name("idx_job_queue_status_delayed_until")
                    .table(Job::Table)
                    .col(Job::Queue)
                    .col(Job::Status)
                    .col(Job::DelayedUntil)
                    .to_owned(),
            )
            .await?;

        // Index: finished_at (audit queries, retention tooling)
        manager
            .create_index(
                Index::create()
                    .name("idx_job_finished_at")
                    .table(Job::Table)
                    .col(Job::FinishedAt)
                    .to_owned(),
            )
            .await?;

        // Partial unique index: at most one non-terminal job per mutex value.
        // Expressed as raw SQL; sea-query's index builder cannot attach the
        // WHERE predicate.
        let conn = manager.get_connection();
        conn.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_job_mutex_active \
             ON job (mutex) \
             WHERE status IN ('queued', 'delayed', 'running')",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Job::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Job {
    Table,
    Id,
    Queue,
    Status,
    QueuedAt,
    StartedAt,
    FinishedAt,
    DelayedUntil,
    RetryCount,
    ExceptionMessage,
    ExceptionSource,
    StackTrace,
    Exception,
    Data,
    Mutex,
}
