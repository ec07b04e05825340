use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProcessingFiles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProcessingFiles::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ProcessingFiles::Filename).string().not_null())
                    .col(
                        ColumnDef::new(ProcessingFiles::Status)
                            .string_len(16)
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(ColumnDef::new(ProcessingFiles::JobId).string().null())
                    .col(
                        ColumnDef::new(ProcessingFiles::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProcessingFiles::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Listings are always newest first
        manager
            .create_index(
                Index::create()
                    .name("idx_processing_files_created_at")
                    .table(ProcessingFiles::Table)
                    .col(ProcessingFiles::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ProcessingFiles::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ProcessingFiles {
    Table,
    Id,
    Filename,
    Status,
    JobId,
    CreatedAt,
    UpdatedAt,
}
