pub use sea_orm_migration::prelude::*;

mod m20241204_000001_create_processing_files_table;
mod m20241204_000002_create_jobs_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20241204_000001_create_processing_files_table::Migration),
            Box::new(m20241204_000002_create_jobs_table::Migration),
        ]
    }
}
