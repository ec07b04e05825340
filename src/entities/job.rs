use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELED: &str = "canceled";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub file_id: i32,
    pub status: String, // pending, processing, completed, failed, canceled
    pub error: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::processing_file::Entity",
        from = "Column::FileId",
        to = "super::processing_file::Column::Id",
        on_delete = "Cascade"
    )]
    ProcessingFile,
}

impl Related<super::processing_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProcessingFile.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
