//! Durable processing file records. The single source of truth for status.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, UpdateMany,
};

use crate::entities::processing_file::{self, Status};

#[derive(Clone)]
pub struct ProcessingFileRepository {
    db: DatabaseConnection,
}

impl ProcessingFileRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts a new `PENDING` record with no job attached. The id is assigned here.
    pub async fn create(&self, filename: &str) -> Result<processing_file::Model, DbErr> {
        let now = Utc::now();
        let record = processing_file::ActiveModel {
            filename: Set(filename.to_string()),
            status: Set(Status::Pending),
            job_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        record.insert(&self.db).await
    }

    pub async fn find(&self, id: i32) -> Result<Option<processing_file::Model>, DbErr> {
        processing_file::Entity::find_by_id(id).one(&self.db).await
    }

    /// Every record, newest first.
    pub async fn list(&self) -> Result<Vec<processing_file::Model>, DbErr> {
        processing_file::Entity::find()
            .order_by_desc(processing_file::Column::CreatedAt)
            .order_by_desc(processing_file::Column::Id)
            .all(&self.db)
            .await
    }

    /// Records the dispatched job on a file that is still `PENDING`.
    ///
    /// Returns `false` when the file left `PENDING` in the meantime.
    pub async fn attach_job(&self, id: i32, job_id: &str) -> Result<bool, DbErr> {
        let result = processing_file::Entity::update_many()
            .col_expr(processing_file::Column::JobId, Expr::value(job_id))
            .col_expr(processing_file::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(processing_file::Column::Id.eq(id))
            .filter(processing_file::Column::Status.eq(Status::Pending))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Moves `id` from `from` to `to` and clears its job id, but only if the
    /// stored status is still `from`.
    ///
    /// Exactly one of several racing callers gets `true`.
    pub async fn transition(&self, id: i32, from: Status, to: Status) -> Result<bool, DbErr> {
        check_edge(from, to)?;

        let result = cleared_update(to)
            .filter(processing_file::Column::Id.eq(id))
            .filter(processing_file::Column::Status.eq(from))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Like [`transition`](Self::transition), but the stored job id must also
    /// still equal `seen.job_id`.
    ///
    /// A `true` result means exactly the job in `seen` was detached, so the
    /// caller holds the only reference left to it.
    pub async fn transition_seen(
        &self,
        seen: &processing_file::Model,
        to: Status,
    ) -> Result<bool, DbErr> {
        check_edge(seen.status, to)?;

        let update = cleared_update(to)
            .filter(processing_file::Column::Id.eq(seen.id))
            .filter(processing_file::Column::Status.eq(seen.status));
        let update = match &seen.job_id {
            Some(job_id) => update.filter(processing_file::Column::JobId.eq(job_id.as_str())),
            None => update.filter(processing_file::Column::JobId.is_null()),
        };

        let result = update.exec(&self.db).await?;
        Ok(result.rows_affected == 1)
    }
}

fn check_edge(from: Status, to: Status) -> Result<(), DbErr> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DbErr::Custom(format!(
            "invalid processing file transition {} -> {}",
            from, to
        )))
    }
}

fn cleared_update(to: Status) -> UpdateMany<processing_file::Entity> {
    processing_file::Entity::update_many()
        .col_expr(processing_file::Column::Status, Expr::value(to))
        .col_expr(processing_file::Column::JobId, Expr::value(Option::<String>::None))
        .col_expr(processing_file::Column::UpdatedAt, Expr::value(Utc::now()))
}
