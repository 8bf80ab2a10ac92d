//! Complect revision repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::DbResult;

/// A compiled complect revision.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevisionRecord {
    pub revision_id: uuid::Uuid,
    pub complect_id: uuid::Uuid,
    pub revision_number: i32,
    pub code: String,
    pub source_archive_path: String,
    /// Artifact location encoding `"<target>:<path>"`.
    pub binary_path: Option<String>,
    pub meta: serde_json::Value,
    pub created: DateTime<Utc>,
}

pub fn revision_code(complect_id: &uuid::Uuid, revision_number: i32) -> String {
    format!("{}.{}", complect_id, revision_number)
}

#[async_trait]
pub trait RevisionRepo: Send + Sync {
    /// Allocate the next revision number of `complect_id` and store a revision.
    async fn create(
        &self,
        complect_id: uuid::Uuid,
        binary_path: Option<&str>,
    ) -> DbResult<RevisionRecord>;

    async fn get(&self, revision_id: uuid::Uuid) -> DbResult<Option<RevisionRecord>>;
}

/// PostgreSQL implementation of RevisionRepo.
pub struct PgRevisionRepo {
    pool: PgPool,
}

impl PgRevisionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevisionRepo for PgRevisionRepo {
    async fn create(
        &self,
        complect_id: uuid::Uuid,
        binary_path: Option<&str>,
    ) -> DbResult<RevisionRecord> {
        let mut tx = self.pool.begin().await?;

        let (revision_number,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO complects_revisions_seq (complect_id, last_revision_number)
            VALUES ($1, 1)
            ON CONFLICT (complect_id) DO UPDATE
                SET last_revision_number = complects_revisions_seq.last_revision_number + 1
            RETURNING last_revision_number
            "#,
        )
        .bind(complect_id)
        .fetch_one(&mut *tx)
        .await?;

        let record = sqlx::query_as::<_, RevisionRecord>(
            r#"
            INSERT INTO complects_revisions
                (revision_id, complect_id, revision_number, code, source_archive_path, binary_path, meta, created)
            VALUES ($1, $2, $3, $4, '', $5, '{}', NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(complect_id)
        .bind(revision_number)
        .bind(revision_code(&complect_id, revision_number))
        .bind(binary_path)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, revision_id: uuid::Uuid) -> DbResult<Option<RevisionRecord>> {
        let record = sqlx::query_as::<_, RevisionRecord>(
            "SELECT * FROM complects_revisions WHERE revision_id = $1",
        )
        .bind(revision_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
