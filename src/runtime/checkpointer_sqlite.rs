/*!
SQLite checkpointer.

Durable implementation of the [`Checkpointer`] trait on `sqlx`.

## Schema discipline

Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`) and runs
statement-by-statement on a dedicated setup connection before the pool is
opened. DDL never executes inside a read/write transaction, and normal
operations use the transactional pool, never the setup connection.

## Concurrency

`put` opens its transaction with `BEGIN IMMEDIATE` so the write lock is
held before the head row is read. Two writers racing on the same thread
therefore serialize: the loser re-reads the head the winner just committed,
sees it no longer matches the expected parent, and fails with
[`CheckpointerError::Conflict`] instead of silently forking the lineage. A
deferred transaction would let both writers read the stale head first.
Writes to different threads proceed in parallel through the pool.

## Tables

- `checkpoints(thread_id, checkpoint_id, parent_checkpoint_id, payload,
  metadata, created_at)`, PK `(thread_id, checkpoint_id)`.
- `checkpoint_writes(thread_id, checkpoint_id, task_id, seq, channel,
  payload)`, PK `(thread_id, checkpoint_id, task_id, seq)` — one row per
  channel a transition updated.
*/

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Connection, Row, SqliteConnection, SqlitePool,
};
use std::str::FromStr;
use tracing::instrument;

use crate::runtime::checkpointer::{
    new_checkpoint_id, Checkpoint, CheckpointMeta, Checkpointer, CheckpointerError, Result,
};
use crate::runtime::persistence::{from_column, to_column, PersistedCheckpoint, PersistedMeta};
use crate::state::WorkflowState;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        thread_id TEXT NOT NULL,
        checkpoint_id TEXT NOT NULL,
        parent_checkpoint_id TEXT,
        payload TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (thread_id, checkpoint_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checkpoint_writes (
        thread_id TEXT NOT NULL,
        checkpoint_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        channel TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (thread_id, checkpoint_id, task_id, seq)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
        ON checkpoints (thread_id, created_at)
    "#,
];

/// SQLite-backed checkpointer.
pub struct SqliteCheckpointer {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointer").finish()
    }
}

impl SqliteCheckpointer {
    /// Connect to (or create) the database at `database_url` and ensure the
    /// schema exists.
    ///
    /// Example URL: `sqlite://planweave.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CheckpointerError::Backend {
                message: format!("invalid sqlite url: {e}"),
            })?
            .create_if_missing(true);

        // Dedicated setup connection: DDL runs one statement at a time,
        // outside any transaction, before the pool opens.
        let setup_options = options.clone();
        let mut setup = setup_options
            .connect()
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("schema connection: {e}"),
            })?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut setup)
                .await
                .map_err(|e| CheckpointerError::Backend {
                    message: format!("schema setup: {e}"),
                })?;
        }
        setup
            .close()
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("schema connection close: {e}"),
            })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("connect error: {e}"),
            })?;

        Ok(Self { pool })
    }

    fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint> {
        let payload: String = row.get("payload");
        let persisted: PersistedCheckpoint =
            from_column(&payload).map_err(|e| CheckpointerError::Other {
                message: format!("payload decode: {e}"),
            })?;
        Ok(Checkpoint::from(persisted))
    }

    /// JSON slice of the state for one updated channel, stored as the
    /// partial-write payload.
    fn channel_payload(state: &WorkflowState, channel: &str) -> serde_json::Value {
        match channel {
            "messages" => serde_json::to_value(&state.messages).unwrap_or_default(),
            "plan" => serde_json::to_value(&state.plan).unwrap_or_default(),
            "cursor" => serde_json::json!(state.current_step),
            _ => serde_json::Value::Null,
        }
    }

    /// Head check plus inserts. Runs inside an already-open immediate
    /// transaction, so the head read here cannot go stale before commit.
    async fn insert_checkpoint(
        conn: &mut SqliteConnection,
        checkpoint: &Checkpoint,
        payload: &str,
        metadata: &str,
    ) -> Result<()> {
        let head: Option<String> = sqlx::query_scalar(
            r#"
            SELECT checkpoint_id FROM checkpoints
            WHERE thread_id = ?1
            ORDER BY rowid DESC
            LIMIT 1
            "#,
        )
        .bind(&checkpoint.thread_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("head check: {e}"),
        })?;

        if head.as_deref() != checkpoint.parent_checkpoint_id.as_deref() {
            return Err(CheckpointerError::Conflict {
                thread_id: checkpoint.thread_id.clone(),
                expected: checkpoint.parent_checkpoint_id.clone(),
                found: head,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                thread_id, checkpoint_id, parent_checkpoint_id,
                payload, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.checkpoint_id)
        .bind(checkpoint.parent_checkpoint_id.as_deref())
        .bind(payload)
        .bind(metadata)
        .bind(checkpoint.meta.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("insert checkpoint: {e}"),
        })?;

        for (seq, channel) in checkpoint.meta.updated_channels.iter().enumerate() {
            let channel_payload = Self::channel_payload(&checkpoint.state, channel);
            sqlx::query(
                r#"
                INSERT INTO checkpoint_writes (
                    thread_id, checkpoint_id, task_id, seq, channel, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&checkpoint.thread_id)
            .bind(&checkpoint.checkpoint_id)
            .bind(&checkpoint.meta.node)
            .bind(seq as i64)
            .bind(channel)
            .bind(channel_payload.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("insert write: {e}"),
            })?;
        }

        Ok(())
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    #[instrument(skip(self, state, meta), err)]
    async fn put(
        &self,
        thread_id: &str,
        parent_checkpoint_id: Option<&str>,
        state: &WorkflowState,
        meta: CheckpointMeta,
    ) -> Result<String> {
        let checkpoint_id = new_checkpoint_id();
        let checkpoint = Checkpoint {
            thread_id: thread_id.to_string(),
            checkpoint_id: checkpoint_id.clone(),
            parent_checkpoint_id: parent_checkpoint_id.map(str::to_string),
            state: state.clone(),
            meta,
        };
        let persisted = PersistedCheckpoint::from(&checkpoint);
        let payload = to_column(&persisted).map_err(|e| CheckpointerError::Other {
            message: format!("payload encode: {e}"),
        })?;
        let metadata = to_column(&PersistedMeta {
            node: checkpoint.meta.node.clone(),
            updated_channels: checkpoint.meta.updated_channels.clone(),
        })
        .map_err(|e| CheckpointerError::Other {
            message: format!("metadata encode: {e}"),
        })?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("acquire connection: {e}"),
            })?;

        // Take the database write lock before reading the head; a deferred
        // transaction would let a concurrent writer to the same thread read
        // the same stale head and fork the lineage.
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("tx begin: {e}"),
            })?;

        match Self::insert_checkpoint(&mut *conn, &checkpoint, &payload, &metadata).await {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| CheckpointerError::Backend {
                        message: format!("tx commit: {e}"),
                    })?;
                Ok(checkpoint_id)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT payload FROM checkpoints
            WHERE thread_id = ?1
            ORDER BY rowid DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("select latest: {e}"),
        })?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM checkpoints
            WHERE thread_id = ?1
            ORDER BY rowid DESC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("select lineage: {e}"),
        })?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }
}
