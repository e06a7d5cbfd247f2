//! `PostgreSQL` [`CommandStore`] for the cloud side.
//!
//! One row per command in `site_commands`, keyed `(site_uuid, id)` and
//! indexed `(site_uuid, state, enqueued_ms)` for the fetch path. Every
//! multi-row transition (`fetch`, `complete`, lease sweeps) runs in a
//! single database transaction; `FOR UPDATE SKIP LOCKED` keeps parallel
//! endpoint workers from handing the same command out twice.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use cfgplane_core::ConfigError;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use super::{timeout_response, Command, CommandState, CommandStore, FetchedCommand};

/// Schema applied by [`PostgresCommandStore::ensure_schema`].
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS site_commands (
    site_uuid   UUID    NOT NULL,
    id          BIGINT  NOT NULL,
    state       TEXT    NOT NULL,
    batch       BYTEA   NOT NULL,
    enqueued_ms BIGINT  NOT NULL,
    sent_ms     BIGINT,
    done_ms     BIGINT,
    response    BYTEA,
    retries     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (site_uuid, id)
);
CREATE INDEX IF NOT EXISTS site_commands_pending_idx
    ON site_commands (site_uuid, state, enqueued_ms);
";

/// Queue backend over a `PostgreSQL` pool.
pub struct PostgresCommandStore {
    pool: PgPool,
    lease_ms: i64,
    max_retries: i32,
}

impl PostgresCommandStore {
    #[must_use]
    pub fn new(pool: PgPool, lease_window: Duration, max_retries: u32) -> Self {
        Self {
            pool,
            lease_ms: i64::try_from(lease_window.as_millis()).unwrap_or(i64::MAX),
            max_retries: i32::try_from(max_retries).unwrap_or(i32::MAX),
        }
    }

    /// Creates the table and index if they do not exist.
    ///
    /// # Errors
    ///
    /// `TRANSPORT` when the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), ConfigError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(db_err)
    }
}

fn db_err(err: sqlx::Error) -> ConfigError {
    ConfigError::Transport {
        reason: format!("command store: {err}"),
    }
}

fn row_to_command(row: &sqlx::postgres::PgRow) -> Result<Command, ConfigError> {
    let state = match row.try_get::<String, _>("state").map_err(db_err)?.as_str() {
        "ENQD" => CommandState::Enqd,
        "WORK" => CommandState::Work,
        "DONE" => CommandState::Done,
        "CNCL" => CommandState::Cncl,
        other => {
            return Err(ConfigError::Corrupt {
                reason: format!("command state {other:?}"),
            })
        }
    };
    Ok(Command {
        id: row.try_get("id").map_err(db_err)?,
        site: row.try_get("site_uuid").map_err(db_err)?,
        batch: row.try_get("batch").map_err(db_err)?,
        state,
        enqueued_ms: row.try_get("enqueued_ms").map_err(db_err)?,
        sent_ms: row.try_get("sent_ms").map_err(db_err)?,
        done_ms: row.try_get("done_ms").map_err(db_err)?,
        response: row.try_get("response").map_err(db_err)?,
        retries: row
            .try_get::<i32, _>("retries")
            .map_err(db_err)?
            .try_into()
            .unwrap_or(0),
    })
}

fn now_ms() -> i64 {
    use cfgplane_core::ClockSource;
    cfgplane_core::SystemClock.now_ms()
}

#[async_trait]
impl CommandStore for PostgresCommandStore {
    async fn enqueue(&self, site: Uuid, batch: Vec<u8>) -> Result<i64, ConfigError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        // MAX+1 inside the transaction keeps ids dense per site; the
        // primary key turns a lost race into a retryable conflict.
        let row = sqlx::query(
            "INSERT INTO site_commands (site_uuid, id, state, batch, enqueued_ms)
             SELECT $1, COALESCE(MAX(id), 0) + 1, 'ENQD', $2, $3
             FROM site_commands WHERE site_uuid = $1
             RETURNING id",
        )
        .bind(site)
        .bind(&batch)
        .bind(now_ms())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.try_get("id").map_err(db_err)
    }

    async fn fetch(&self, site: Uuid) -> Result<Option<FetchedCommand>, ConfigError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let picked = sqlx::query(
            "SELECT id, batch FROM site_commands
             WHERE site_uuid = $1 AND state = 'ENQD'
             ORDER BY id
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(site)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = picked else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(db_err)?;
        let batch: Vec<u8> = row.try_get("batch").map_err(db_err)?;

        sqlx::query(
            "UPDATE site_commands SET state = 'WORK', sent_ms = $3
             WHERE site_uuid = $1 AND id = $2",
        )
        .bind(site)
        .bind(id)
        .bind(now_ms())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(Some(FetchedCommand { id, batch }))
    }

    async fn complete(&self, site: Uuid, id: i64, response: Vec<u8>) -> Result<(), ConfigError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT state FROM site_commands
             WHERE site_uuid = $1 AND id = $2
             FOR UPDATE",
        )
        .bind(site)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(ConfigError::NotFound {
                path: format!("command {id}"),
            });
        };
        match row.try_get::<String, _>("state").map_err(db_err)?.as_str() {
            "WORK" => {
                sqlx::query(
                    "UPDATE site_commands
                     SET state = 'DONE', done_ms = $3, response = $4
                     WHERE site_uuid = $1 AND id = $2",
                )
                .bind(site)
                .bind(id)
                .bind(now_ms())
                .bind(&response)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                tx.commit().await.map_err(db_err)
            }
            // Late complete after a cancel: discard.
            "CNCL" => tx.commit().await.map_err(db_err),
            _ => Err(ConfigError::Busy),
        }
    }

    async fn cancel(&self, site: Uuid, id: i64) -> Result<(), ConfigError> {
        let updated = sqlx::query(
            "UPDATE site_commands SET state = 'CNCL', done_ms = $3
             WHERE site_uuid = $1 AND id = $2 AND state IN ('ENQD', 'WORK')",
        )
        .bind(site)
        .bind(id)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            // Either terminal (fine) or missing (an error).
            let exists = sqlx::query(
                "SELECT 1 AS present FROM site_commands WHERE site_uuid = $1 AND id = $2",
            )
            .bind(site)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            if exists.is_none() {
                return Err(ConfigError::NotFound {
                    path: format!("command {id}"),
                });
            }
        }
        Ok(())
    }

    async fn list(&self, site: Uuid, range: Range<i64>) -> Result<Vec<Command>, ConfigError> {
        let rows = sqlx::query(
            "SELECT site_uuid, id, state, batch, enqueued_ms, sent_ms, done_ms, response, retries
             FROM site_commands
             WHERE site_uuid = $1 AND id >= $2 AND id < $3
             ORDER BY id",
        )
        .bind(site)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_command).collect()
    }

    async fn expire_leases(&self, now_ms: i64) -> Result<u32, ConfigError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let cancelled = sqlx::query(
            "UPDATE site_commands
             SET state = 'CNCL', done_ms = $1, response = $2
             WHERE state = 'WORK' AND sent_ms + $3 <= $1 AND retries >= $4",
        )
        .bind(now_ms)
        .bind(timeout_response())
        .bind(self.lease_ms)
        .bind(self.max_retries)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let reverted = sqlx::query(
            "UPDATE site_commands
             SET state = 'ENQD', retries = retries + 1, sent_ms = NULL
             WHERE state = 'WORK' AND sent_ms + $1 <= $2",
        )
        .bind(self.lease_ms)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        #[allow(clippy::cast_possible_truncation)]
        Ok((cancelled.rows_affected() + reverted.rows_affected()) as u32)
    }
}
