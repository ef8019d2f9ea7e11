//! PostgreSQL dispatch queue.
//!
//! Jobs live in `dispatch_jobs`. Consumers reserve with
//! `FOR UPDATE SKIP LOCKED`, so several workers (and several daemons) can
//! poll the same table. A reservation that is neither acked nor released
//! before its visibility timeout becomes visible again, which is what makes
//! delivery at-least-once across crashes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use smm_domain::DispatchJob;

use crate::error::{ExecError, ExecResult};
use crate::ports::{Delivery, DispatchQueue};

fn queue_error(err: sqlx::Error) -> ExecError {
    ExecError::Queue(err.to_string())
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Queue backed by the `dispatch_jobs` table.
#[derive(Clone)]
pub struct PgQueue {
    pool: Arc<PgPool>,
    visibility_timeout: Duration,
}

impl PgQueue {
    /// Create a queue. Reserved jobs reappear after `visibility_timeout`.
    pub fn new(pool: Arc<PgPool>, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    /// Number of ready or reserved jobs.
    pub async fn depth(&self) -> ExecResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM dispatch_jobs WHERE state <> 'dead'")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(queue_error)?;
        row.try_get("depth").map_err(queue_error)
    }
}

#[async_trait]
impl DispatchQueue for PgQueue {
    async fn enqueue(&self, job: DispatchJob) -> ExecResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_jobs (id, order_id, payload, attempt, available_at, state, created_at)
            VALUES ($1, $2, $3, 0, NOW(), 'ready', NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job.order_id)
        .bind(Json(&job))
        .execute(self.pool.as_ref())
        .await
        .map_err(queue_error)?;

        debug!(order_id = %job.order_id, "Dispatch job enqueued");
        Ok(())
    }

    async fn reserve(&self) -> ExecResult<Option<Delivery>> {
        let row = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET state = 'reserved',
                attempt = attempt + 1,
                reserved_until = NOW() + make_interval(secs => $1)
            WHERE id = (
                SELECT id FROM dispatch_jobs
                WHERE (state = 'ready' AND available_at <= NOW())
                   OR (state = 'reserved' AND reserved_until < NOW())
                ORDER BY available_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempt
            "#,
        )
        .bind(seconds(self.visibility_timeout))
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(queue_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let Json(job): Json<DispatchJob> = row.try_get("payload").map_err(queue_error)?;
        let attempt: i32 = row.try_get("attempt").map_err(queue_error)?;
        Ok(Some(Delivery {
            id: row.try_get("id").map_err(queue_error)?,
            job,
            attempt: u32::try_from(attempt).unwrap_or(0),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> ExecResult<()> {
        sqlx::query("DELETE FROM dispatch_jobs WHERE id = $1")
            .bind(delivery.id)
            .execute(self.pool.as_ref())
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> ExecResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET state = 'ready',
                reserved_until = NULL,
                available_at = NOW() + make_interval(secs => $2)
            WHERE id = $1 AND state = 'reserved'
            "#,
        )
        .bind(delivery.id)
        .bind(seconds(delay))
        .execute(self.pool.as_ref())
        .await
        .map_err(queue_error)?;

        if result.rows_affected() == 0 {
            return Err(ExecError::Queue(format!("delivery {} is not reserved", delivery.id)));
        }
        Ok(())
    }

    async fn bury(&self, delivery: &Delivery, reason: &str) -> ExecResult<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET state = 'dead', reserved_until = NULL, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(reason)
        .execute(self.pool.as_ref())
        .await
        .map_err(queue_error)?;
        Ok(())
    }
}
