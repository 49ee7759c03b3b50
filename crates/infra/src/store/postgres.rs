//! Postgres-backed fulfillment store.
//!
//! ## Claim semantics
//!
//! `claim` is a single conditional update:
//!
//! ```sql
//! UPDATE fulfillment_jobs SET status = 'IN_PROGRESS', ...
//! WHERE id = $1 AND status = 'PENDING'
//! ```
//!
//! Zero affected rows means another poller claimed the job first.
//!
//! ## Optimistic writes
//!
//! Job write-backs are fenced with `status = 'IN_PROGRESS' AND claimed_at = <lease>`.
//! Order and payment upserts only update when the stored `version` equals the
//! version the caller read, and bump it. Either miss rolls the transaction back
//! and surfaces as `Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Database` |
//! | Other | N/A | `Database` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use fulfillment_core::{OrderId, PaymentId};
use fulfillment_orders::{
    Coordinate, Order, OrderItem, OrderStatus, Payment, PaymentStatus, ShippingDestination,
    StoreSettings,
};

use super::{ChangeSet, JobStats, JobStore, OrderStore, StoreError};
use crate::jobs::{Job, JobId, JobKind, JobStatus, JobType};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fulfillment_orders (
    id UUID PRIMARY KEY,
    status TEXT NOT NULL,
    total_amount BIGINT NOT NULL,
    items JSONB NOT NULL DEFAULT '[]'::jsonb,
    destination JSONB,
    shipping_courier_code TEXT,
    shipping_courier_service TEXT,
    shipping_order_id TEXT UNIQUE,
    tracking_id TEXT,
    shipping_status TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    version BIGINT NOT NULL DEFAULT 0
);
ALTER TABLE fulfillment_orders ADD COLUMN IF NOT EXISTS version BIGINT NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS fulfillment_orders_tracking_idx ON fulfillment_orders (tracking_id);

CREATE TABLE IF NOT EXISTS fulfillment_payments (
    id UUID PRIMARY KEY,
    order_id UUID NOT NULL REFERENCES fulfillment_orders (id),
    external_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    amount BIGINT NOT NULL,
    gateway_invoice_id TEXT,
    gateway_invoice_url TEXT,
    paid_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    version BIGINT NOT NULL DEFAULT 0
);
ALTER TABLE fulfillment_payments ADD COLUMN IF NOT EXISTS version BIGINT NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS fulfillment_payments_order_idx ON fulfillment_payments (order_id);

CREATE TABLE IF NOT EXISTS fulfillment_jobs (
    id UUID PRIMARY KEY,
    job_type TEXT NOT NULL,
    order_id UUID NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_run_at TIMESTAMPTZ,
    claimed_at TIMESTAMPTZ,
    amount BIGINT,
    reason TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS fulfillment_jobs_active_idx
    ON fulfillment_jobs (order_id, job_type)
    WHERE status IN ('PENDING', 'IN_PROGRESS');
CREATE INDEX IF NOT EXISTS fulfillment_jobs_due_idx
    ON fulfillment_jobs (job_type, status, next_run_at);

CREATE TABLE IF NOT EXISTS fulfillment_store_settings (
    id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    contact_name TEXT NOT NULL,
    contact_phone TEXT NOT NULL,
    address TEXT NOT NULL,
    postal_code TEXT,
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION
);
"#;

const JOB_COLUMNS: &str = "id, job_type, order_id, status, attempts, last_error, next_run_at, \
                           claimed_at, amount, reason, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, status, total_amount, items, destination, shipping_courier_code, \
                             shipping_courier_service, shipping_order_id, tracking_id, \
                             shipping_status, created_at, updated_at, version";

const PAYMENT_COLUMNS: &str = "id, order_id, external_id, status, amount, gateway_invoice_id, \
                               gateway_invoice_url, paid_at, created_at, updated_at, version";

/// Postgres-backed job, order and payment store.
#[derive(Debug, Clone)]
pub struct PostgresFulfillmentStore {
    pool: Arc<PgPool>,
}

impl PostgresFulfillmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, settings), err)]
    pub async fn save_store_settings(&self, settings: &StoreSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fulfillment_store_settings
                (id, contact_name, contact_phone, address, postal_code, latitude, longitude)
            VALUES (1, $1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                contact_name = EXCLUDED.contact_name,
                contact_phone = EXCLUDED.contact_phone,
                address = EXCLUDED.address,
                postal_code = EXCLUDED.postal_code,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude
            "#,
        )
        .bind(&settings.contact_name)
        .bind(&settings.contact_phone)
        .bind(&settings.address)
        .bind(&settings.postal_code)
        .bind(settings.coordinate.map(|c| c.latitude))
        .bind(settings.coordinate.map(|c| c.longitude))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_store_settings", e))?;
        Ok(())
    }

    async fn fetch_order(
        &self,
        operation: &'static str,
        filter: &str,
        value: &str,
    ) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM fulfillment_orders WHERE {filter} = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| order_from_row(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresFulfillmentStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, order_id = %job.order_id), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError> {
        let (amount, reason) = match &job.kind {
            JobKind::Shipping => (None, None),
            JobKind::Refund { amount, reason } => (Some(*amount), Some(reason.clone())),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO fulfillment_jobs
                (id, job_type, order_id, status, attempts, last_error, next_run_at,
                 claimed_at, amount, reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (order_id, job_type) WHERE status IN ('PENDING', 'IN_PROGRESS')
            DO NOTHING
            "#,
        )
        .bind(job.id.0)
        .bind(job.job_type().as_str())
        .bind(job.order_id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(&job.last_error)
        .bind(job.next_run_at)
        .bind(job.claimed_at)
        .bind(amount)
        .bind(reason)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(job.id);
        }

        self.find_active(job.order_id, job.job_type())
            .await?
            .map(|existing| existing.id)
            .ok_or_else(|| {
                StoreError::Conflict(format!(
                    "{} job for order {} conflicted but no active job was found",
                    job.job_type(),
                    job.order_id
                ))
            })
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM fulfillment_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_active(
        &self,
        order_id: OrderId,
        job_type: JobType,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM fulfillment_jobs \
             WHERE order_id = $1 AND job_type = $2 AND status IN ('PENDING', 'IN_PROGRESS') \
             ORDER BY created_at ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(order_id.as_uuid())
            .bind(job_type.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_active", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM fulfillment_jobs \
             WHERE job_type = $1 AND status = 'PENDING' \
               AND (next_run_at IS NULL OR next_run_at <= $2) \
             ORDER BY created_at ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(job_type.as_str())
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_due", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "UPDATE fulfillment_jobs \
             SET status = 'IN_PROGRESS', last_error = NULL, claimed_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'PENDING' \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.0)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        if write_job(&mut *conn, job).await? == 0 {
            return Err(lease_lost(job));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn release_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE fulfillment_jobs
            SET status = 'PENDING',
                last_error = 'lease expired',
                next_run_at = NULL,
                claimed_at = NULL,
                updated_at = $2
            WHERE status = 'IN_PROGRESS'
              AND (claimed_at IS NULL OR claimed_at < $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM fulfillment_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(corrupt)?;
            let total: i64 = row.try_get("total").map_err(corrupt)?;
            let total = total as usize;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = total,
                Some(JobStatus::InProgress) => stats.in_progress = total,
                Some(JobStatus::Succeeded) => stats.succeeded = total,
                Some(JobStatus::Failed) => stats.failed = total,
                None => return Err(StoreError::Corrupt(format!("unknown job status {status}"))),
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl OrderStore for PostgresFulfillmentStore {
    #[instrument(skip(self), err)]
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM fulfillment_orders WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(order_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_order", e))?;
        row.map(|r| order_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_order_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        self.fetch_order("find_order_by_tracking_id", "tracking_id", tracking_id)
            .await
    }

    #[instrument(skip(self), err)]
    async fn find_order_by_shipping_order_id(
        &self,
        shipping_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        self.fetch_order(
            "find_order_by_shipping_order_id",
            "shipping_order_id",
            shipping_order_id,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn find_payment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM fulfillment_payments WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_payment_by_external_id", e))?;
        row.map(|r| payment_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn latest_settled_payment(
        &self,
        order_id: OrderId,
    ) -> Result<Option<Payment>, StoreError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM fulfillment_payments \
             WHERE order_id = $1 AND status IN ('PAID', 'REFUNDED') \
             ORDER BY paid_at DESC NULLS LAST, created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(order_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_settled_payment", e))?;
        row.map(|r| payment_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn store_settings(&self) -> Result<Option<StoreSettings>, StoreError> {
        let row = sqlx::query(
            "SELECT contact_name, contact_phone, address, postal_code, latitude, longitude \
             FROM fulfillment_store_settings WHERE id = 1",
        )
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_settings", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let latitude: Option<f64> = row.try_get("latitude").map_err(corrupt)?;
        let longitude: Option<f64> = row.try_get("longitude").map_err(corrupt)?;
        Ok(Some(StoreSettings {
            contact_name: row.try_get("contact_name").map_err(corrupt)?,
            contact_phone: row.try_get("contact_phone").map_err(corrupt)?,
            address: row.try_get("address").map_err(corrupt)?,
            postal_code: row.try_get("postal_code").map_err(corrupt)?,
            coordinate: latitude.zip(longitude).map(|(lat, lng)| Coordinate::new(lat, lng)),
        }))
    }

    #[instrument(
        skip(self, changes),
        fields(
            job_id = changes.job.as_ref().map(|j| j.id.to_string()),
            order_id = changes.order.as_ref().map(|o| o.id.to_string()),
        ),
        err
    )]
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Dropping `tx` on an early return rolls it back.
        if let Some(job) = &changes.job {
            if write_job(&mut *tx, job).await? == 0 {
                return Err(lease_lost(job));
            }
        }
        if let Some(order) = &changes.order {
            if upsert_order(&mut tx, order).await? == 0 {
                return Err(StoreError::Conflict(format!(
                    "order {} changed since it was read (version {})",
                    order.id, order.version
                )));
            }
        }
        if let Some(payment) = &changes.payment {
            if upsert_payment(&mut tx, payment).await? == 0 {
                return Err(StoreError::Conflict(format!(
                    "payment {} changed since it was read (version {})",
                    payment.id, payment.version
                )));
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }
}

async fn write_job(
    conn: &mut sqlx::PgConnection,
    job: &Job,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE fulfillment_jobs
        SET status = $2,
            attempts = $3,
            last_error = $4,
            next_run_at = $5,
            claimed_at = $6,
            updated_at = $7
        WHERE id = $1 AND status = 'IN_PROGRESS' AND claimed_at = $6
        "#,
    )
    .bind(job.id.0)
    .bind(job.status.as_str())
    .bind(job.attempts as i32)
    .bind(&job.last_error)
    .bind(job.next_run_at)
    .bind(job.claimed_at)
    .bind(job.updated_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;
    Ok(result.rows_affected())
}

/// Returns the affected row count; zero means the stored version moved on.
async fn upsert_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO fulfillment_orders
            (id, status, total_amount, items, destination, shipping_courier_code,
             shipping_courier_service, shipping_order_id, tracking_id, shipping_status,
             created_at, updated_at, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13 + 1)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            shipping_order_id = COALESCE(fulfillment_orders.shipping_order_id, EXCLUDED.shipping_order_id),
            tracking_id = EXCLUDED.tracking_id,
            shipping_status = EXCLUDED.shipping_status,
            updated_at = EXCLUDED.updated_at,
            version = fulfillment_orders.version + 1
        WHERE fulfillment_orders.version = $13
        "#,
    )
    .bind(order.id.as_uuid())
    .bind(order.status.as_str())
    .bind(order.total_amount)
    .bind(Json(&order.items))
    .bind(order.destination.as_ref().map(Json))
    .bind(&order.shipping_courier_code)
    .bind(&order.shipping_courier_service)
    .bind(&order.shipping_order_id)
    .bind(&order.tracking_id)
    .bind(&order.shipping_status)
    .bind(order.created_at)
    .bind(order.updated_at)
    .bind(order.version)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_order", e))?;
    Ok(result.rows_affected())
}

async fn upsert_payment(
    tx: &mut Transaction<'_, Postgres>,
    payment: &Payment,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO fulfillment_payments
            (id, order_id, external_id, status, amount, gateway_invoice_id,
             gateway_invoice_url, paid_at, created_at, updated_at, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11 + 1)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            paid_at = EXCLUDED.paid_at,
            updated_at = EXCLUDED.updated_at,
            version = fulfillment_payments.version + 1
        WHERE fulfillment_payments.version = $11
        "#,
    )
    .bind(payment.id.as_uuid())
    .bind(payment.order_id.as_uuid())
    .bind(&payment.external_id)
    .bind(payment.status.as_str())
    .bind(payment.amount)
    .bind(&payment.gateway_invoice_id)
    .bind(&payment.gateway_invoice_url)
    .bind(payment.paid_at)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .bind(payment.version)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_payment", e))?;
    Ok(result.rows_affected())
}

fn lease_lost(job: &Job) -> StoreError {
    StoreError::Conflict(format!("job {} is no longer held by this claim", job.id))
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let job_type: String = row.try_get("job_type").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempts: i32 = row.try_get("attempts").map_err(corrupt)?;

    let kind = match JobType::parse(&job_type) {
        Some(JobType::Shipping) => JobKind::Shipping,
        Some(JobType::Refund) => {
            let amount: Option<i64> = row.try_get("amount").map_err(corrupt)?;
            let reason: Option<String> = row.try_get("reason").map_err(corrupt)?;
            JobKind::Refund {
                amount: amount.ok_or_else(|| StoreError::Corrupt("refund job without amount".into()))?,
                reason: reason.unwrap_or_default(),
            }
        }
        None => return Err(StoreError::Corrupt(format!("unknown job type {job_type}"))),
    };

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(corrupt)?),
        kind,
        order_id: OrderId::from_uuid(row.try_get("order_id").map_err(corrupt)?),
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status {status}")))?,
        attempts: u32::try_from(attempts).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        next_run_at: row.try_get("next_run_at").map_err(corrupt)?,
        claimed_at: row.try_get("claimed_at").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = row.try_get("status").map_err(corrupt)?;
    let items: Json<Vec<OrderItem>> = row.try_get("items").map_err(corrupt)?;
    let destination: Option<Json<ShippingDestination>> =
        row.try_get("destination").map_err(corrupt)?;

    Ok(Order {
        id: OrderId::from_uuid(row.try_get("id").map_err(corrupt)?),
        status: OrderStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown order status {status}")))?,
        total_amount: row.try_get("total_amount").map_err(corrupt)?,
        items: items.0,
        destination: destination.map(|d| d.0),
        shipping_courier_code: row.try_get("shipping_courier_code").map_err(corrupt)?,
        shipping_courier_service: row.try_get("shipping_courier_service").map_err(corrupt)?,
        shipping_order_id: row.try_get("shipping_order_id").map_err(corrupt)?,
        tracking_id: row.try_get("tracking_id").map_err(corrupt)?,
        shipping_status: row.try_get("shipping_status").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
        version: row.try_get("version").map_err(corrupt)?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let status: String = row.try_get("status").map_err(corrupt)?;
    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get("id").map_err(corrupt)?),
        order_id: OrderId::from_uuid(row.try_get("order_id").map_err(corrupt)?),
        external_id: row.try_get("external_id").map_err(corrupt)?,
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown payment status {status}")))?,
        amount: row.try_get("amount").map_err(corrupt)?,
        gateway_invoice_id: row.try_get("gateway_invoice_id").map_err(corrupt)?,
        gateway_invoice_url: row.try_get("gateway_invoice_url").map_err(corrupt)?,
        paid_at: row.try_get("paid_at").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
        version: row.try_get("version").map_err(corrupt)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            if db_err.code().as_deref() == Some("23505") {
                StoreError::Conflict(format!("unique violation in {operation}: {message}"))
            } else {
                StoreError::Database { operation, message }
            }
        }
        other => StoreError::Database {
            operation,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // Needs a disposable database:
    // DATABASE_URL=postgres://... cargo test -p fulfillment-infra -- --ignored
    async fn store() -> PostgresFulfillmentStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        let store = PostgresFulfillmentStore::new(pool);
        store.ensure_schema().await.expect("schema");
        store
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn claim_is_compare_and_swap() {
        let store = store().await;
        let now = Utc::now();
        let id = store.enqueue(Job::shipping(OrderId::new(), now)).await.unwrap();

        let claimed = store.claim(id, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert!(claimed.claimed_at.is_some());
        assert!(store.claim(id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn enqueue_is_idempotent_while_active() {
        let store = store().await;
        let now = Utc::now();
        let order_id = OrderId::new();
        let first = store.enqueue(Job::shipping(order_id, now)).await.unwrap();
        let second = store.enqueue(Job::shipping(order_id, now)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn write_back_is_fenced_on_the_claim() {
        let store = store().await;
        let now = Utc::now();
        let id = store.enqueue(Job::shipping(OrderId::new(), now)).await.unwrap();

        let mut original = store.claim(id, now).await.unwrap().unwrap();
        store
            .release_stale(now + Duration::seconds(1), now)
            .await
            .unwrap();
        store
            .claim(id, now + Duration::seconds(2))
            .await
            .unwrap()
            .unwrap();

        original.mark_succeeded(now + Duration::seconds(3));
        assert!(matches!(
            store.update(&original).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::InProgress
        );
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_order_version_is_rejected_and_rolled_back() {
        let store = store().await;
        let now = Utc::now();
        let order = Order::new(OrderId::new(), 1_000, vec![], now);
        store
            .commit(ChangeSet::new().with_order(order.clone()))
            .await
            .unwrap();

        let mut first = store.get_order(order.id).await.unwrap().unwrap();
        let mut second = first.clone();
        first.status = OrderStatus::Shipped;
        store.commit(ChangeSet::new().with_order(first)).await.unwrap();

        second.mark_refunded(now);
        assert!(matches!(
            store.commit(ChangeSet::new().with_order(second)).await,
            Err(StoreError::Conflict(_))
        ));
        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Shipped);
        assert_eq!(stored.version, 2);
    }
}
