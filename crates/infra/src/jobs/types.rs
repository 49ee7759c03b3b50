//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fulfillment_core::OrderId;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload-free discriminant used to route jobs to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Shipping,
    Refund,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Shipping => "shipping",
            JobType::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shipping" => Some(JobType::Shipping),
            "refund" => Some(JobType::Refund),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job kind with its kind-specific payload.
///
/// Shipping jobs carry nothing beyond the order id: shipment data is read from
/// the order when the job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Shipping,
    Refund {
        /// Amount in smallest currency unit.
        amount: i64,
        reason: String,
    },
}

impl JobKind {
    pub fn refund(amount: i64, reason: impl Into<String>) -> Self {
        Self::Refund {
            amount,
            reason: reason.into(),
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::Shipping => JobType::Shipping,
            JobKind::Refund { .. } => JobType::Refund,
        }
    }
}

/// Job execution status.
///
/// `Pending -> InProgress -> {Succeeded | Pending (retry) | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "IN_PROGRESS" => Some(JobStatus::InProgress),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A durable unit of work driving one external side effect to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub order_id: OrderId,
    pub status: JobStatus,
    /// Failed attempts so far (starts at 0).
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the job may run again; `None` means "as soon as possible".
    pub next_run_at: Option<DateTime<Utc>>,
    /// Stamp of the most recent claim. While `InProgress` it is the lease the
    /// sweeper checks; the executor's final write is fenced on it, so it is
    /// kept when the job finishes and only cleared by a lease release.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(order_id: OrderId, kind: JobKind, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            order_id,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            next_run_at: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn shipping(order_id: OrderId, now: DateTime<Utc>) -> Self {
        Self::new(order_id, JobKind::Shipping, now)
    }

    pub fn refund(order_id: OrderId, amount: i64, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(order_id, JobKind::refund(amount, reason), now)
    }

    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    /// Pending and not scheduled for later.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at.is_none_or(|at| at <= now)
    }

    /// Claim transition: only a pending job can be claimed.
    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::InProgress;
        self.last_error = None;
        self.claimed_at = Some(now);
        self.updated_at = now;
        true
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.next_run_at = None;
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, error: String, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = JobStatus::Pending;
        self.last_error = Some(error);
        self.next_run_at = Some(next_run_at);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = JobStatus::Failed;
        self.last_error = Some(error);
        self.next_run_at = None;
        self.updated_at = now;
    }

    /// Return an orphaned claim to the queue. Not a failed attempt.
    pub fn release_lease(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.last_error = Some("lease expired".to_string());
        self.next_run_at = None;
        self.claimed_at = None;
        self.updated_at = now;
    }
}
