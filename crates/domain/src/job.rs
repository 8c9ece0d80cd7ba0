//! Fulfillment jobs and their retry policy.

use chrono::{DateTime, Duration, Utc};
use common::{JobId, OrderId, OrderItemId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::order::DeliveryType;

/// The kind of work a job performs, mirrored from the item's delivery type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Stock,
    Invite,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Stock => "STOCK",
            JobType::Invite => "INVITE",
        }
    }
}

impl From<DeliveryType> for JobType {
    fn from(delivery: DeliveryType) -> Self {
        match delivery {
            DeliveryType::Stock => JobType::Stock,
            DeliveryType::Invite => JobType::Invite,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOCK" => Ok(JobType::Stock),
            "INVITE" => Ok(JobType::Invite),
            other => Err(DomainError::unknown("job type", other)),
        }
    }
}

/// Job lifecycle.
///
/// ```text
/// Pending ──► Processing ──┬──► Completed
///    ▲            │        └──► Failed
///    └────────────┘ (transient failure, attempts < max_attempts)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::unknown("job status", other)),
        }
    }
}

/// A unit of work turning one paid order item into a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentJob {
    pub id: JobId,
    pub order_id: OrderId,
    pub order_item_id: OrderItemId,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Failed attempts so far; never exceeds `max_attempts`.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current PROCESSING run began.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FulfillmentJob {
    /// Creates a PENDING job that is due immediately.
    pub fn new(
        order_id: OrderId,
        order_item_id: OrderItemId,
        job_type: JobType,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            order_id,
            order_item_id,
            job_type,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            next_retry_at: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns true if a batch pass at `now` may pick this job up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// What happens to a PROCESSING job after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to PENDING, due again at `next_retry_at`.
    Retry {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// FAILED for good.
    Fail { attempts: u32 },
}

/// Exponential backoff between job attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempts`.
    ///
    /// `base * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let factor = 1i32 << exponent;
        let delay = self.base_delay * factor;
        delay.min(self.max_delay)
    }

    /// Decides the disposition of a failed run of `job`.
    pub fn on_failure(
        &self,
        job: &FulfillmentJob,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        let attempts = (job.attempts + 1).min(job.max_attempts);
        if permanent || attempts >= job.max_attempts {
            FailureDisposition::Fail { attempts }
        } else {
            FailureDisposition::Retry {
                attempts,
                next_retry_at: now + self.backoff(attempts),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::seconds(30),
            max_delay: Duration::hours(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(attempts: u32, max_attempts: u32) -> FulfillmentJob {
        let mut job = FulfillmentJob::new(
            OrderId::new(),
            OrderItemId::new(),
            JobType::Stock,
            max_attempts,
            Utc::now(),
        );
        job.attempts = attempts;
        job
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::new(Duration::seconds(10), Duration::seconds(60));
        assert_eq!(policy.backoff(1), Duration::seconds(10));
        assert_eq!(policy.backoff(2), Duration::seconds(20));
        assert_eq!(policy.backoff(3), Duration::seconds(40));
        assert_eq!(policy.backoff(4), Duration::seconds(60));
        assert_eq!(policy.backoff(40), Duration::seconds(60));
    }

    #[test]
    fn test_transient_failure_retries_until_exhausted() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        match policy.on_failure(&job(0, 3), false, now) {
            FailureDisposition::Retry {
                attempts,
                next_retry_at,
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(next_retry_at, now + Duration::seconds(30));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        assert_eq!(
            policy.on_failure(&job(2, 3), false, now),
            FailureDisposition::Fail { attempts: 3 }
        );
    }

    #[test]
    fn test_permanent_failure_fails_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_failure(&job(0, 5), true, Utc::now()),
            FailureDisposition::Fail { attempts: 1 }
        );
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_failure(&job(5, 5), false, Utc::now()),
            FailureDisposition::Fail { attempts: 5 }
        );
    }

    #[test]
    fn test_due_respects_next_retry_at() {
        let now = Utc::now();
        let mut j = job(1, 5);
        assert!(j.is_due(now));
        j.next_retry_at = Some(now + Duration::seconds(5));
        assert!(!j.is_due(now));
        assert!(j.is_due(now + Duration::seconds(5)));
        j.status = JobStatus::Processing;
        assert!(!j.is_due(now + Duration::hours(1)));
    }

    #[test]
    fn test_job_type_mirrors_delivery_type() {
        assert_eq!(JobType::from(DeliveryType::Stock), JobType::Stock);
        assert_eq!(JobType::from(DeliveryType::Invite), JobType::Invite);
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        assert_eq!(job(0, 0).max_attempts, 1);
    }
}
