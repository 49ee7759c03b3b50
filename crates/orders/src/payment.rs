use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fulfillment_core::{DomainError, DomainResult, OrderId, PaymentId};

/// Payment status lattice.
///
/// ```text
/// PENDING ──> PAID ──> REFUNDED
///    └──────> EXPIRED
/// ```
///
/// Moves only go forward along an edge; `PAID` and `EXPIRED` are incomparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(PaymentStatus::Pending),
            "PAID" => Some(PaymentStatus::Paid),
            "EXPIRED" => Some(PaymentStatus::Expired),
            "REFUNDED" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Paid)
                | (PaymentStatus::Pending, PaymentStatus::Expired)
                | (PaymentStatus::Paid, PaymentStatus::Refunded)
        )
    }

    /// Money was captured at some point (`PAID`, possibly refunded since).
    pub fn is_settled(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Refunded)
    }
}

impl core::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of asking a payment to move to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTransition {
    Applied {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// Already in the requested status.
    Unchanged,
    /// The move would go backwards or sideways in the lattice.
    Rejected {
        current: PaymentStatus,
        requested: PaymentStatus,
    },
}

/// One payment attempt for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    /// Gateway correlation key (globally unique).
    pub external_id: String,
    pub status: PaymentStatus,
    /// Amount in smallest currency unit.
    pub amount: i64,
    pub gateway_invoice_id: Option<String>,
    pub gateway_invoice_url: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl Payment {
    pub fn new(
        id: PaymentId,
        order_id: OrderId,
        external_id: impl Into<String>,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            order_id,
            external_id: external_id.into(),
            status: PaymentStatus::Pending,
            amount,
            gateway_invoice_id: None,
            gateway_invoice_url: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn transition(&mut self, next: PaymentStatus, now: DateTime<Utc>) -> PaymentTransition {
        let current = self.status;
        if current == next {
            return PaymentTransition::Unchanged;
        }
        if !current.can_transition_to(next) {
            return PaymentTransition::Rejected {
                current,
                requested: next,
            };
        }

        self.status = next;
        if next == PaymentStatus::Paid {
            self.paid_at = Some(now);
        }
        self.updated_at = now;
        PaymentTransition::Applied {
            from: current,
            to: next,
        }
    }

    /// `REFUNDED` is reachable only from `PAID` and is set at most once.
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.transition(PaymentStatus::Refunded, now) {
            PaymentTransition::Applied { .. } => Ok(()),
            PaymentTransition::Unchanged => Err(DomainError::conflict(format!(
                "payment {} is already refunded",
                self.id
            ))),
            PaymentTransition::Rejected { current, .. } => Err(DomainError::invariant(format!(
                "payment {} cannot be refunded from {current}",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payment() -> Payment {
        Payment::new(PaymentId::new(), OrderId::new(), "inv-ext-1", 50_000, Utc::now())
    }

    #[test]
    fn paid_sets_paid_at() {
        let mut p = payment();
        let t = p.transition(PaymentStatus::Paid, Utc::now());
        assert_eq!(
            t,
            PaymentTransition::Applied {
                from: PaymentStatus::Pending,
                to: PaymentStatus::Paid
            }
        );
        assert!(p.paid_at.is_some());
    }

    #[test]
    fn duplicate_paid_keeps_first_paid_at() {
        let mut p = payment();
        let first = Utc::now();
        p.transition(PaymentStatus::Paid, first);
        let t = p.transition(PaymentStatus::Paid, first + chrono::Duration::minutes(5));
        assert_eq!(t, PaymentTransition::Unchanged);
        assert_eq!(p.paid_at, Some(first));
    }

    #[test]
    fn late_expired_does_not_regress_paid() {
        let mut p = payment();
        p.transition(PaymentStatus::Paid, Utc::now());
        let t = p.transition(PaymentStatus::Expired, Utc::now());
        assert!(matches!(t, PaymentTransition::Rejected { .. }));
        assert_eq!(p.status, PaymentStatus::Paid);
    }

    #[test]
    fn refund_requires_paid() {
        let mut p = payment();
        assert!(matches!(
            p.mark_refunded(Utc::now()),
            Err(DomainError::InvariantViolation(_))
        ));
        p.transition(PaymentStatus::Paid, Utc::now());
        p.mark_refunded(Utc::now()).unwrap();
        assert_eq!(p.status, PaymentStatus::Refunded);
        assert!(matches!(p.mark_refunded(Utc::now()), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(PaymentStatus::parse("paid"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentStatus::parse(" Expired "), Some(PaymentStatus::Expired));
        assert_eq!(PaymentStatus::parse("CHARGEBACK"), None);
    }

    fn rank(s: PaymentStatus) -> u8 {
        match s {
            PaymentStatus::Pending => 0,
            PaymentStatus::Paid | PaymentStatus::Expired => 1,
            PaymentStatus::Refunded => 2,
        }
    }

    fn any_status() -> impl Strategy<Value = PaymentStatus> {
        prop_oneof![
            Just(PaymentStatus::Pending),
            Just(PaymentStatus::Paid),
            Just(PaymentStatus::Expired),
            Just(PaymentStatus::Refunded),
        ]
    }

    proptest! {
        #[test]
        fn lattice_never_moves_backwards(requests in proptest::collection::vec(any_status(), 1..30)) {
            let mut p = payment();
            for next in requests {
                let before = p.status;
                p.transition(next, Utc::now());
                prop_assert!(rank(p.status) >= rank(before));
                if before == PaymentStatus::Expired {
                    prop_assert_eq!(p.status, PaymentStatus::Expired);
                }
            }
        }
    }
}
