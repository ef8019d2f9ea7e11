//! Reconciliation mapping from upstream status to order action.
//!
//! # Mapping
//!
//! | upstream      | action                                   |
//! |---------------|------------------------------------------|
//! | pending       | progress if numbers moved, else no-op    |
//! | in progress   | progress if numbers moved, else no-op    |
//! | completed     | complete                                 |
//! | partial       | partial + proportional credit            |
//! | cancelled     | refund ("cancelled upstream")            |
//! | anything else | unrecognized (left for the next cycle)   |

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use smm_domain::{round_money, Money, Order, OrderStatus, StatusReport, UpstreamStatus};

use crate::REASON_CANCELLED_UPSTREAM;

/// Action the reconciler must apply to one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing changed upstream
    NoChange,
    /// Still running; persist the new numbers (and move pending to processing)
    Progress {
        /// Reported start counter
        start_count: u64,
        /// Reported undelivered units
        remains: u64,
    },
    /// Fully delivered
    Complete {
        /// Reported start counter
        start_count: u64,
        /// Reported undelivered units
        remains: u64,
    },
    /// Stopped short; credit `refund` in the same unit of work
    Partial {
        /// Reported start counter
        start_count: u64,
        /// Reported undelivered units
        remains: u64,
        /// Credit owed for the undelivered part (may be zero)
        refund: Money,
    },
    /// Cancelled upstream; run the refund path
    Refund {
        /// Refund reason
        reason: String,
    },
    /// Provider returned a status we cannot classify
    Unrecognized(String),
    /// Order is not in a state reconciliation handles
    NotReconcilable,
}

/// Map an upstream report onto the order.
pub fn decide_reconciliation(order: &Order, report: &StatusReport) -> ReconcileAction {
    if !order.status.is_in_flight() || order.upstream_order_id.is_none() {
        return ReconcileAction::NotReconcilable;
    }

    let StatusReport {
        status,
        start_count,
        remains,
    } = report;
    let (start_count, remains) = (*start_count, *remains);

    match status {
        UpstreamStatus::Pending | UpstreamStatus::InProgress => {
            let moved = start_count != order.start_count || remains != order.remains;
            if moved || order.status == OrderStatus::Pending {
                ReconcileAction::Progress {
                    start_count,
                    remains,
                }
            } else {
                ReconcileAction::NoChange
            }
        },
        UpstreamStatus::Completed => ReconcileAction::Complete {
            start_count,
            remains,
        },
        UpstreamStatus::Partial => ReconcileAction::Partial {
            start_count,
            remains,
            refund: partial_refund_amount(order, remains),
        },
        UpstreamStatus::Cancelled => ReconcileAction::Refund {
            reason: REASON_CANCELLED_UPSTREAM.to_string(),
        },
        UpstreamStatus::Unknown(raw) => ReconcileAction::Unrecognized(raw.clone()),
    }
}

/// Credit owed for `remains` undelivered units.
///
/// `round(charge * remains / quantity, 4)`, capped at what has not been
/// credited back yet.
pub fn partial_refund_amount(order: &Order, remains: u64) -> Money {
    if remains == 0 || order.quantity == 0 {
        return Money::zero();
    }

    let proportional = round_money(
        order.charge.as_decimal() * Decimal::from(remains) / Decimal::from(order.quantity),
    );
    let outstanding = order.outstanding_charge();
    match Money::new(proportional) {
        Ok(amount) if amount < outstanding => amount,
        Ok(_) => outstanding,
        Err(_) => Money::zero(),
    }
}

/// Pending order that never reached the worker and needs a new dispatch job.
pub fn is_stranded(order: &Order, now: DateTime<Utc>, stale_after: Duration) -> bool {
    order.awaits_dispatch(now) && now - order.created_at >= stale_after
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use smm_domain::{Link, Service};
    use uuid::Uuid;

    fn processing_order(charge: Decimal, quantity: u32) -> Order {
        let service = Service::new(
            "Views",
            Uuid::now_v7(),
            "7",
            dec!(1),
            dec!(0),
            dec!(0),
            Some(charge * dec!(1000) / Decimal::from(quantity)),
            1,
            1_000_000,
        )
        .unwrap();
        let mut order = Order::new_pending(
            Uuid::now_v7(),
            &service,
            Link::parse("https://youtube.com/watch?v=x").unwrap(),
            quantity,
        )
        .unwrap();
        order.status = OrderStatus::Processing;
        order.upstream_order_id = Some("555".to_string());
        order
    }

    fn report(status: UpstreamStatus, start_count: u64, remains: u64) -> StatusReport {
        StatusReport {
            status,
            start_count,
            remains,
        }
    }

    #[test]
    fn test_completed() {
        let order = processing_order(dec!(7), 1000);
        assert_eq!(
            decide_reconciliation(&order, &report(UpstreamStatus::Completed, 10, 0)),
            ReconcileAction::Complete {
                start_count: 10,
                remains: 0
            }
        );
    }

    #[test]
    fn test_cancelled_refunds() {
        let order = processing_order(dec!(7), 1000);
        assert_eq!(
            decide_reconciliation(&order, &report(UpstreamStatus::Cancelled, 0, 1000)),
            ReconcileAction::Refund {
                reason: "cancelled upstream".to_string()
            }
        );
    }

    #[test]
    fn test_unchanged_progress_is_noop() {
        let mut order = processing_order(dec!(7), 1000);
        order.start_count = 50;
        order.remains = 400;
        assert_eq!(
            decide_reconciliation(&order, &report(UpstreamStatus::InProgress, 50, 400)),
            ReconcileAction::NoChange
        );
        assert_eq!(
            decide_reconciliation(&order, &report(UpstreamStatus::InProgress, 50, 300)),
            ReconcileAction::Progress {
                start_count: 50,
                remains: 300
            }
        );
    }

    #[test]
    fn test_partial_refund_proportional() {
        let order = processing_order(dec!(7), 1000);
        match decide_reconciliation(&order, &report(UpstreamStatus::Partial, 0, 250)) {
            ReconcileAction::Partial { refund, remains, .. } => {
                assert_eq!(remains, 250);
                assert_eq!(refund.as_decimal(), dec!(1.75));
            },
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_partial_refund_capped_and_zero() {
        let mut order = processing_order(dec!(7), 1000);
        assert!(partial_refund_amount(&order, 0).is_zero());

        order.refunded_amount = Money::new(dec!(6.5)).unwrap();
        assert_eq!(partial_refund_amount(&order, 1000).as_decimal(), dec!(0.5));
    }

    #[test]
    fn test_settled_orders_not_reconcilable() {
        let mut order = processing_order(dec!(7), 1000);
        order.status = OrderStatus::Refunded;
        assert_eq!(
            decide_reconciliation(&order, &report(UpstreamStatus::Completed, 0, 0)),
            ReconcileAction::NotReconcilable
        );
    }

    #[test]
    fn test_unknown_status() {
        let order = processing_order(dec!(7), 1000);
        assert_eq!(
            decide_reconciliation(
                &order,
                &report(UpstreamStatus::Unknown("Refilling".to_string()), 0, 0)
            ),
            ReconcileAction::Unrecognized("Refilling".to_string())
        );
    }

    #[test]
    fn test_stranded_detection() {
        let mut order = processing_order(dec!(7), 1000);
        order.status = OrderStatus::Pending;
        order.upstream_order_id = None;
        let now = order.created_at + Duration::seconds(301);

        assert!(is_stranded(&order, now, Duration::seconds(300)));
        assert!(!is_stranded(&order, order.created_at, Duration::seconds(300)));

        order.dispatch_lease_until = Some(now + Duration::seconds(60));
        assert!(!is_stranded(&order, now, Duration::seconds(300)));
    }
}
