//! Dispatch decision: what to do with a claimed order after calling upstream.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Outcome of one `createOrder` call, stripped of transport details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateAttempt {
    /// Provider accepted the order
    Accepted {
        /// Provider-side order id
        upstream_order_id: String,
    },
    /// Provider answered with an explicit error
    Rejected {
        /// Message returned by the provider
        message: String,
    },
    /// Timeout or transport failure
    Unavailable {
        /// Error description (for logs)
        error: String,
    },
}

/// Action the worker must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Record the upstream id and move the order to processing
    MarkProcessing {
        /// Provider-side order id
        upstream_order_id: String,
    },
    /// Return the charge
    Refund {
        /// Reason stored on the refund transaction
        reason: String,
    },
    /// Put the job back on the queue
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
    },
}

/// Decide the follow-up for attempt number `attempt` (1-based).
pub fn decide_dispatch(
    outcome: CreateAttempt,
    attempt: u32,
    policy: &RetryPolicy,
) -> DispatchDecision {
    match outcome {
        CreateAttempt::Accepted { upstream_order_id } => {
            DispatchDecision::MarkProcessing { upstream_order_id }
        },
        CreateAttempt::Rejected { message } => DispatchDecision::Refund {
            reason: format!("upstream rejected order: {}", message),
        },
        CreateAttempt::Unavailable { .. } if policy.is_exhausted(attempt) => {
            DispatchDecision::Refund {
                reason: format!("upstream unavailable after {} attempts", attempt),
            }
        },
        CreateAttempt::Unavailable { .. } => DispatchDecision::Retry {
            delay: policy.delay_for(attempt),
        },
    }
}
