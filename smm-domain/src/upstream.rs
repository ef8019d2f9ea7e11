//! Provider-agnostic upstream order status.
//!
//! Adapters translate whatever their provider returns into these shapes so
//! the engine can reason about upstream state without knowing the wire format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of an order as reported by the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    /// Accepted, not started
    Pending,
    /// Delivery in progress
    InProgress,
    /// Fully delivered
    Completed,
    /// Stopped with some quantity undelivered
    Partial,
    /// Cancelled by the provider
    Cancelled,
    /// Anything the adapter could not classify
    Unknown(String),
}

impl UpstreamStatus {
    /// Parse the free-form status string providers return.
    ///
    /// Matching is case-insensitive and accepts the common spelling variants
    /// ("In progress", "Processing", "Canceled").
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "pending" => Self::Pending,
            "in progress" | "processing" | "inprogress" => Self::InProgress,
            "completed" | "complete" => Self::Completed,
            "partial" => Self::Partial,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Completed => f.write_str("completed"),
            Self::Partial => f.write_str("partial"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// Snapshot of an upstream order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Reported status
    pub status: UpstreamStatus,
    /// Counter value when delivery started
    pub start_count: u64,
    /// Units not yet delivered
    pub remains: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_variants() {
        assert_eq!(UpstreamStatus::parse("Completed"), UpstreamStatus::Completed);
        assert_eq!(UpstreamStatus::parse("In progress"), UpstreamStatus::InProgress);
        assert_eq!(UpstreamStatus::parse("processing"), UpstreamStatus::InProgress);
        assert_eq!(UpstreamStatus::parse("Canceled"), UpstreamStatus::Cancelled);
        assert_eq!(UpstreamStatus::parse("PARTIAL"), UpstreamStatus::Partial);
        assert_eq!(
            UpstreamStatus::parse("Refilling"),
            UpstreamStatus::Unknown("Refilling".to_string())
        );
    }
}
