//! The product authority's shadow of the ledger's `available` field.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityStatus {
    /// Created here, not yet acknowledged by the inventory authority.
    Pending,
    Available,
    OutOfStock,
    /// Deletion announced; hidden from buyers until the ledger confirms.
    Deleted,
}

impl AvailabilityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AvailabilityStatus::Pending => "PENDING",
            AvailabilityStatus::Available => "AVAILABLE",
            AvailabilityStatus::OutOfStock => "OUT_OF_STOCK",
            AvailabilityStatus::Deleted => "DELETED",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == AvailabilityStatus::Deleted
    }

    /// Outcome of moving from `self` to `target`.
    pub fn transition_to(self, target: AvailabilityStatus) -> StatusUpdate {
        if self == target {
            StatusUpdate::Unchanged
        } else if self.is_terminal() {
            StatusUpdate::Terminal
        } else {
            StatusUpdate::Updated
        }
    }
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown availability status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for AvailabilityStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AvailabilityStatus::Pending),
            "AVAILABLE" => Ok(AvailabilityStatus::Available),
            "OUT_OF_STOCK" => Ok(AvailabilityStatus::OutOfStock),
            "DELETED" => Ok(AvailabilityStatus::Deleted),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// What a status write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Updated,
    /// Already at the target status.
    Unchanged,
    /// The current status is terminal and was kept.
    Terminal,
    /// No projection row for the product.
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_storage_form() {
        for status in [
            AvailabilityStatus::Pending,
            AvailabilityStatus::Available,
            AvailabilityStatus::OutOfStock,
            AvailabilityStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<AvailabilityStatus>().unwrap(), status);
        }
        assert!("SOLD".parse::<AvailabilityStatus>().is_err());
    }

    #[test]
    fn test_deleted_is_terminal() {
        use AvailabilityStatus::*;
        assert_eq!(Deleted.transition_to(Available), StatusUpdate::Terminal);
        assert_eq!(Deleted.transition_to(Deleted), StatusUpdate::Unchanged);
        assert_eq!(Available.transition_to(Available), StatusUpdate::Unchanged);
        assert_eq!(Pending.transition_to(OutOfStock), StatusUpdate::Updated);
        assert_eq!(OutOfStock.transition_to(Deleted), StatusUpdate::Updated);
    }
}
