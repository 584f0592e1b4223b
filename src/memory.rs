//! Device memory capability query
//!
//! The candidate generator and search controller size their working sets
//! against the memory actually available on the compute device. The query
//! itself is an external collaborator concern; this module defines the
//! capability interface plus a fixed-size implementation for hosts that
//! already know their budget (and for tests).

use crate::error::{CalibrateError, Result};

/// Snapshot of device working memory, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Total device memory
    pub total_bytes: u64,
    /// Currently free device memory
    pub free_bytes: u64,
}

impl MemoryInfo {
    /// The slice of memory calibration is allowed to occupy.
    ///
    /// Half of total, capped by what is actually free, so a search never
    /// claims the whole device.
    pub fn budget_slice(&self) -> u64 {
        self.free_bytes.min(self.total_bytes / 2)
    }
}

/// Capability interface for querying device working memory.
///
/// Implementations that cannot answer must return
/// [`CalibrateError::Environment`]; calibration aborts rather than guessing.
pub trait MemoryBudget {
    /// Query total and free working memory
    fn query(&self) -> Result<MemoryInfo>;
}

/// Memory budget with a fixed, caller-supplied size
#[derive(Clone, Copy, Debug)]
pub struct FixedBudget {
    total_bytes: u64,
    free_bytes: u64,
}

impl FixedBudget {
    /// Create a budget with the given total and free sizes
    pub fn new(total_bytes: u64, free_bytes: u64) -> Self {
        Self {
            total_bytes,
            free_bytes: free_bytes.min(total_bytes),
        }
    }

    /// A budget large enough that batching never kicks in (1 GiB)
    pub fn generous() -> Self {
        Self::new(1 << 30, 1 << 30)
    }
}

impl MemoryBudget for FixedBudget {
    fn query(&self) -> Result<MemoryInfo> {
        Ok(MemoryInfo {
            total_bytes: self.total_bytes,
            free_bytes: self.free_bytes,
        })
    }
}

/// Budget whose query always fails, for hosts with no memory introspection
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableBudget;

impl MemoryBudget for UnavailableBudget {
    fn query(&self) -> Result<MemoryInfo> {
        Err(CalibrateError::Environment(
            "device memory query is not available on this host".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_budget_query() {
        let budget = FixedBudget::new(1024, 512);
        let info = budget.query().unwrap();
        assert_eq!(info.total_bytes, 1024);
        assert_eq!(info.free_bytes, 512);
    }

    #[test]
    fn test_free_capped_by_total() {
        let budget = FixedBudget::new(1024, 4096);
        let info = budget.query().unwrap();
        assert_eq!(info.free_bytes, 1024);
    }

    #[test]
    fn test_budget_slice() {
        let info = MemoryInfo {
            total_bytes: 1000,
            free_bytes: 900,
        };
        assert_eq!(info.budget_slice(), 500);

        let info = MemoryInfo {
            total_bytes: 1000,
            free_bytes: 300,
        };
        assert_eq!(info.budget_slice(), 300);
    }

    #[test]
    fn test_unavailable_budget_errors() {
        let err = UnavailableBudget.query().unwrap_err();
        assert!(matches!(err, CalibrateError::Environment(_)));
    }
}
