//! Queue priority levels.
//!
//! A queue's priority decides the order in which a thread pool serves pending work when
//! several queues share the pool: `Max` work is taken before `Norm`, `Norm` before `Min`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Priority of a queue's work inside a thread pool.
///
/// # Examples
///
/// ```rust
/// use jobmesh::JobPriority;
/// use std::str::FromStr;
///
/// let priority = JobPriority::from_str("max").unwrap();
/// assert_eq!(priority, JobPriority::Max);
/// assert!(JobPriority::Max > JobPriority::Norm);
/// assert!(JobPriority::Norm > JobPriority::Min);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
    #[serde(alias = "min")]
    Min = 0,

    #[default]
    #[serde(alias = "norm", alias = "NORMAL", alias = "normal")]
    Norm = 1,

    #[serde(alias = "max")]
    Max = 2,
}

impl JobPriority {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Result<Self, PriorityError> {
        match value {
            0 => Ok(JobPriority::Min),
            1 => Ok(JobPriority::Norm),
            2 => Ok(JobPriority::Max),
            _ => Err(PriorityError::InvalidPriorityValue(value)),
        }
    }

    /// Index into per-priority pending lanes, highest priority first.
    pub(crate) fn lane(self) -> usize {
        match self {
            JobPriority::Max => 0,
            JobPriority::Norm => 1,
            JobPriority::Min => 2,
        }
    }

    /// All levels in the order pending work is served.
    pub fn serving_order() -> [JobPriority; 3] {
        [JobPriority::Max, JobPriority::Norm, JobPriority::Min]
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Min => write!(f, "MIN"),
            JobPriority::Norm => write!(f, "NORM"),
            JobPriority::Max => write!(f, "MAX"),
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "min" | "low" => Ok(JobPriority::Min),
            "norm" | "normal" | "default" => Ok(JobPriority::Norm),
            "max" | "high" => Ok(JobPriority::Max),
            _ => Err(PriorityError::InvalidPriorityString(s.to_string())),
        }
    }
}

/// Errors related to priority handling
#[derive(Error, Debug)]
pub enum PriorityError {
    #[error("Invalid priority value: {0}. Must be between 0 and 2")]
    InvalidPriorityValue(i32),

    #[error("Invalid priority string: '{0}'. Valid values are: min, norm, max")]
    InvalidPriorityString(String),
}
