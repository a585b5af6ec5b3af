//! Resource limits attached to profiles and isolation levels.

use serde::{Deserialize, Serialize};

use crate::error::{IsolatorError, Result};
use crate::utils::size::{format_size, parse_size};

/// Resource ceilings for one sandboxed process tree.
///
/// `None` means unlimited. Every field is ordered so that a smaller value is
/// more restrictive, which is what [`ResourceLimits::tighter`] relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResourceLimitSpec", into = "ResourceLimitSpec")]
pub struct ResourceLimits {
    /// Address-space ceiling in bytes.
    pub memory_limit: Option<u64>,
    /// CPU share as a percentage of one core, 1-100.
    pub cpu_limit: Option<u32>,
    /// Block I/O weight, 10-1000.
    pub io_weight: Option<u32>,
    pub max_processes: Option<u64>,
    pub max_files: Option<u64>,
    /// Largest file the process may create, in bytes.
    pub max_file_size: Option<u64>,
}

/// The textual form used by profile documents and CLI flags.
///
/// Sizes may be written as `"2G"` or as plain integers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<LimitValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<LimitValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_weight: Option<LimitValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<LimitValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<LimitValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<LimitValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitValue {
    Number(u64),
    Text(String),
}

impl LimitValue {
    fn as_size(&self, field: &str) -> Result<u64> {
        match self {
            Self::Number(0) => Err(invalid(field, "0")),
            Self::Number(n) => Ok(*n),
            Self::Text(s) => parse_size(s).map_err(|_| invalid(field, s)),
        }
    }

    fn as_count(&self, field: &str) -> Result<u64> {
        let value = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().map_err(|_| invalid(field, s))?,
        };
        if value == 0 {
            return Err(invalid(field, "0"));
        }
        Ok(value)
    }

    fn as_ranged(&self, field: &str, range: std::ops::RangeInclusive<u32>) -> Result<u32> {
        let value = self.as_count(field)?;
        u32::try_from(value)
            .ok()
            .filter(|v| range.contains(v))
            .ok_or_else(|| {
                IsolatorError::InvalidOverride(format!(
                    "{field} must be between {} and {}, got {value}",
                    range.start(),
                    range.end()
                ))
            })
    }
}

fn invalid(field: &str, value: &str) -> IsolatorError {
    IsolatorError::InvalidOverride(format!("malformed {field} value '{value}'"))
}

impl TryFrom<ResourceLimitSpec> for ResourceLimits {
    type Error = IsolatorError;

    fn try_from(spec: ResourceLimitSpec) -> Result<Self> {
        Ok(Self {
            memory_limit: spec
                .memory_limit
                .map(|v| v.as_size("memory_limit"))
                .transpose()?,
            cpu_limit: spec
                .cpu_limit
                .map(|v| v.as_ranged("cpu_limit", 1..=100))
                .transpose()?,
            io_weight: spec
                .io_weight
                .map(|v| v.as_ranged("io_weight", 10..=1000))
                .transpose()?,
            max_processes: spec
                .max_processes
                .map(|v| v.as_count("max_processes"))
                .transpose()?,
            max_files: spec
                .max_files
                .map(|v| v.as_count("max_files"))
                .transpose()?,
            max_file_size: spec
                .max_file_size
                .map(|v| v.as_size("max_file_size"))
                .transpose()?,
        })
    }
}

impl From<ResourceLimits> for ResourceLimitSpec {
    fn from(limits: ResourceLimits) -> Self {
        Self {
            memory_limit: limits.memory_limit.map(|b| LimitValue::Text(format_size(b))),
            cpu_limit: limits.cpu_limit.map(|v| LimitValue::Number(v.into())),
            io_weight: limits.io_weight.map(|v| LimitValue::Number(v.into())),
            max_processes: limits.max_processes.map(LimitValue::Number),
            max_files: limits.max_files.map(LimitValue::Number),
            max_file_size: limits.max_file_size.map(|b| LimitValue::Text(format_size(b))),
        }
    }
}

fn tighter_of<T: Ord + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl ResourceLimits {
    /// Per-field overlay: values set in `other` replace values in `self`.
    pub fn overlay(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_limit: other.memory_limit.or(self.memory_limit),
            cpu_limit: other.cpu_limit.or(self.cpu_limit),
            io_weight: other.io_weight.or(self.io_weight),
            max_processes: other.max_processes.or(self.max_processes),
            max_files: other.max_files.or(self.max_files),
            max_file_size: other.max_file_size.or(self.max_file_size),
        }
    }

    /// Per-field minimum, treating `None` as unlimited.
    ///
    /// The result is never looser than either input for any field.
    pub fn tighter(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_limit: tighter_of(self.memory_limit, other.memory_limit),
            cpu_limit: tighter_of(self.cpu_limit, other.cpu_limit),
            io_weight: tighter_of(self.io_weight, other.io_weight),
            max_processes: tighter_of(self.max_processes, other.max_processes),
            max_files: tighter_of(self.max_files, other.max_files),
            max_file_size: tighter_of(self.max_file_size, other.max_file_size),
        }
    }
}
