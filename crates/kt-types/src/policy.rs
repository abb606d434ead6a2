//! Policy records: one row of the shared optimization-settings table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::PolicyError;

/// Field separator of the policy table.
pub const POLICY_SEPARATOR: char = ',';

/// The persisted optimization settings of a single kernel.
///
/// `settings` holds the textual tokens in the fixed column order of the
/// parameter space. Tokens may be empty (an "absent" flag).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub kernel: String,
    pub settings: Vec<String>,
}

impl PolicyRecord {
    pub fn new(kernel: impl Into<String>, settings: Vec<String>) -> Self {
        Self {
            kernel: kernel.into(),
            settings,
        }
    }

    /// Parse one table line. `columns` is the expected number of setting
    /// tokens, when known.
    pub fn parse_line(row: usize, line: &str, columns: Option<usize>) -> Result<Self, PolicyError> {
        let line = line.trim();
        let mut tokens = line.split(POLICY_SEPARATOR);
        let kernel = tokens.next().unwrap_or_default().trim();
        if kernel.is_empty() {
            return Err(PolicyError::MalformedRow {
                row,
                message: "missing kernel name".to_string(),
            });
        }

        let settings: Vec<String> = tokens.map(|t| t.trim().to_string()).collect();
        if let Some(expected) = columns {
            if settings.len() != expected {
                return Err(PolicyError::MalformedRow {
                    row,
                    message: format!(
                        "{kernel} has {} settings, expected {expected}",
                        settings.len()
                    ),
                });
            }
        }

        Ok(Self {
            kernel: kernel.to_string(),
            settings,
        })
    }

    /// Kernel name of a raw line without parsing the settings.
    pub fn kernel_of(line: &str) -> &str {
        line.split(POLICY_SEPARATOR).next().unwrap_or_default().trim()
    }

    /// The settings joined the way the table stores them.
    pub fn settings_line(&self) -> String {
        self.settings.join(&POLICY_SEPARATOR.to_string())
    }

    /// Full table line, newline terminated.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for PolicyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.settings.is_empty() {
            write!(f, "{}", self.kernel)
        } else {
            write!(f, "{}{POLICY_SEPARATOR}{}", self.kernel, self.settings_line())
        }
    }
}
