//! Pattern ledger storage configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct LedgerConfig {
    /// Root directory of the commit store.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Branch created with the root commit.
    #[validate(custom(function = validation::validate_branch_name))]
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Upper bound on history walks (retention of the reporting views).
    #[validate(range(min = 1, max = 1_000_000))]
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_root() -> PathBuf {
    PathBuf::from("pattern_ledger")
}
fn default_branch() -> String {
    "main".into()
}
fn default_history_limit() -> usize {
    1000
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            default_branch: default_branch(),
            history_limit: default_history_limit(),
        }
    }
}
