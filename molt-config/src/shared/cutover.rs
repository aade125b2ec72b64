use serde::Deserialize;

use crate::shared::ValidationError;

/// Which cut-over protocol to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutOverKind {
    /// The three-session locking protocol; the swap is observed as a single
    /// instant.
    Atomic,
    /// Plain LOCK + RENAME with a brief window where the table does not
    /// exist.
    TwoStep,
}

impl Default for CutOverKind {
    fn default() -> Self {
        CutOverKind::Atomic
    }
}

/// Cut-over protocol tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CutOverConfig {
    #[serde(default)]
    pub kind: CutOverKind,
    /// Table lock wait budget per cut-over attempt, in seconds.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Whole cut-over attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keep postponing the cut-over until interactively released.
    #[serde(default)]
    pub postpone: bool,
    /// Postpone the cut-over while this file exists.
    #[serde(default)]
    pub postpone_flag_file: Option<String>,
    /// Require the table name as an argument to the interactive `unpostpone`
    /// command.
    #[serde(default)]
    pub force_named_cut_over: bool,
    /// Require the table name as an argument to the interactive `panic`
    /// command.
    #[serde(default)]
    pub force_named_panic: bool,
}

impl CutOverConfig {
    pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 3;
    pub const DEFAULT_MAX_RETRIES: u32 = 10;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.lock_timeout_secs == 0 {
            return Err(ValidationError::invalid(
                "cut_over.lock_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.max_retries == 0 {
            return Err(ValidationError::invalid(
                "cut_over.max_retries",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for CutOverConfig {
    fn default() -> Self {
        CutOverConfig {
            kind: CutOverKind::default(),
            lock_timeout_secs: default_lock_timeout_secs(),
            max_retries: default_max_retries(),
            postpone: false,
            postpone_flag_file: None,
            force_named_cut_over: false,
            force_named_panic: false,
        }
    }
}

fn default_lock_timeout_secs() -> u64 {
    CutOverConfig::DEFAULT_LOCK_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    CutOverConfig::DEFAULT_MAX_RETRIES
}
