//! Errors raised by the simulation harness.

use gatehost_core::LifecycleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("no replica at index {0}")]
    NoSuchReplica(usize),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
