//! Isolation boundary for collaborator code.
//!
//! Packet handlers, construct updates and animation predicates are foreign
//! code from the point of view of the scheduler. A failure in one of them,
//! whether an `Err` or a panic, is folded into a [`Fault`] so the caller can
//! log it and move on to the next item.

use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// A recovered failure of collaborator code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Fault {
    /// The callee returned an error.
    #[error("{0}")]
    Failed(String),

    /// The callee panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl Fault {
    pub fn failed(reason: impl Display) -> Self {
        Fault::Failed(reason.to_string())
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panicked(_))
    }
}

/// Runs `f`, converting both its error and any panic into a [`Fault`].
pub fn isolate<T, E, F>(f: F) -> Result<T, Fault>
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Fault::failed(e)),
        Err(payload) => Err(Fault::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
