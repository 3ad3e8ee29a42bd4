use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{BringupState, Event};

/// The single error type for all ringside operations.
///
/// Every fallible API returns `ringside::Result<T>` (alias for
/// `Result<T, ringside::Error>`). Errors from lower layers (bus, IO) are
/// mapped into variants of this enum and wrapped in `Arc` so the error stays
/// `Clone`.
///
/// Failed simulator connection attempts never appear here: the retry loop
/// absorbs them, and a simulator that never comes up surfaces as a
/// [`Timeout`](Error::Timeout) on the consumer's side.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("timed out after {waited:?} waiting for {pattern}{}", summarize(.unmatched))]
    Timeout {
        pattern: String,
        waited: Duration,
        /// Most recent events that were buffered but matched nothing.
        unmatched: Vec<Event>,
    },

    #[error("forbidden event {event} arrived (forbidden by {pattern})")]
    Forbidden { pattern: String, event: Box<Event> },

    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A check inside a test case did not hold.
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("bring-up failed while {state}: {source}")]
    Bringup {
        state: BringupState,
        source: Box<Error>,
    },

    #[error("{}:{line}: {reason}", .path.display())]
    Config {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Bus error: {0}")]
    Bus(#[source] Arc<zbus::Error>),

    #[error("IO error: {0}")]
    IoError(#[source] Arc<std::io::Error>),

    #[error("Internal ringside error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// The innermost error, looking through bring-up wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Bringup { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }
}

fn summarize(unmatched: &[Event]) -> String {
    if unmatched.is_empty() {
        return String::from("; no unmatched events pending");
    }
    let mut out = format!("; {} unmatched event(s) pending:", unmatched.len());
    for event in unmatched {
        out.push_str("\n    ");
        out.push_str(&event.to_string());
    }
    out
}

impl From<zbus::Error> for Error {
    fn from(e: zbus::Error) -> Self {
        Error::Bus(Arc::new(e))
    }
}

impl From<zbus::fdo::Error> for Error {
    fn from(e: zbus::fdo::Error) -> Self {
        Error::Bus(Arc::new(e.into()))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(Arc::new(e))
    }
}
