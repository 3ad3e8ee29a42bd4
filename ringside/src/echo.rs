use std::io::{IsTerminal, Write};

use colored::Colorize;

use crate::Event;

/// Diagnostic echo of every event the queue observes.
///
/// Each event is logged to `tracing` (`debug` when a wait claimed it,
/// `trace` otherwise). In verbose mode it is also written to stdout followed
/// by a `handled` / `not handled` tag, coloured green / red when stdout is a
/// terminal. The tag is cosmetic and has no effect on matching.
#[derive(Debug, Clone)]
pub(crate) struct Echo {
    verbose: bool,
    colour: bool,
    observed: u64,
}

impl Echo {
    pub(crate) fn new(verbose: bool) -> Self {
        Self {
            verbose,
            colour: std::io::stdout().is_terminal(),
            observed: 0,
        }
    }

    pub(crate) fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub(crate) fn verbose(&self) -> bool {
        self.verbose
    }

    /// Number of events echoed so far.
    pub(crate) fn observed(&self) -> u64 {
        self.observed
    }

    pub(crate) fn observe(&mut self, event: &Event, handled: bool) {
        self.observed += 1;
        if handled {
            tracing::debug!(kind = %event.kind(), event = %event, "event handled");
        } else {
            tracing::trace!(kind = %event.kind(), event = %event, "event not handled");
        }

        if !self.verbose {
            return;
        }
        let line = self.render(event, handled);
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }

    fn render(&self, event: &Event, handled: bool) -> String {
        let tag = if handled { "handled" } else { "not handled" };
        let tag = match (self.colour, handled) {
            (false, _) => tag.to_string(),
            (true, true) => tag.green().to_string(),
            (true, false) => tag.red().to_string(),
        };
        format!("{event}\n    {tag}")
    }
}
