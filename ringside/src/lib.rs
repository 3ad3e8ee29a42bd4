#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Ringside
//!
//! An event expectation harness for black-box testing of bus-driven
//! telephony services, built on Tokio and zbus.
//!
//! A test issues an action (a method call, a simulator command) and then
//! waits for the effect to show up as an [`Event`]. Every asynchronous
//! source (bus signals, simulator processes, background method calls)
//! appends to one [`EventQueue`]; the test consumes matching events in
//! arrival order through [`Pattern`]-based expectations with timeouts.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use ringside::{Config, Event, EventQueue, Pattern, Value};
//!
//! #[tokio::main]
//! async fn main() -> ringside::Result {
//!     let mut queue = EventQueue::new(&Config::default());
//!     let sink = queue.sink();
//!
//!     tokio::spawn(async move {
//!         sink.append(Event::new("modem-signal").with("signal", "PropertyChanged")
//!             .with("args", vec![Value::from("Powered"), Value::from(true)]));
//!     });
//!
//!     let event = queue
//!         .expect(Pattern::new("modem-signal").field("signal", "PropertyChanged"))
//!         .within(Duration::from_secs(1))
//!         .await?;
//!     assert_eq!(event.arg(1), Some(&Value::from(true)));
//!     Ok(())
//! }
//! ```
//!
//! ## Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Event`] | Immutable `kind` plus attribute map |
//! | [`Pattern`] | Kind, exact field constraints and an optional predicate |
//! | [`EventQueue`] | Ordered buffer with `expect` / `expect_many` |
//! | [`EventSink`] | Producer handle for appending to a queue |
//! | [`SimulatorProcess`] | Simulator subprocess plus connect-retry loop |
//! | [`SignalBridge`] | Bus signals to `dbus-signal` / `modem-signal` events |
//! | [`DeviceBringup`] | Power-on, online and interface readiness sequence |
//! | [`Harness`] | Owns everything for one test run and cleans up after it |
//!
//! ## Matching
//!
//! Waits take the earliest buffered event that matches and leave everything
//! else in place, so tests may expect a subsequence of what actually
//! happened. [`EventQueue::expect_many`] waits for several events in any
//! order. A wait that times out consumes nothing.
//!
//! ## Diagnostics
//!
//! Everything is logged through `tracing`. Setting [`VERBOSE_ENV`] (or
//! [`Config::with_verbose`]) additionally echoes every observed event to
//! stdout, tagged `handled` or `not handled`.
//!
//! ## Examples
//!
//! See the `examples/` directory:
//!
//! - `bringup.rs` - bring the first simulated modem online
//! - `send_message.rs` - send an SMS through the service under test and
//!   wait for its status change

mod bringup;
mod bridge;
mod call;
mod config;
mod device;
mod echo;
mod error;
mod event;
mod event_queue;
mod event_sink;
mod expectation;
mod harness;
mod pattern;
mod simulator;
mod value;

pub use bringup::{BringupState, DeviceBringup, ModemControl, OfonoModem};
pub use bridge::{BusSignal, Route, SignalBridge};
pub use call::{MethodCall, call_async};
pub use config::{Config, VERBOSE_ENV};
pub use device::{Device, DeviceTable, ModemManager, OfonoManager};
pub use error::Error;
pub use event::{Event, kinds};
pub use event_queue::{EventQueue, ForbidId};
pub use event_sink::EventSink;
pub use expectation::Expectation;
pub use harness::{ExitOnPrecondition, Harness, Session, Summary};
pub use pattern::Pattern;
pub use simulator::{SimConnection, SimulatorProcess};
pub use value::{Handle, Value};

/// Convenience alias for `Result<T, ringside::Error>`.
pub type Result<T = ()> = std::result::Result<T, Error>;
