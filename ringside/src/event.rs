use std::{borrow::Cow, collections::BTreeMap, fmt};

use crate::Value;

/// Kind tags of the events produced inside this crate.
pub mod kinds {
    /// A signal caught by the catch-all bus subscription.
    pub const DBUS_SIGNAL: &str = "dbus-signal";
    /// A signal emitted by one simulated device's object path.
    pub const MODEM_SIGNAL: &str = "modem-signal";
    /// A simulator subprocess accepted its control connection.
    pub const PROCESS_CONNECTED: &str = "process-connected";
    /// An asynchronous method call returned.
    pub const DBUS_RETURN: &str = "dbus-return";
    /// An asynchronous method call failed.
    pub const DBUS_ERROR: &str = "dbus-error";
}

/// An immutable occurrence record flowing through the
/// [`EventQueue`](crate::EventQueue).
///
/// An event is a `kind` tag plus an open-ended attribute map. Events are
/// assembled with the consuming [`with`](Self::with) builder and never
/// mutated afterwards; their only ordering is the order in which they were
/// appended to the queue.
///
/// # Example
///
/// ```rust
/// use ringside::{Event, Value};
///
/// let event = Event::new("dbus-signal")
///     .with("signal", "StatusChanged")
///     .with("args", vec![0u32, 1u32]);
///
/// assert_eq!(event.kind(), "dbus-signal");
/// assert_eq!(event.arg(1), Some(&Value::from(1u32)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: Cow<'static, str>,
    attributes: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Returns the event with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Shorthand for string-valued attributes such as `signal` or `path`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The positional argument list, empty when the event has none.
    pub fn args(&self) -> &[Value] {
        self.get("args").and_then(Value::as_list).unwrap_or_default()
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args().get(index)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, (k, v)) in self.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str(")")
    }
}
