//! Event matching for expectations.

use std::{borrow::Cow, fmt, sync::Arc};

use crate::{Event, Value};

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A declarative matcher selecting which events satisfy an expectation.
///
/// A pattern matches an event when:
/// - the kinds are equal,
/// - every field constraint holds (attribute present and equal), and
/// - the predicate, if any, returns `true`.
///
/// # Example
///
/// ```rust
/// use ringside::{Event, Pattern};
///
/// let pattern = Pattern::new("modem-signal")
///     .field("signal", "PropertyChanged")
///     .predicate(|e| e.arg(0).and_then(|a| a.as_str()) == Some("Interfaces"));
///
/// let event = Event::new("modem-signal")
///     .with("signal", "PropertyChanged")
///     .with("args", vec!["Interfaces"]);
/// assert!(pattern.matches(&event));
///
/// // A bare kind converts into a pattern
/// let any_return: Pattern = "dbus-return".into();
/// assert!(!any_return.matches(&event));
/// ```
#[derive(Clone)]
pub struct Pattern {
    kind: Cow<'static, str>,
    fields: Vec<(String, Value)>,
    predicate: Option<Predicate>,
}

impl Pattern {
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
            predicate: None,
        }
    }

    /// Require attribute `key` to equal `value`.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Require `predicate` to hold. Replaces any earlier predicate.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn matches(&self, event: &Event) -> bool {
        event.kind() == self.kind
            && self
                .fields
                .iter()
                .all(|(key, expected)| event.get(key) == Some(expected))
            && self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{key}={value}")?;
        }
        if self.predicate.is_some() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str("<predicate>")?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl From<&'static str> for Pattern {
    fn from(kind: &'static str) -> Self {
        Pattern::new(kind)
    }
}

impl From<String> for Pattern {
    fn from(kind: String) -> Self {
        Pattern::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_changed(status: u32, reason: u32) -> Event {
        Event::new("dbus-signal")
            .with("signal", "StatusChanged")
            .with("args", vec![status, reason])
    }

    #[test]
    fn kind_must_match_exactly() {
        let event = status_changed(0, 1);
        assert!(Pattern::new("dbus-signal").matches(&event));
        assert!(!Pattern::new("modem-signal").matches(&event));
        assert!(!Pattern::new("dbus").matches(&event));
    }

    #[test]
    fn all_field_constraints_must_hold() {
        let event = status_changed(0, 1);
        let pattern = Pattern::new("dbus-signal")
            .field("signal", "StatusChanged")
            .field("args", vec![0, 1]);
        assert!(pattern.matches(&event));

        let wrong_args = Pattern::new("dbus-signal")
            .field("signal", "StatusChanged")
            .field("args", vec![2, 1]);
        assert!(!wrong_args.matches(&event));
    }

    #[test]
    fn constraint_on_missing_attribute_fails() {
        let event = status_changed(0, 1);
        let pattern = Pattern::new("dbus-signal").field("path", "/somewhere");
        assert!(!pattern.matches(&event));
    }

    #[test]
    fn predicate_is_checked_after_fields() {
        let event = status_changed(2, 1);
        let disconnected = Pattern::new("dbus-signal")
            .field("signal", "StatusChanged")
            .predicate(|e| e.arg(0) == Some(&Value::from(2u32)));
        assert!(disconnected.matches(&event));

        let connected = disconnected.clone().predicate(|e| e.arg(0) == Some(&Value::from(0u32)));
        assert!(!connected.matches(&event));
    }

    #[test]
    fn display_names_kind_fields_and_predicate() {
        let pattern = Pattern::new("dbus-return")
            .field("method", "Disconnect")
            .predicate(|_| true);
        assert_eq!(
            pattern.to_string(),
            "dbus-return(method='Disconnect', <predicate>)"
        );
        assert_eq!(Pattern::from("dbus-signal").to_string(), "dbus-signal()");
    }
}
