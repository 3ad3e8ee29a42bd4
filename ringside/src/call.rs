use serde::Serialize;
use tokio::task::JoinHandle;
use zbus::{Connection, zvariant::DynamicType};

use crate::{Event, EventSink, Value, kinds, value::body_args};

/// Addressing of one remote method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub method: String,
}

impl MethodCall {
    pub fn new(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface: interface.into(),
            method: method.into(),
        }
    }

    fn returned(&self, value: Vec<Value>) -> Event {
        Event::new(kinds::DBUS_RETURN)
            .with("method", self.method.as_str())
            .with("path", self.path.as_str())
            .with("interface", self.interface.as_str())
            .with("value", value)
    }

    fn failed(&self, error: &zbus::Error) -> Event {
        let (name, message) = match error {
            zbus::Error::MethodError(name, message, _) => {
                (name.as_str().to_owned(), message.clone().unwrap_or_default())
            }
            other => ("org.freedesktop.DBus.Error.Failed".to_owned(), other.to_string()),
        };
        Event::new(kinds::DBUS_ERROR)
            .with("method", self.method.as_str())
            .with("path", self.path.as_str())
            .with("interface", self.interface.as_str())
            .with("error", name)
            .with("message", message)
    }
}

/// Issue `call` on `conn` in the background.
///
/// The reply lands on the queue as a `dbus-return` event (`value` holds the
/// unwrapped reply arguments) or a `dbus-error` event (`error` is the error
/// name, `message` its text). The caller never blocks on the call itself and
/// observes the outcome through an expectation.
///
/// The returned handle is only needed to wait for the append itself.
pub fn call_async<B>(sink: &EventSink, conn: &Connection, call: MethodCall, body: B) -> JoinHandle<()>
where
    B: Serialize + DynamicType + Send + Sync + 'static,
{
    let sink = sink.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        tracing::debug!(method = %call.method, path = %call.path, "calling");
        let reply = conn
            .call_method(
                Some(call.destination.as_str()),
                call.path.as_str(),
                Some(call.interface.as_str()),
                call.method.as_str(),
                &body,
            )
            .await;
        let event = match reply.and_then(|message| body_args(&message)) {
            Ok(value) => call.returned(value),
            Err(e) => {
                tracing::debug!(method = %call.method, error = %e, "call failed");
                call.failed(&e)
            }
        };
        sink.append(event);
    })
}
