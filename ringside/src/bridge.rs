use std::{collections::HashSet, fmt};

use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;
use zbus::{Connection, MatchRule, Message, MessageStream, message::Type as MessageType};

use crate::{Device, Error, Event, EventSink, Result, Value, kinds, value::body_args};

/// A bus signal decoded into host values.
#[derive(Debug, Clone, PartialEq)]
pub struct BusSignal {
    path: String,
    member: String,
    interface: Option<String>,
    args: Vec<Value>,
}

impl BusSignal {
    pub fn new(path: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            member: member.into(),
            interface: None,
            args: Vec::new(),
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Decode a signal message. Arguments are unwrapped from their wire
    /// types; byte arrays stay raw.
    pub fn from_message(message: &Message) -> Result<Self> {
        let header = message.header();
        let path = header.path().map(|p| p.as_str().to_owned()).unwrap_or_default();
        let member = header.member().map(|m| m.as_str().to_owned()).unwrap_or_default();
        let interface = header.interface().map(|i| i.as_str().to_owned());
        Ok(Self {
            path,
            member,
            interface,
            args: body_args(message)?,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    fn into_event(self, route: &Route) -> Event {
        let kind = match route {
            Route::Bus => kinds::DBUS_SIGNAL,
            Route::Device(_) => kinds::MODEM_SIGNAL,
        };
        let mut event = Event::new(kind)
            .with("path", self.path)
            .with("signal", self.member)
            .with("args", self.args);
        if let Some(interface) = self.interface {
            event = event.with("interface", interface);
        }
        if let Route::Device(device) = route {
            event = event.with("device", device.as_str());
        }
        event
    }
}

/// Which subscription a forwarded signal came through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The catch-all subscription: produces `dbus-signal` events.
    Bus,
    /// A per-device subscription: produces `modem-signal` events tagged
    /// with the device name.
    Device(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Bus => f.write_str("bus"),
            Route::Device(name) => write!(f, "device {name}"),
        }
    }
}

/// Turns bus signals into events on the queue.
///
/// Every subscription runs as its own forwarding task appending through an
/// [`EventSink`]. The bridge is purely a producer: it never looks at the
/// queue and holds nothing but its tasks.
pub struct SignalBridge {
    sink: EventSink,
    tasks: Vec<JoinHandle<()>>,
    devices: HashSet<String>,
}

impl SignalBridge {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            tasks: Vec::new(),
            devices: HashSet::new(),
        }
    }

    /// Subscribe to every signal on `conn`, whatever its path, interface or
    /// member. Each becomes a `dbus-signal` event.
    pub async fn subscribe_all(&mut self, conn: &Connection) -> Result {
        let rule = MatchRule::builder().msg_type(MessageType::Signal).build();
        let stream = MessageStream::for_match_rule(rule, conn, None).await?;
        self.forward(Route::Bus, decoded(stream));
        tracing::debug!("subscribed to all bus signals");
        Ok(())
    }

    /// Subscribe to signals emitted on the device's object path. Each
    /// becomes a `modem-signal` event carrying `device`. Subscribing the
    /// same device twice does nothing.
    pub async fn subscribe_device(&mut self, conn: &Connection, device: &Device) -> Result {
        if self.devices.contains(device.name()) {
            return Ok(());
        }
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .path(device.object_path())?
            .build();
        let stream = MessageStream::for_match_rule(rule, conn, None).await?;
        self.forward(Route::Device(device.name().to_owned()), decoded(stream));
        self.devices.insert(device.name().to_owned());
        tracing::debug!(device = %device.name(), "subscribed to device signals");
        Ok(())
    }

    /// Spawn a task that converts every signal from `signals` into an event
    /// for `route`. The task ends with the stream or on
    /// [`shutdown`](Self::shutdown).
    pub fn forward<S>(&mut self, route: Route, signals: S)
    where
        S: Stream<Item = BusSignal> + Send + 'static,
    {
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            let mut signals = std::pin::pin!(signals);
            while let Some(signal) = signals.next().await {
                tracing::trace!(%route, path = %signal.path, member = %signal.member, "signal");
                sink.append(signal.into_event(&route));
            }
            tracing::debug!(%route, "signal stream ended");
        });
        self.tasks.push(task);
    }

    /// Number of subscriptions still forwarding.
    pub fn active(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Abort every forwarding task.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.devices.clear();
    }
}

impl fmt::Debug for SignalBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBridge")
            .field("tasks", &self.tasks.len())
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn decoded(stream: MessageStream) -> impl Stream<Item = BusSignal> + Send + 'static {
    stream.filter_map(|message| async move {
        match message.map_err(Error::from).and_then(|m| BusSignal::from_message(&m)) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable signal");
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;

    use super::*;
    use crate::{Config, EventQueue, Pattern};

    fn signal<B>(member: &str, body: &B) -> Message
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        Message::signal("/phonesim", "org.ofono.Modem", member)
            .unwrap()
            .build(body)
            .unwrap()
    }

    #[test]
    fn decodes_signal_messages() {
        let powered = signal("PropertyChanged", &("Powered", zbus::zvariant::Value::Bool(true)));
        let decoded = BusSignal::from_message(&powered).unwrap();
        assert_eq!(decoded.path(), "/phonesim");
        assert_eq!(decoded.member(), "PropertyChanged");
        assert_eq!(decoded.interface(), Some("org.ofono.Modem"));
        assert_eq!(decoded.args(), &[Value::from("Powered"), Value::Bool(true)]);

        let status = signal("StatusChanged", &(0u32, 1u32));
        let decoded = BusSignal::from_message(&status).unwrap();
        assert_eq!(decoded.args(), &[Value::UInt(0), Value::UInt(1)]);

        let raw = signal("Raw", &(vec![104u8, 105u8],));
        let decoded = BusSignal::from_message(&raw).unwrap();
        assert_eq!(decoded.args(), &[Value::Bytes(b"hi".to_vec())]);

        let empty = signal("Ping", &());
        assert!(BusSignal::from_message(&empty).unwrap().args().is_empty());
    }

    fn property_changed(path: &str, name: &str, value: impl Into<Value>) -> BusSignal {
        BusSignal::new(path, "PropertyChanged")
            .with_interface("org.ofono.Modem")
            .with_args(vec![Value::from(name), value.into()])
    }

    #[tokio::test]
    async fn bus_route_produces_dbus_signals() {
        let mut queue = EventQueue::new(&Config::default());
        let mut bridge = SignalBridge::new(queue.sink());
        bridge.forward(
            Route::Bus,
            stream::iter([BusSignal::new("/org/ofono/sms", "StatusChanged")
                .with_interface("org.ofono.Message")
                .with_args(vec![Value::from("sent")])]),
        );

        let event = queue
            .expect(Pattern::new(kinds::DBUS_SIGNAL).field("signal", "StatusChanged"))
            .await
            .unwrap();
        assert_eq!(event.get_str("path"), Some("/org/ofono/sms"));
        assert_eq!(event.get_str("interface"), Some("org.ofono.Message"));
        assert_eq!(event.arg(0), Some(&Value::from("sent")));
        assert!(event.get("device").is_none());
    }

    #[tokio::test]
    async fn device_routes_tag_their_device() {
        let mut queue = EventQueue::new(&Config::default());
        let mut bridge = SignalBridge::new(queue.sink());
        for name in ["phonesim", "phonesim2"] {
            let path = format!("/{name}");
            bridge.forward(
                Route::Device(name.to_owned()),
                stream::iter([property_changed(&path, "Powered", true)]),
            );
        }

        let mut devices: Vec<String> = Vec::new();
        for _ in 0..2 {
            let event = queue
                .expect(Pattern::new(kinds::MODEM_SIGNAL).field("signal", "PropertyChanged"))
                .await
                .unwrap();
            let device = event.get_str("device").unwrap().to_owned();
            assert_eq!(event.get_str("path"), Some(format!("/{device}").as_str()));
            devices.push(device);
        }
        devices.sort();
        assert_eq!(devices, vec!["phonesim", "phonesim2"]);
    }

    #[tokio::test]
    async fn shutdown_stops_forwarding() {
        let mut queue = EventQueue::new(&Config::default());
        let mut bridge = SignalBridge::new(queue.sink());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        bridge.forward(Route::Bus, receiver_stream(rx));
        assert_eq!(bridge.active(), 1);

        bridge.shutdown();
        assert_eq!(bridge.active(), 0);
        let _ = tx.send(BusSignal::new("/", "Late"));

        let result = queue
            .expect(kinds::DBUS_SIGNAL)
            .within(Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    fn receiver_stream(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<BusSignal>,
    ) -> impl Stream<Item = BusSignal> + Send + 'static {
        stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}
