use std::{fmt, time::Duration};

use zbus::{Connection, zvariant};

use crate::{
    Config, Device, Error, Event, EventQueue, Pattern, Result, SignalBridge, SimulatorProcess,
    Value, kinds,
};

/// Progress of a [`DeviceBringup`].
///
/// ```text
/// Stopped -> ProcessStarting -> ProcessConnected -> PoweringOn -> OnlinePending -> InterfacesReady
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BringupState {
    #[default]
    Stopped,
    ProcessStarting,
    ProcessConnected,
    PoweringOn,
    OnlinePending,
    InterfacesReady,
}

impl fmt::Display for BringupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BringupState::Stopped => "stopped",
            BringupState::ProcessStarting => "starting the simulator",
            BringupState::ProcessConnected => "simulator connected",
            BringupState::PoweringOn => "powering on",
            BringupState::OnlinePending => "going online",
            BringupState::InterfacesReady => "interfaces ready",
        })
    }
}

/// Control surface of the modem daemon for one device.
pub trait ModemControl {
    fn device(&self) -> &Device;

    /// Route this device's signals into the queue.
    fn watch(&self, bridge: &mut SignalBridge) -> impl Future<Output = Result> + Send;

    /// Set a boolean modem property such as `Powered` or `Online`.
    fn set_property(&self, name: &str, value: bool) -> impl Future<Output = Result> + Send;
}

/// [`ModemControl`] through the ofono `Modem` interface on the system bus.
#[derive(Debug, Clone)]
pub struct OfonoModem {
    conn: Connection,
    service: String,
    device: Device,
}

impl OfonoModem {
    pub fn new(conn: Connection, service: impl Into<String>, device: Device) -> Self {
        Self {
            conn,
            service: service.into(),
            device,
        }
    }
}

impl ModemControl for OfonoModem {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn watch(&self, bridge: &mut SignalBridge) -> Result {
        bridge.subscribe_device(&self.conn, &self.device).await
    }

    async fn set_property(&self, name: &str, value: bool) -> Result {
        self.conn
            .call_method(
                Some(self.service.as_str()),
                self.device.object_path().as_str(),
                Some("org.ofono.Modem"),
                "SetProperty",
                &(name, zvariant::Value::Bool(value)),
            )
            .await?;
        Ok(())
    }
}

/// Brings one simulated device to a usable state.
///
/// The sequence is scripted: subscribe to the device's signals, start its
/// simulator and wait for the connection, power it on, put it online, then
/// wait until the modem reports every required interface. Each wait uses
/// the configured bring-up timeout. Any failure is terminal and comes back
/// as [`Error::Bringup`] naming the state reached; nothing is retried.
///
/// Only signals carrying this device's identity count, so several devices
/// can be brought up against the same queue.
pub struct DeviceBringup<M> {
    modem: M,
    state: BringupState,
    timeout: Duration,
    required_interfaces: Vec<String>,
}

impl<M: ModemControl> DeviceBringup<M> {
    pub fn new(modem: M, config: &Config) -> Self {
        Self {
            modem,
            state: BringupState::Stopped,
            timeout: config.bringup_timeout(),
            required_interfaces: config.required_interfaces().to_vec(),
        }
    }

    #[inline]
    pub fn state(&self) -> BringupState {
        self.state
    }

    pub fn modem(&self) -> &M {
        &self.modem
    }

    /// Run the bring-up to completion.
    ///
    /// `simulator` must belong to the same device as the modem and append
    /// to `queue`.
    pub async fn run(
        &mut self,
        queue: &mut EventQueue,
        bridge: &mut SignalBridge,
        simulator: &mut SimulatorProcess,
    ) -> Result {
        if self.state != BringupState::Stopped {
            return Err(Error::Precondition(format!(
                "bring-up of {} already ran (state: {})",
                self.modem.device().name(),
                self.state
            )));
        }
        let device = self.modem.device().name().to_owned();
        tracing::info!(device = %device, "bringing up device");

        match self.steps(queue, bridge, simulator).await {
            Ok(()) => {
                tracing::info!(device = %device, "device ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(device = %device, state = %self.state, error = %e, "bring-up failed");
                Err(Error::Bringup {
                    state: self.state,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn steps(
        &mut self,
        queue: &mut EventQueue,
        bridge: &mut SignalBridge,
        simulator: &mut SimulatorProcess,
    ) -> Result {
        let device = self.modem.device().name().to_owned();

        self.modem.watch(bridge).await?;

        self.advance(BringupState::ProcessStarting);
        simulator.start()?;
        queue
            .expect(Pattern::new(kinds::PROCESS_CONNECTED).field("device", device.as_str()))
            .within(self.timeout)
            .await?;
        self.advance(BringupState::ProcessConnected);

        self.advance(BringupState::PoweringOn);
        self.modem.set_property("Powered", true).await?;
        queue
            .expect(property_changed(&device).field("args", vec![Value::from("Powered"), Value::from(true)]))
            .within(self.timeout)
            .await?;

        self.advance(BringupState::OnlinePending);
        self.modem.set_property("Online", true).await?;
        queue
            .expect(property_changed(&device).field("args", vec![Value::from("Online"), Value::from(true)]))
            .within(self.timeout)
            .await?;

        let required = self.required_interfaces.clone();
        queue
            .expect(
                property_changed(&device)
                    .predicate(move |event| interfaces_ready(event, &required)),
            )
            .within(self.timeout)
            .await?;

        self.advance(BringupState::InterfacesReady);
        Ok(())
    }

    fn advance(&mut self, next: BringupState) {
        tracing::debug!(device = %self.modem.device().name(), from = %self.state, to = %next, "bring-up");
        self.state = next;
    }
}

impl<M> fmt::Debug for DeviceBringup<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBringup")
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("required_interfaces", &self.required_interfaces)
            .finish_non_exhaustive()
    }
}

fn property_changed(device: &str) -> Pattern {
    Pattern::new(kinds::MODEM_SIGNAL)
        .field("signal", "PropertyChanged")
        .field("device", device)
}

/// `PropertyChanged("Interfaces", [...])` listing every required interface.
fn interfaces_ready(event: &Event, required: &[String]) -> bool {
    let (Some(name), Some(interfaces)) = (event.arg(0), event.arg(1)) else {
        return false;
    };
    name.as_str() == Some("Interfaces")
        && required
            .iter()
            .all(|iface| interfaces.contains(&Value::from(iface)))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::net::TcpListener;

    use super::*;
    use crate::EventSink;

    /// Answers property writes with the signals a daemon would emit.
    struct FakeModem {
        device: Device,
        sink: EventSink,
        interfaces: Vec<&'static str>,
        flicker_power: bool,
        writes: Mutex<Vec<(String, bool)>>,
    }

    impl FakeModem {
        fn new(device: Device, sink: EventSink) -> Self {
            Self {
                device,
                sink,
                interfaces: vec!["org.ofono.SimManager", "org.ofono.MessageManager"],
                flicker_power: false,
                writes: Mutex::new(Vec::new()),
            }
        }

        fn signal(&self, args: Vec<Value>) {
            self.sink.append(
                Event::new(kinds::MODEM_SIGNAL)
                    .with("signal", "PropertyChanged")
                    .with("path", self.device.object_path())
                    .with("device", self.device.name())
                    .with("args", args),
            );
        }
    }

    impl ModemControl for FakeModem {
        fn device(&self) -> &Device {
            &self.device
        }

        async fn watch(&self, _bridge: &mut SignalBridge) -> Result {
            Ok(())
        }

        async fn set_property(&self, name: &str, value: bool) -> Result {
            self.writes.lock().unwrap().push((name.to_owned(), value));
            if name == "Powered" && self.flicker_power {
                self.signal(vec![Value::from("Powered"), Value::from(false)]);
            }
            self.signal(vec![Value::from(name), Value::from(value)]);
            if name == "Online" {
                self.signal(vec![Value::from("Interfaces"), Value::from(self.interfaces.clone())]);
            }
            Ok(())
        }
    }

    struct Rig {
        queue: EventQueue,
        bridge: SignalBridge,
        simulator: SimulatorProcess,
        config: Config,
        _listener: TcpListener,
    }

    async fn rig(name: &str) -> Rig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::default()
            .with_simulator_executable("true")
            .with_retry_interval(Duration::from_millis(20))
            .with_bringup_timeout(Duration::from_secs(2));
        let queue = EventQueue::new(&config);
        let bridge = SignalBridge::new(queue.sink());
        let simulator = SimulatorProcess::new(Device::new(name, "127.0.0.1", port), &config, queue.sink());
        Rig {
            queue,
            bridge,
            simulator,
            config,
            _listener: listener,
        }
    }

    #[tokio::test]
    async fn reaches_interfaces_ready() {
        let mut rig = rig("phonesim").await;
        let modem = FakeModem::new(rig.simulator.device().clone(), rig.queue.sink());
        let mut bringup = DeviceBringup::new(modem, &rig.config);

        bringup
            .run(&mut rig.queue, &mut rig.bridge, &mut rig.simulator)
            .await
            .unwrap();
        assert_eq!(bringup.state(), BringupState::InterfacesReady);
        assert_eq!(
            *bringup.modem().writes.lock().unwrap(),
            vec![("Powered".to_owned(), true), ("Online".to_owned(), true)]
        );
        rig.simulator.stop().await;
    }

    #[tokio::test]
    async fn skips_transient_power_off() {
        let mut rig = rig("phonesim").await;
        let mut modem = FakeModem::new(rig.simulator.device().clone(), rig.queue.sink());
        modem.flicker_power = true;
        let mut bringup = DeviceBringup::new(modem, &rig.config);

        bringup
            .run(&mut rig.queue, &mut rig.bridge, &mut rig.simulator)
            .await
            .unwrap();

        // The Powered=false signal was never claimed.
        let leftover = rig.queue.try_take(property_changed("phonesim")).unwrap().unwrap();
        assert_eq!(leftover.arg(1), Some(&Value::from(false)));
        rig.simulator.stop().await;
    }

    #[tokio::test]
    async fn missing_interface_fails_while_going_online() {
        let mut rig = rig("phonesim").await;
        rig.config = rig
            .config
            .with_bringup_timeout(Duration::from_millis(200))
            .with_required_interfaces(["org.ofono.VoiceCallManager"]);
        let modem = FakeModem::new(rig.simulator.device().clone(), rig.queue.sink());
        let mut bringup = DeviceBringup::new(modem, &rig.config);

        let err = bringup
            .run(&mut rig.queue, &mut rig.bridge, &mut rig.simulator)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Bringup { state: BringupState::OnlinePending, .. }
        ));
        assert!(err.is_timeout());

        let again = bringup
            .run(&mut rig.queue, &mut rig.bridge, &mut rig.simulator)
            .await;
        assert!(matches!(again, Err(Error::Precondition(_))));
        rig.simulator.stop().await;
    }

    #[tokio::test]
    async fn ignores_other_devices_signals() {
        let mut rig = rig("phonesim").await;
        rig.config = rig.config.with_bringup_timeout(Duration::from_millis(200));
        let other = FakeModem::new(Device::new("phonesim2", "127.0.0.1", 1), rig.queue.sink());
        other.signal(vec![Value::from("Powered"), Value::from(true)]);

        struct Silent(Device);
        impl ModemControl for Silent {
            fn device(&self) -> &Device {
                &self.0
            }
            async fn watch(&self, _bridge: &mut SignalBridge) -> Result {
                Ok(())
            }
            async fn set_property(&self, _name: &str, _value: bool) -> Result {
                Ok(())
            }
        }

        let mut bringup = DeviceBringup::new(Silent(rig.simulator.device().clone()), &rig.config);
        let err = bringup
            .run(&mut rig.queue, &mut rig.bridge, &mut rig.simulator)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Bringup { state: BringupState::PoweringOn, .. }
        ));
        rig.simulator.stop().await;
    }

    #[test]
    fn interfaces_predicate_requires_all() {
        let event = Event::new(kinds::MODEM_SIGNAL).with(
            "args",
            vec![Value::from("Interfaces"), Value::from(vec!["a", "b"])],
        );
        assert!(interfaces_ready(&event, &["a".into()]));
        assert!(interfaces_ready(&event, &["a".into(), "b".into()]));
        assert!(!interfaces_ready(&event, &["c".into()]));

        let other = Event::new(kinds::MODEM_SIGNAL)
            .with("args", vec![Value::from("Features"), Value::from(vec!["a"])]);
        assert!(!interfaces_ready(&other, &["a".into()]));
    }
}
