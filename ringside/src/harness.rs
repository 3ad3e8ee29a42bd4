use std::{fmt, path::Path, time::Duration};

use serde::Serialize;
use tokio::task::JoinHandle;
use zbus::{Connection, zvariant::DynamicType};

use crate::{
    Config, Device, DeviceBringup, DeviceTable, Error, EventQueue, MethodCall, ModemManager,
    OfonoManager, OfonoModem, Result, SignalBridge, SimulatorProcess, call_async,
};

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// One test run against the modem daemon and its simulators.
///
/// The harness owns the [`EventQueue`], the [`SignalBridge`] and one
/// [`SimulatorProcess`] per selected device. Test cases borrow it through a
/// [`Session`]; [`finish`](Self::finish) tears everything down.
///
/// # Example
///
/// ```ignore
/// let mut harness = Harness::connect(Config::from_env()).await.exit_on_precondition();
/// harness.bring_online(0).await?;
///
/// harness
///     .run_case("send message", async |s| {
///         s.call(send_message(), ("+15551234", "hello"));
///         s.queue().expect("dbus-return").await?;
///         Ok(())
///     })
///     .await;
///
/// let summary = harness.finish().await;
/// ```
pub struct Harness {
    config: Config,
    queue: EventQueue,
    bridge: SignalBridge,
    session_bus: Connection,
    system_bus: Connection,
    simulators: Vec<SimulatorProcess>,
    online: Option<usize>,
    disconnects: Vec<MethodCall>,
    summary: Summary,
}

impl Harness {
    /// Open both buses, enumerate the daemon's modems and select the locally
    /// simulated ones.
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] when a bus or the daemon is not reachable, or
    /// no simulator device is configured.
    pub async fn connect(config: Config) -> Result<Self> {
        let session_bus = Connection::session()
            .await
            .map_err(|e| Error::Precondition(format!("cannot reach the session bus ({e})")))?;
        let system_bus = Connection::system()
            .await
            .map_err(|e| Error::Precondition(format!("cannot reach the system bus ({e})")))?;

        let manager = OfonoManager::new(system_bus.clone(), config.modem_service());
        let modems = manager.modems().await.map_err(|e| {
            Error::Precondition(format!(
                "{} needs to be running to execute tests ({e})",
                config.modem_service()
            ))
        })?;
        let devices = select_devices(config.device_table(), &modems)?;
        tracing::info!(
            modems = modems.len(),
            devices = devices.len(),
            "selected simulator devices"
        );

        Self::with_devices(config, session_bus, system_bus, devices).await
    }

    /// Build a harness over already-open buses and an explicit device list.
    pub async fn with_devices(
        config: Config,
        session_bus: Connection,
        system_bus: Connection,
        devices: Vec<Device>,
    ) -> Result<Self> {
        let queue = EventQueue::new(&config);
        let mut bridge = SignalBridge::new(queue.sink());
        bridge.subscribe_all(&session_bus).await?;
        let simulators = devices
            .into_iter()
            .map(|device| SimulatorProcess::new(device, &config, queue.sink()))
            .collect();

        Ok(Self {
            config,
            queue,
            bridge,
            session_bus,
            system_bus,
            simulators,
            online: None,
            disconnects: Vec::new(),
            summary: Summary::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Selected devices, in configuration-file order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.simulators.iter().map(SimulatorProcess::device)
    }

    pub fn queue(&mut self) -> &mut EventQueue {
        &mut self.queue
    }

    /// Bring the `index`-th selected device online. Later test cases run
    /// against it.
    pub async fn bring_online(&mut self, index: usize) -> Result<&Device> {
        let simulator = self.simulators.get_mut(index).ok_or_else(|| {
            Error::Precondition(format!("no simulator device at index {index}"))
        })?;
        let modem = OfonoModem::new(
            self.system_bus.clone(),
            self.config.modem_service(),
            simulator.device().clone(),
        );
        DeviceBringup::new(modem, &self.config)
            .run(&mut self.queue, &mut self.bridge, simulator)
            .await?;
        self.online = Some(index);
        Ok(self.simulators[index].device())
    }

    /// Run one test case against the online device.
    ///
    /// Events left over from earlier cases are discarded first. Once a case
    /// has failed, later cases are skipped. The outcome is recorded in the
    /// [`Summary`] returned by [`finish`](Self::finish) and also returned.
    pub async fn run_case<F>(&mut self, name: &str, case: F) -> Result
    where
        F: AsyncFnOnce(&mut Session<'_>) -> Result,
    {
        if !self.summary.failed.is_empty() {
            tracing::info!(case = %name, "skipped");
            self.summary.skipped.push(name.to_owned());
            return Ok(());
        }
        let Some(index) = self.online else {
            return Err(Error::Precondition(
                "no device is online; call bring_online first".into(),
            ));
        };

        let stale = self.queue.clear();
        if stale > 0 {
            tracing::debug!(case = %name, events = stale, "discarded leftover events");
        }

        tracing::info!(case = %name, "running");
        let mut session = Session {
            queue: &mut self.queue,
            session_bus: &self.session_bus,
            system_bus: &self.system_bus,
            device: self.simulators[index].device(),
            disconnects: &mut self.disconnects,
        };
        match case(&mut session).await {
            Ok(()) => {
                tracing::info!(case = %name, "passed");
                self.summary.passed.push(name.to_owned());
                Ok(())
            }
            Err(e) => {
                tracing::warn!(case = %name, error = %e, "failed");
                self.summary.failed.push((name.to_owned(), e.clone()));
                Err(e)
            }
        }
    }

    /// Stop every simulator, force-disconnect tracked connections and shut
    /// the bridge down. Every step is best effort.
    pub async fn finish(mut self) -> Summary {
        for simulator in &mut self.simulators {
            simulator.stop().await;
        }

        let pending: Vec<JoinHandle<()>> = self
            .disconnects
            .drain(..)
            .map(|call| call_async(&self.queue.sink(), &self.session_bus, call, ()))
            .collect();
        for handle in pending {
            if tokio::time::timeout(DISCONNECT_GRACE, handle).await.is_err() {
                tracing::debug!("disconnect did not complete in time");
            }
        }

        self.bridge.shutdown();
        tracing::info!(summary = %self.summary, "test run finished");
        self.summary
    }
}

/// Devices in the table at `path` that the daemon reports in `modems`.
///
/// A table that cannot be read or parsed selects nothing.
fn select_devices(path: &Path, modems: &[String]) -> Result<Vec<Device>> {
    let configure = |detail: String| {
        Error::Precondition(format!(
            "you have to configure at least one simulator device in {}{detail}",
            path.display()
        ))
    };
    let table = DeviceTable::load(path).map_err(|e| configure(format!(" ({e})")))?;
    let devices = table.select(modems.iter().map(String::as_str));
    if devices.is_empty() {
        return Err(configure(String::new()));
    }
    Ok(devices)
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("queue", &self.queue)
            .field("simulators", &self.simulators)
            .field("online", &self.online)
            .finish_non_exhaustive()
    }
}

/// Turns a precondition failure into process exit status 1.
///
/// Test binaries call this on [`Harness::connect`]: without the daemon or a
/// configured simulator there is nothing to test, which is a setup problem
/// rather than a test failure.
pub trait ExitOnPrecondition<T> {
    fn exit_on_precondition(self) -> Result<T>;
}

impl<T> ExitOnPrecondition<T> for Result<T> {
    fn exit_on_precondition(self) -> Result<T> {
        match self {
            Err(Error::Precondition(reason)) => {
                eprintln!("  {reason}");
                std::process::exit(1);
            }
            other => other,
        }
    }
}

/// What a test case can reach while it runs.
pub struct Session<'h> {
    queue: &'h mut EventQueue,
    session_bus: &'h Connection,
    system_bus: &'h Connection,
    device: &'h Device,
    disconnects: &'h mut Vec<MethodCall>,
}

impl Session<'_> {
    pub fn queue(&mut self) -> &mut EventQueue {
        self.queue
    }

    /// The bus the service under test lives on.
    pub fn session_bus(&self) -> &Connection {
        self.session_bus
    }

    /// The bus the modem daemon lives on.
    pub fn system_bus(&self) -> &Connection {
        self.system_bus
    }

    /// The device brought online for this run.
    pub fn device(&self) -> &Device {
        self.device
    }

    /// Call a method on the session bus; the outcome arrives as a
    /// `dbus-return` or `dbus-error` event.
    pub fn call<B>(&self, call: MethodCall, body: B) -> JoinHandle<()>
    where
        B: Serialize + DynamicType + Send + Sync + 'static,
    {
        call_async(&self.queue.sink(), self.session_bus, call, body)
    }

    /// Have `Disconnect` called on `interface` at `path` during teardown,
    /// whether or not the case gets there itself.
    pub fn track_disconnect(
        &mut self,
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) {
        self.disconnects
            .push(MethodCall::new(destination, path, interface, "Disconnect"));
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.device)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Outcome of a test run.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub passed: Vec<String>,
    pub failed: Vec<(String, Error)>,
    pub skipped: Vec<String>,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        for (name, error) in &self.failed {
            write!(f, "\n  {name}: {error}")?;
        }
        Ok(())
    }
}
