use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    process::{Child, Command},
    select,
    sync::{Mutex, mpsc::unbounded_channel},
    task::{AbortHandle, JoinHandle},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{Config, Device, Event, EventSink, Handle, Result, kinds};

/// An open control connection to a running simulator.
///
/// The protocol spoken over it is opaque to this crate; only establishing
/// the connection matters. Clones share the same socket.
#[derive(Clone)]
pub struct SimConnection {
    peer: SocketAddr,
    stream: Arc<Mutex<TcpStream>>,
}

impl SimConnection {
    fn new(peer: SocketAddr, stream: TcpStream) -> Self {
        Self {
            peer,
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write raw bytes to the simulator.
    pub async fn send(&self, bytes: &[u8]) -> Result {
        let mut stream = self.stream.lock().await;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// The underlying socket, for callers that speak the simulator protocol.
    pub fn stream(&self) -> Arc<Mutex<TcpStream>> {
        self.stream.clone()
    }
}

impl fmt::Debug for SimConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimConnection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// One external simulator subprocess and its control connection.
///
/// [`start`](Self::start) launches `<executable> -p <port> <script>` and
/// spawns a connect loop against `127.0.0.1:<port>`. The simulator gives no
/// readiness signal, so a connect still pending after the retry interval is
/// aborted and issued again, indefinitely. Failed attempts are absorbed.
/// The first successful connection is recorded and announced once per start
/// as a [`PROCESS_CONNECTED`](crate::kinds::PROCESS_CONNECTED) event carrying
/// `device`, `endpoint`, the `process` that was started (`<device>[<pid>]`),
/// its `pid` and a `connection` handle to the [`SimConnection`].
/// [`stop`](Self::stop) forgets the connection, so a restarted simulator is
/// announced again.
///
/// A simulator that never comes up is detected by the consumer's own
/// timeout when it waits for that event.
///
/// # Example
///
/// ```ignore
/// let mut sim = SimulatorProcess::new(device, &config, queue.sink());
/// sim.start()?;
/// let connected = queue
///     .expect(Pattern::new(kinds::PROCESS_CONNECTED).field("device", sim.device().name()))
///     .await?;
/// // ...
/// sim.stop().await;
/// ```
pub struct SimulatorProcess {
    device: Device,
    executable: PathBuf,
    script: PathBuf,
    retry_interval: Duration,
    sink: EventSink,
    child: Option<Child>,
    pid: Option<u32>,
    connection: Arc<OnceLock<SimConnection>>,
    cancel: CancellationToken,
    connect_task: Option<JoinHandle<()>>,
}

impl SimulatorProcess {
    pub fn new(device: Device, config: &Config, sink: EventSink) -> Self {
        Self {
            device,
            executable: config.simulator_executable().clone(),
            script: config.simulator_script().clone(),
            retry_interval: config.retry_interval(),
            sink,
            child: None,
            pid: None,
            connection: Arc::new(OnceLock::new()),
            cancel: CancellationToken::new(),
            connect_task: None,
        }
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Address the connect loop targets.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.device.port()))
    }

    /// Whether the subprocess has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Process id of the running subprocess.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The control connection, once established. `None` before `start` and
    /// after `stop`.
    pub fn connection(&self) -> Option<SimConnection> {
        self.connection.get().cloned()
    }

    /// Launch the subprocess and begin connecting to it.
    ///
    /// Must be called from within a Tokio runtime. Calling `start` on a
    /// running simulator does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`](crate::Error::IoError) if the executable
    /// cannot be spawned.
    pub fn start(&mut self) -> Result {
        if self.child.is_some() {
            tracing::debug!(device = %self.device.name(), "simulator already running");
            return Ok(());
        }

        let child = Command::new(&self.executable)
            .arg("-p")
            .arg(self.device.port().to_string())
            .arg(&self.script)
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(
            device = %self.device.name(),
            pid = ?child.id(),
            executable = %self.executable.display(),
            "simulator started"
        );
        self.pid = child.id();
        self.child = Some(child);

        self.connection = Arc::new(OnceLock::new());
        self.cancel = CancellationToken::new();
        let connect = ConnectLoop {
            device: self.device.name().to_owned(),
            pid: self.pid,
            endpoint: self.endpoint(),
            interval: self.retry_interval,
            sink: self.sink.clone(),
            connection: self.connection.clone(),
            cancel: self.cancel.clone(),
        };
        self.connect_task = Some(tokio::spawn(connect.run()));
        Ok(())
    }

    /// Stop connecting, drop the connection and terminate the subprocess.
    /// A second call is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.connect_task.take() {
            let _ = task.await;
        }
        self.connection = Arc::new(OnceLock::new());
        self.pid = None;

        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            tracing::warn!(device = %self.device.name(), error = %e, "failed to kill simulator");
        }
        match child.wait().await {
            Ok(status) => {
                tracing::info!(device = %self.device.name(), %status, "simulator stopped")
            }
            Err(e) => {
                tracing::warn!(device = %self.device.name(), error = %e, "failed to reap simulator")
            }
        }
    }
}

impl fmt::Debug for SimulatorProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorProcess")
            .field("device", &self.device)
            .field("executable", &self.executable)
            .field("running", &self.is_running())
            .field("connected", &self.connection.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for SimulatorProcess {
    fn drop(&mut self) {
        // The child itself is killed on drop.
        self.cancel.cancel();
    }
}

struct ConnectLoop {
    device: String,
    pid: Option<u32>,
    endpoint: SocketAddr,
    interval: Duration,
    sink: EventSink,
    connection: Arc<OnceLock<SimConnection>>,
    cancel: CancellationToken,
}

impl ConnectLoop {
    async fn run(self) {
        let (results, mut completed) = unbounded_channel::<(u64, std::io::Result<TcpStream>)>();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // At most one attempt is live. A replaced attempt may still have
        // completed before it was aborted: its stream is as good as any, only
        // its failure is stale.
        let mut pending_attempt: Option<AbortHandle> = None;
        let mut generation: u64 = 0;

        loop {
            select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some((attempt, result)) = completed.recv() => match result {
                    Ok(stream) => {
                        self.connected(stream);
                        break;
                    }
                    Err(e) => {
                        if attempt == generation {
                            pending_attempt = None;
                        }
                        tracing::trace!(device = %self.device, attempt, error = %e, "simulator connect failed");
                    }
                },
                _ = ticker.tick() => {
                    generation += 1;
                    let attempt = generation;
                    let endpoint = self.endpoint;
                    let results = results.clone();
                    let handle = tokio::spawn(async move {
                        let _ = results.send((attempt, TcpStream::connect(endpoint).await));
                    });
                    if let Some(stale) = pending_attempt.replace(handle.abort_handle()) {
                        stale.abort();
                    }
                }
            }
        }

        if let Some(attempt) = pending_attempt.take() {
            attempt.abort();
        }
    }

    fn connected(&self, stream: TcpStream) {
        let peer = stream.peer_addr().unwrap_or(self.endpoint);
        let connection = SimConnection::new(peer, stream);
        if self.connection.set(connection.clone()).is_err() {
            return;
        }
        tracing::info!(device = %self.device, pid = ?self.pid, %peer, "simulator connected");
        let process = match self.pid {
            Some(pid) => format!("{}[{pid}]", self.device),
            None => self.device.clone(),
        };
        let mut event = Event::new(kinds::PROCESS_CONNECTED)
            .with("device", self.device.as_str())
            .with("process", process)
            .with("endpoint", self.endpoint.to_string())
            .with("connection", Handle::new(connection));
        if let Some(pid) = self.pid {
            event = event.with("pid", pid);
        }
        self.sink.append(event);
    }
}
