use std::{path::PathBuf, time::Duration};

/// Environment variable that turns on the verbose event echo when non-empty.
pub const VERBOSE_ENV: &str = "RINGSIDE_VERBOSE";

/// Runtime configuration for the queue, the simulator and bring-up.
///
/// Use the builder pattern to customize, or use [`Default`] for the stock
/// ofono/phonesim layout.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use ringside::Config;
///
/// let config = Config::default()
///     .with_default_timeout(Some(Duration::from_secs(10)))  // Longer waits
///     .with_retry_interval(Duration::from_millis(50))       // Faster reconnects
///     .with_verbose(true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Timeout applied to an expectation unless overridden with `within`.
    /// `None` waits forever.
    /// Default: 5s
    default_timeout: Option<Duration>,

    /// Timeout applied to each bring-up wait.
    /// Default: 10s
    bringup_timeout: Duration,

    /// Echo every observed event tagged `handled` / `not handled`.
    /// Default: false
    verbose: bool,

    /// How many unmatched events a timeout error carries.
    /// Default: 10
    diagnostic_window: usize,

    /// Interval after which a pending simulator connect is abandoned and
    /// reissued.
    /// Default: 100ms
    retry_interval: Duration,

    /// Simulator executable, resolved through `PATH`.
    /// Default: `phonesim`
    simulator_executable: PathBuf,

    /// Scenario file passed to the simulator.
    /// Default: `/usr/share/phonesim/default.xml`
    simulator_script: PathBuf,

    /// INI file mapping device names to simulator address and port.
    /// Default: `/etc/ofono/phonesim.conf`
    device_table: PathBuf,

    /// Well-known bus name of the modem daemon.
    /// Default: `org.ofono`
    modem_service: String,

    /// Interfaces a device must advertise before bring-up completes.
    /// Default: `["org.ofono.MessageManager"]`
    required_interfaces: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_timeout: Some(Duration::from_secs(5)),
            bringup_timeout: Duration::from_secs(10),
            verbose: false,
            diagnostic_window: 10,
            retry_interval: Duration::from_millis(100),
            simulator_executable: PathBuf::from("phonesim"),
            simulator_script: PathBuf::from("/usr/share/phonesim/default.xml"),
            device_table: PathBuf::from("/etc/ofono/phonesim.conf"),
            modem_service: String::from("org.ofono"),
            required_interfaces: vec![String::from("org.ofono.MessageManager")],
        }
    }
}

impl Config {
    /// Default configuration with overrides read from the environment.
    ///
    /// Currently only [`VERBOSE_ENV`] is consulted.
    pub fn from_env() -> Self {
        let verbose = std::env::var_os(VERBOSE_ENV).is_some_and(|v| !v.is_empty());
        Config::default().with_verbose(verbose)
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn with_bringup_timeout(mut self, timeout: Duration) -> Self {
        self.bringup_timeout = timeout;
        self
    }

    pub fn bringup_timeout(&self) -> Duration {
        self.bringup_timeout
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn with_diagnostic_window(mut self, window: usize) -> Self {
        self.diagnostic_window = window;
        self
    }

    pub fn diagnostic_window(&self) -> usize {
        self.diagnostic_window
    }

    /// Set the simulator reconnect interval.
    ///
    /// The simulator gives no readiness signal, so a connect that has not
    /// completed within this interval is cancelled and issued again.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn with_simulator_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.simulator_executable = executable.into();
        self
    }

    pub fn simulator_executable(&self) -> &PathBuf {
        &self.simulator_executable
    }

    pub fn with_simulator_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.simulator_script = script.into();
        self
    }

    pub fn simulator_script(&self) -> &PathBuf {
        &self.simulator_script
    }

    pub fn with_device_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_table = path.into();
        self
    }

    pub fn device_table(&self) -> &PathBuf {
        &self.device_table
    }

    pub fn with_modem_service(mut self, service: impl Into<String>) -> Self {
        self.modem_service = service.into();
        self
    }

    pub fn modem_service(&self) -> &str {
        &self.modem_service
    }

    pub fn with_required_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_interfaces = interfaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn required_interfaces(&self) -> &[String] {
        &self.required_interfaces
    }
}
