use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use zbus::zvariant::{OwnedObjectPath, OwnedValue};

use crate::{Error, Result};

/// One simulated device as described by the simulator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    name: String,
    address: String,
    port: u16,
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bus object path of the device: `/<name>`.
    pub fn object_path(&self) -> String {
        format!("/{}", self.name)
    }

    /// Whether the simulator for this device runs on this host.
    pub fn is_loopback(&self) -> bool {
        self.address
            .parse::<IpAddr>()
            .is_ok_and(|addr| addr.is_loopback())
    }
}

/// The simulator configuration file: INI sections named after devices,
/// each with `Address` and `Port` keys.
///
/// ```ini
/// [phonesim]
/// Driver=phonesim
/// Address=127.0.0.1
/// Port=12345
/// ```
///
/// Key names are case-insensitive. Sections without an `Address` are not
/// simulators and are skipped. Device order is file order.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    devices: Vec<Device>,
}

impl DeviceTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            line: 0,
            reason: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Parse INI text; `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let fail = |line: usize, reason: String| Error::Config {
            path: PathBuf::from(origin),
            line,
            reason,
        };

        let mut sections: Vec<Section> = Vec::new();
        for (number, raw) in text.lines().enumerate() {
            let line_no = number + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| fail(line_no, format!("unterminated section header {line:?}")))?
                    .trim();
                if sections.iter().any(|s| s.name == name) {
                    return Err(fail(line_no, format!("duplicate section [{name}]")));
                }
                sections.push(Section::new(name, line_no));
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .or_else(|| line.split_once(':'))
                .ok_or_else(|| fail(line_no, format!("expected key=value, found {line:?}")))?;
            let section = sections
                .last_mut()
                .ok_or_else(|| fail(line_no, "key outside of any section".into()))?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_owned();
            match key.as_str() {
                "address" => section.address = Some(value),
                "port" => section.port = Some((value, line_no)),
                _ => {}
            }
        }

        let mut devices = Vec::new();
        for section in sections {
            let Some(address) = section.address else {
                continue;
            };
            let (port, line_no) = section.port.ok_or_else(|| {
                fail(section.line, format!("section [{}] has no Port", section.name))
            })?;
            let port = port
                .parse::<u16>()
                .map_err(|e| fail(line_no, format!("invalid port {port:?}: {e}")))?;
            devices.push(Device::new(section.name, address, port));
        }

        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Devices the daemon knows about whose simulator runs locally.
    ///
    /// `modem_paths` are object paths as enumerated by the daemon (`/name`).
    /// The result follows configuration file order, independent of the
    /// order the daemon reports them in.
    pub fn select<'a, I>(&self, modem_paths: I) -> Vec<Device>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: Vec<&str> = modem_paths
            .into_iter()
            .map(|p| p.strip_prefix('/').unwrap_or(p))
            .collect();
        self.devices
            .iter()
            .filter(|d| d.is_loopback() && known.contains(&d.name()))
            .cloned()
            .collect()
    }
}

struct Section {
    name: String,
    line: usize,
    address: Option<String>,
    port: Option<(String, usize)>,
}

impl Section {
    fn new(name: &str, line: usize) -> Self {
        Self {
            name: name.to_owned(),
            line,
            address: None,
            port: None,
        }
    }
}

/// Enumerates the modems known to the daemon under test.
pub trait ModemManager {
    /// Object paths of every modem, in the daemon's order.
    fn modems(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// [`ModemManager`] backed by the ofono `Manager` interface.
#[derive(Debug, Clone)]
pub struct OfonoManager {
    conn: zbus::Connection,
    service: String,
}

impl OfonoManager {
    pub fn new(conn: zbus::Connection, service: impl Into<String>) -> Self {
        Self {
            conn,
            service: service.into(),
        }
    }
}

impl ModemManager for OfonoManager {
    async fn modems(&self) -> Result<Vec<String>> {
        let reply = self
            .conn
            .call_method(
                Some(self.service.as_str()),
                "/",
                Some("org.ofono.Manager"),
                "GetModems",
                &(),
            )
            .await?;
        let modems: Vec<(OwnedObjectPath, std::collections::HashMap<String, OwnedValue>)> =
            reply.body().deserialize()?;
        Ok(modems
            .into_iter()
            .map(|(path, _)| path.as_str().to_owned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const TABLE: &str = "\
# simulators
[phonesim]
Driver=phonesim
Address=127.0.0.1
Port=12345

[remote]
Driver=phonesim
Address=192.168.0.7
Port=12346

; a real modem
[usb0]
Driver=huawei

[second]
address = 127.0.0.1
PORT = 12347
";

    #[test]
    fn parses_simulator_sections_in_file_order() {
        let table = DeviceTable::parse(TABLE, Path::new("phonesim.conf")).unwrap();
        let names: Vec<_> = table.devices().iter().map(Device::name).collect();
        assert_eq!(names, vec!["phonesim", "remote", "second"]);

        let phonesim = table.get("phonesim").unwrap();
        assert_eq!(phonesim.port(), 12345);
        assert_eq!(phonesim.object_path(), "/phonesim");
        assert!(phonesim.is_loopback());
        assert!(!table.get("remote").unwrap().is_loopback());
        assert!(table.get("usb0").is_none());
    }

    #[test]
    fn select_keeps_local_enumerated_devices_in_file_order() {
        let table = DeviceTable::parse(TABLE, Path::new("phonesim.conf")).unwrap();
        let selected = table.select(["/second", "/usb0", "/remote", "/phonesim"]);
        let names: Vec<_> = selected.iter().map(Device::name).collect();
        assert_eq!(names, vec!["phonesim", "second"]);

        assert!(table.select(["/usb0"]).is_empty());
    }

    #[test]
    fn missing_port_is_reported_with_section_line() {
        let err = DeviceTable::parse("[sim]\nAddress=127.0.0.1\n", Path::new("x.conf")).unwrap_err();
        match err {
            Error::Config { line, reason, .. } => {
                assert_eq!(line, 1);
                assert!(reason.contains("no Port"), "{reason}");
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        let bad_port = DeviceTable::parse("[sim]\nAddress=127.0.0.1\nPort=abc\n", Path::new("x"));
        assert!(matches!(bad_port, Err(Error::Config { line: 3, .. })));

        let orphan = DeviceTable::parse("Port=1\n", Path::new("x"));
        assert!(matches!(orphan, Err(Error::Config { line: 1, .. })));

        let duplicate = DeviceTable::parse("[a]\n[a]\n", Path::new("x"));
        assert!(matches!(duplicate, Err(Error::Config { line: 2, .. })));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();
        let table = DeviceTable::load(file.path()).unwrap();
        assert_eq!(table.devices().len(), 3);

        let missing = DeviceTable::load("/nonexistent/phonesim.conf");
        assert!(matches!(missing, Err(Error::Config { line: 0, .. })));
    }
}
