//! Location → device lookup.
//!
//! The directory is read-only once loaded and is shared by every worker.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::device::{Device, PortId};
use crate::error::DirectoryError;

/// Read-only view of the device fleet.
pub trait DeviceDirectory: Send + Sync + 'static {
    fn resolve(&self, location: &str) -> Result<Device, DirectoryError>;

    /// All devices, in directory order.
    fn list_all(&self) -> Vec<Device>;
}

/// Directory held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    devices: Vec<Device>,
    index: HashMap<String, usize>,
}

impl InMemoryDirectory {
    pub fn from_devices(devices: Vec<Device>) -> Result<Self, DirectoryError> {
        let mut index = HashMap::with_capacity(devices.len());
        for (i, device) in devices.iter().enumerate() {
            if index.insert(device.location.clone(), i).is_some() {
                return Err(DirectoryError::DuplicateLocation(device.location.clone()));
            }
        }
        Ok(Self { devices, index })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = toml::from_str(content)?;
        let mut devices = Vec::with_capacity(file.devices.len());
        for row in file.devices {
            if let Some(device) = row.into_device()? {
                devices.push(device);
            }
        }
        Self::from_devices(devices)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceDirectory for InMemoryDirectory {
    fn resolve(&self, location: &str) -> Result<Device, DirectoryError> {
        let location = location.trim();
        self.index
            .get(location)
            .map(|&i| self.devices[i].clone())
            .ok_or_else(|| DirectoryError::NotFound(location.to_string()))
    }

    fn list_all(&self) -> Vec<Device> {
        self.devices.clone()
    }
}

/// Directory loaded once from a `devices.toml` file.
#[derive(Debug, Clone)]
pub struct FileDirectory {
    path: PathBuf,
    inner: InMemoryDirectory,
}

impl FileDirectory {
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        tracing::debug!("Loading device directory from: {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| DirectoryError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let inner = InMemoryDirectory::from_toml_str(&content)?;

        tracing::info!(
            path = %path.display(),
            devices = inner.len(),
            "Device directory loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceDirectory for FileDirectory {
    fn resolve(&self, location: &str) -> Result<Device, DirectoryError> {
        self.inner.resolve(location)
    }

    fn list_all(&self) -> Vec<Device> {
        self.inner.list_all()
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceRow>,
}

#[derive(Debug, Deserialize)]
struct DeviceRow {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    switch: Option<String>,
    #[serde(default)]
    port: Option<PortField>,
}

/// Port hints may be written as `port = 7` or `port = "ge-0/0/7"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(i64),
    Name(String),
}

impl PortField {
    fn into_text(self) -> String {
        match self {
            PortField::Number(n) => n.to_string(),
            PortField::Name(name) => name,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl DeviceRow {
    /// Incomplete rows (blank location or ip) are skipped, not rejected.
    fn into_device(self) -> Result<Option<Device>, DirectoryError> {
        let (Some(location), Some(ip)) = (non_blank(self.location), non_blank(self.ip)) else {
            return Ok(None);
        };

        let address = parse_addr(&location, &ip)?;
        let mut device = Device::new(location.clone(), address);

        if let Some(switch) = non_blank(self.switch) {
            device = device.with_switch(parse_addr(&location, &switch)?);
        }
        if let Some(port) = non_blank(self.port.map(PortField::into_text)) {
            let port: PortId = port.parse().map_err(|_| DirectoryError::InvalidPort {
                location: location.clone(),
                value: port.clone(),
            })?;
            device = device.with_port_hint(port);
        }

        Ok(Some(device))
    }
}

fn parse_addr(location: &str, value: &str) -> Result<IpAddr, DirectoryError> {
    value
        .parse::<IpAddr>()
        .map_err(|_| DirectoryError::InvalidAddress {
            location: location.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[[device]]
location = "Lobby-3"
ip = "10.0.0.5"
switch = "10.0.0.1"
port = "ge-0/0/7"

[[device]]
location = "Room 101"
ip = "10.0.1.20"

[[device]]
location = ""
ip = "10.0.9.9"

[[device]]
location = "Spare"
"#;

    #[test]
    fn loads_devices_in_file_order_and_skips_blank_rows() {
        let dir = InMemoryDirectory::from_toml_str(SAMPLE).unwrap();
        let locations: Vec<_> = dir.list_all().into_iter().map(|d| d.location).collect();
        assert_eq!(locations, vec!["Lobby-3", "Room 101"]);
    }

    #[test]
    fn resolves_optional_fields() {
        let dir = InMemoryDirectory::from_toml_str(SAMPLE).unwrap();
        let lobby = dir.resolve("Lobby-3").unwrap();
        assert_eq!(lobby.address, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(lobby.ssh_target(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(lobby.port_hint, Some(PortId::ge(7)));

        let room = dir.resolve(" Room 101 ").unwrap();
        assert_eq!(room.switch_address, None);
        assert_eq!(room.port_hint, None);
    }

    #[test]
    fn unknown_location_is_not_found() {
        let dir = InMemoryDirectory::from_toml_str(SAMPLE).unwrap();
        assert!(matches!(
            dir.resolve("Basement"),
            Err(DirectoryError::NotFound(loc)) if loc == "Basement"
        ));
    }

    #[test]
    fn duplicate_location_is_rejected() {
        let content = r#"
[[device]]
location = "Lobby-3"
ip = "10.0.0.5"

[[device]]
location = "Lobby-3"
ip = "10.0.0.6"
"#;
        assert!(matches!(
            InMemoryDirectory::from_toml_str(content),
            Err(DirectoryError::DuplicateLocation(_))
        ));
    }

    #[test]
    fn invalid_ip_is_rejected() {
        let content = "[[device]]\nlocation = \"Lobby-3\"\nip = \"10.0.0\"\n";
        assert!(matches!(
            InMemoryDirectory::from_toml_str(content),
            Err(DirectoryError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn invalid_port_hint_is_rejected() {
        let content = "[[device]]\nlocation = \"Lobby-3\"\nip = \"10.0.0.5\"\nport = \"vlan.10\"\n";
        assert!(matches!(
            InMemoryDirectory::from_toml_str(content),
            Err(DirectoryError::InvalidPort { .. })
        ));
    }

    #[test]
    fn integer_port_hint_is_bare_port_number() {
        let content = "[[device]]\nlocation = \"Lobby-3\"\nip = \"10.0.0.5\"\nport = 7\n";
        let dir = InMemoryDirectory::from_toml_str(content).unwrap();
        assert_eq!(dir.resolve("Lobby-3").unwrap().port_hint, Some(PortId::ge(7)));

        let content = "[[device]]\nlocation = \"Lobby-3\"\nip = \"10.0.0.5\"\nport = -1\n";
        assert!(matches!(
            InMemoryDirectory::from_toml_str(content),
            Err(DirectoryError::InvalidPort { .. })
        ));
    }

    #[test]
    fn file_directory_loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let dir = FileDirectory::load(file.path()).unwrap();
        assert_eq!(dir.list_all().len(), 2);
        assert_eq!(dir.path(), file.path());
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = FileDirectory::load(Path::new("/nonexistent/devices.toml")).unwrap_err();
        assert!(matches!(err, DirectoryError::ReadFile { .. }));
    }
}
