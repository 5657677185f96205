//! Device and switch-port identity types.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A switch-attached device resolved from the directory.
///
/// Identity is the location string; it is unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub location: String,
    pub address: IpAddr,
    /// Switch to SSH into when it differs from the device address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_address: Option<IpAddr>,
    /// Port assignment recorded in the directory, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_hint: Option<PortId>,
}

impl Device {
    pub fn new(location: impl Into<String>, address: IpAddr) -> Self {
        Self {
            location: location.into(),
            address,
            switch_address: None,
            port_hint: None,
        }
    }

    pub fn with_switch(mut self, switch_address: IpAddr) -> Self {
        self.switch_address = Some(switch_address);
        self
    }

    pub fn with_port_hint(mut self, port: PortId) -> Self {
        self.port_hint = Some(port);
        self
    }

    /// Address the SSH session is opened against.
    pub fn ssh_target(&self) -> IpAddr {
        self.switch_address.unwrap_or(self.address)
    }
}

static PORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z]{2,4})-(\d{1,3})/(\d{1,3})/(\d{1,3})(?:\.\d+)?$").expect("port regex")
});

/// Junos-style physical interface name, e.g. `ge-0/0/7`.
///
/// A logical unit suffix (`ge-0/0/7.0`) is accepted and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortId {
    media: String,
    fpc: u16,
    pic: u16,
    port: u16,
}

impl PortId {
    /// Gigabit copper port on FPC 0 / PIC 0, the usual PoE access layout.
    pub fn ge(port: u16) -> Self {
        Self {
            media: "ge".to_string(),
            fpc: 0,
            pic: 0,
            port,
        }
    }

    pub fn port_number(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}/{}/{}", self.media, self.fpc, self.pic, self.port)
    }
}

/// Error returned when an interface name is not a physical port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPortId(pub String);

impl fmt::Display for InvalidPortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a physical port name: '{}'", self.0)
    }
}

impl std::error::Error for InvalidPortId {}

impl FromStr for PortId {
    type Err = InvalidPortId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Bare numbers are shorthand for ge-0/0/N, as port assignment sheets record them
        if let Ok(port) = trimmed.parse::<u16>() {
            return Ok(Self::ge(port));
        }
        let caps = PORT_REGEX
            .captures(trimmed)
            .ok_or_else(|| InvalidPortId(s.to_string()))?;
        let number = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<u16>().ok())
                .ok_or_else(|| InvalidPortId(s.to_string()))
        };
        Ok(Self {
            media: caps[1].to_string(),
            fpc: number(2)?,
            pic: number(3)?,
            port: number(4)?,
        })
    }
}

impl TryFrom<String> for PortId {
    type Error = InvalidPortId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortId> for String {
    fn from(value: PortId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_junos_interface_names() {
        let port: PortId = "ge-0/0/7".parse().unwrap();
        assert_eq!(port.port_number(), 7);
        assert_eq!(port.to_string(), "ge-0/0/7");

        let port: PortId = "xe-1/2/48".parse().unwrap();
        assert_eq!(port.port_number(), 48);
        assert_eq!(port.to_string(), "xe-1/2/48");
    }

    #[test]
    fn drops_logical_unit() {
        let port: PortId = "ge-0/0/16.0".parse().unwrap();
        assert_eq!(port, PortId::ge(16));
    }

    #[test]
    fn bare_number_means_ge_port() {
        let port: PortId = "16".parse().unwrap();
        assert_eq!(port.to_string(), "ge-0/0/16");
    }

    #[test]
    fn rejects_non_physical_names() {
        assert!("vlan.100".parse::<PortId>().is_err());
        assert!("irb".parse::<PortId>().is_err());
        assert!("ge-0/0".parse::<PortId>().is_err());
        assert!("".parse::<PortId>().is_err());
    }

    #[test]
    fn port_serializes_as_string() {
        let json = serde_json::to_string(&PortId::ge(7)).unwrap();
        assert_eq!(json, "\"ge-0/0/7\"");
        let back: PortId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PortId::ge(7));
    }

    #[test]
    fn ssh_target_prefers_switch_address() {
        let device = Device::new("Lobby-3", "10.0.0.5".parse().unwrap());
        assert_eq!(device.ssh_target(), "10.0.0.5".parse::<IpAddr>().unwrap());

        let device = device.with_switch("10.0.0.1".parse().unwrap());
        assert_eq!(device.ssh_target(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }
}
