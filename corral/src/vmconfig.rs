//! The `config.json` schema: CPU/memory/disk/network shape of one VM.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::name::validate_simple_name;
use crate::{Error, Result};

/// The only `version` this build understands. Loading a config with any
/// other value fails fast rather than risk misinterpreting its fields.
pub const CURRENT_VERSION: u32 = 1;

/// A single disk entry. Only the name is persisted — the file itself lives
/// alongside `config.json` in the VM directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Must satisfy the simple-name grammar (see [`validate_simple_name`]).
    pub name: String,
}

/// A 6-byte hardware address, serialized as the usual colon-hex form
/// (`"02:xx:xx:xx:xx:xx"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Generates a locally-administered, unicast MAC address: the
    /// multicast bit is cleared and the locally-administered bit is set on
    /// the first octet, matching the scheme used for both the guest NIC
    /// and its `passt` peer.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        // Avoid pulling in `rand` for six bytes of entropy; RandomState's
        // SipHash keys are seeded from the OS RNG, which is exactly what
        // we need here.
        let mut remaining = 6usize;
        while remaining > 0 {
            let mut hasher = RandomState::new().build_hasher();
            std::ptr::from_ref(&remaining).hash(&mut hasher);
            let word = hasher.finish().to_le_bytes();
            let take = remaining.min(8);
            bytes[6 - remaining..6 - remaining + take].copy_from_slice(&word[..take]);
            remaining -= take;
        }
        bytes[0] = (bytes[0] & 0xFC) | 0x02;
        Self(bytes)
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for b in &mut bytes {
            let part = parts.next().ok_or_else(|| serde::de::Error::custom("MAC address too short"))?;
            *b = u8::from_str_radix(part, 16).map_err(serde::de::Error::custom)?;
        }
        if parts.next().is_some() {
            return Err(serde::de::Error::custom("MAC address has too many octets"));
        }
        Ok(Self(bytes))
    }
}

/// The persisted configuration of one VM (`config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Schema version; must equal [`CURRENT_VERSION`].
    pub version: u32,
    /// Target architecture: `"amd64"` or `"arm64"`.
    pub arch: String,
    /// Kernel command line, verbatim.
    #[serde(default)]
    pub cmdline: String,
    /// Ordered disk list.
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(rename = "cpuCount")]
    /// Number of virtual CPUs, `1..=255`.
    pub cpu_count: u8,
    #[serde(rename = "memorySize")]
    /// Guest memory size in bytes.
    pub memory_size: u64,
    #[serde(rename = "macAddress")]
    /// The guest NIC's hardware address.
    pub mac_address: MacAddress,
}

/// Maps `std::env::consts::ARCH` to the `"amd64"`/`"arm64"` vocabulary used
/// on the wire (Go's `GOARCH`, which this format was originally modeled
/// on).
#[must_use]
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

impl VmConfig {
    /// Seeds a fresh config for the host architecture with a random MAC
    /// address and no disks.
    #[must_use]
    pub fn new(cpu_count: u8, memory_size: u64) -> Self {
        Self {
            version: CURRENT_VERSION,
            arch: host_arch().to_owned(),
            cmdline: String::new(),
            disks: Vec::new(),
            cpu_count,
            memory_size,
            mac_address: MacAddress::random(),
        }
    }

    /// Parses and validates a `config.json` document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the version is unsupported, `arch` is
    /// empty, or any disk name fails the simple-name grammar.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to the canonical on-wire JSON form.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Re-checks every invariant in §3: version, arch, disk names.
    pub fn validate(&self) -> Result<()> {
        if self.version != CURRENT_VERSION {
            return Err(Error::Parse(format!(
                "unsupported config version {} (expected {CURRENT_VERSION})",
                self.version
            )));
        }
        if self.arch.is_empty() {
            return Err(Error::Parse("arch must not be empty".into()));
        }
        for disk in &self.disks {
            validate_simple_name(&disk.name)
                .map_err(|_| Error::Parse(format!("invalid disk name {:?}", disk.name)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_config_round_trips_through_json() {
        let config = VmConfig::new(2, 1024 * 1024 * 1024);
        let json = config.to_json().expect("serialize");
        let parsed = VmConfig::from_json(&json).expect("parse");
        assert_eq!(config, parsed);
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut config = VmConfig::new(1, 512);
        config.version = 99;
        let json = config.to_json().expect("serialize");
        assert!(VmConfig::from_json(&json).is_err());
    }

    #[test]
    fn rejects_invalid_disk_name() {
        let mut config = VmConfig::new(1, 512);
        config.disks.push(Disk { name: "../escape".into() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn mac_address_is_locally_administered_unicast() {
        let mac = MacAddress::random();
        assert_eq!(mac.0[0] & 0x01, 0, "multicast bit must be clear");
        assert_eq!(mac.0[0] & 0x02, 0x02, "locally-administered bit must be set");
    }

    #[test]
    fn mac_address_json_round_trips() {
        let mac = MacAddress([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let json = serde_json::to_string(&mac).expect("serialize");
        assert_eq!(json, "\"02:11:22:33:44:55\"");
        let parsed: MacAddress = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, mac);
    }
}
