//! TOML configuration: registry size, lower-layer capabilities and the
//! portsets to build at startup.
//!
//! ```toml
//! [net]
//! num_portsets = 128
//! legacy_bonds = true
//!
//! [lower_layer]
//! pkt_hdr_size = 64
//! max_sg_length = 16
//!
//! [logging]
//! level = "info"
//!
//! [[portsets]]
//! name = "vswitch0"
//! ports = 64
//! kind = "switch"
//! uplinks = ["bond0"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::device::NetType;
use crate::legacy;
use crate::net::Net;
use crate::portset::{MAX_NUM_PORTSETS, MAX_NUM_PORTS_PER_SET, MAX_PORTSET_NAMELEN};
use crate::status::{NetError, ReturnStatus};
use crate::uplink::UplinkData;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] NetError),
}

impl ConfigError {
    pub fn status(&self) -> ReturnStatus {
        match self {
            ConfigError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ReturnStatus::NotFound
            }
            ConfigError::Io { .. } => ReturnStatus::Failure,
            ConfigError::Parse(_) => ReturnStatus::BadParam,
            ConfigError::Invalid(e) => e.status(),
        }
    }
}

/// Registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSection {
    /// Number of portset slots, rounded up to a power of two
    #[serde(default = "default_num_portsets")]
    pub num_portsets: usize,

    /// Create the ten legacy hub and bond pairs at startup
    #[serde(default = "default_legacy_bonds")]
    pub legacy_bonds: bool,
}

/// Capabilities of the lower networking layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowerLayerSection {
    #[serde(default = "default_pkt_hdr_size")]
    pub pkt_hdr_size: usize,

    #[serde(default = "default_max_sg_length")]
    pub max_sg_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `tracing` filter directive, e.g. `info` or `vmk_net=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A portset built at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsetConfig {
    pub name: String,
    pub ports: usize,
    pub kind: NetType,
    /// Devices connected through an uplink port right after creation
    #[serde(default)]
    pub uplinks: Vec<String>,
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub net: NetSection,

    #[serde(default)]
    pub lower_layer: LowerLayerSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub portsets: Vec<PortsetConfig>,
}

fn default_num_portsets() -> usize {
    128
}

fn default_legacy_bonds() -> bool {
    true
}

fn default_pkt_hdr_size() -> usize {
    64
}

fn default_max_sg_length() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetSection {
    fn default() -> Self {
        Self {
            num_portsets: default_num_portsets(),
            legacy_bonds: default_legacy_bonds(),
        }
    }
}

impl Default for LowerLayerSection {
    fn default() -> Self {
        Self {
            pkt_hdr_size: default_pkt_hdr_size(),
            max_sg_length: default_max_sg_length(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl From<LowerLayerSection> for UplinkData {
    fn from(section: LowerLayerSection) -> Self {
        UplinkData {
            pkt_hdr_size: section.pkt_hdr_size,
            max_sg_length: section.max_sg_length,
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = content.parse()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Rejects topologies `Net` would refuse anyway, before anything is built.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.net.num_portsets == 0 || self.net.num_portsets > MAX_NUM_PORTSETS {
            return Err(NetError::bad_param(format!(
                "num_portsets must be 1 to {MAX_NUM_PORTSETS}"
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for ps in &self.portsets {
            if ps.name.is_empty() || ps.name.len() > MAX_PORTSET_NAMELEN {
                return Err(NetError::bad_param(format!(
                    "portset name '{}' must be 1 to {MAX_PORTSET_NAMELEN} bytes",
                    ps.name
                )));
            }
            if ps.ports == 0 || ps.ports > MAX_NUM_PORTS_PER_SET {
                return Err(NetError::bad_param(format!(
                    "portset {} has {} ports, expected 1 to {MAX_NUM_PORTS_PER_SET}",
                    ps.name, ps.ports
                )));
            }
            if !seen.insert(ps.name.as_str()) {
                return Err(NetError::bad_param(format!(
                    "portset {} is defined twice",
                    ps.name
                )));
            }
            if ps.kind == NetType::Bond && ps.uplinks.len() > crate::device::NICTEAMING_MAX_SLAVE_NUM {
                return Err(NetError::bad_param(format!(
                    "bond {} lists more than {} slaves",
                    ps.name,
                    crate::device::NICTEAMING_MAX_SLAVE_NUM
                )));
            }
        }
        Ok(())
    }

    /// Builds a `Net` context, runs the legacy bootstrap if enabled, then
    /// creates the configured portsets in order.
    ///
    /// A portset that cannot be created aborts the build. An uplink that
    /// cannot be connected is logged and skipped.
    pub fn build(&self) -> Result<Net, NetError> {
        let net = Net::new(self.net.num_portsets)?;
        net.set_lower_layer(self.lower_layer.into());
        if self.net.legacy_bonds {
            legacy::legacy_init(&net);
        }
        for ps in &self.portsets {
            net.create(&ps.name, ps.ports, ps.kind)?;
            for uplink in &ps.uplinks {
                if let Err(e) = net.connect_uplink_port(&ps.name, uplink) {
                    warn!(portset = %ps.name, uplink = %uplink, error = %e, "cannot connect uplink");
                }
            }
        }
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.net.num_portsets, 128);
        assert!(config.net.legacy_bonds);
        assert_eq!(config.lower_layer.pkt_hdr_size, 64);
        assert_eq!(config.lower_layer.max_sg_length, 16);
        assert_eq!(config.logging.level, "info");
        assert!(config.portsets.is_empty());
    }

    #[test]
    fn test_toml_deserialization() {
        let config: Config = r#"
[net]
legacy_bonds = false

[[portsets]]
name = "vswitch0"
ports = 32
kind = "switch"
uplinks = ["bond1"]

[[portsets]]
name = "bond1"
ports = 16
kind = "bond"
"#
        .parse()
        .unwrap();
        assert!(!config.net.legacy_bonds);
        // unspecified values use defaults
        assert_eq!(config.net.num_portsets, 128);
        assert_eq!(
            config.portsets[0],
            PortsetConfig {
                name: "vswitch0".into(),
                ports: 32,
                kind: NetType::EtherSwitched,
                uplinks: vec!["bond1".into()],
            }
        );
        assert!(config.portsets[1].uplinks.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_topology() {
        let bad = [
            "[net]\nnum_portsets = 0",
            "[[portsets]]\nname = \"\"\nports = 4\nkind = \"hub\"",
            "[[portsets]]\nname = \"hub0\"\nports = 2048\nkind = \"hub\"",
            "[[portsets]]\nname = \"a\"\nports = 4\nkind = \"hub\"\n[[portsets]]\nname = \"a\"\nports = 4\nkind = \"null\"",
        ];
        for text in bad {
            let err = text.parse::<Config>().unwrap_err();
            assert_eq!(err.status(), ReturnStatus::BadParam, "{text}");
        }
        let err = "[[portsets]]\nname = \"a\"\nports = 4\nkind = \"bridge\""
            .parse::<Config>()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");

        let err = Config::from_file("/nonexistent/vmk-netd.toml").unwrap_err();
        assert_eq!(err.status(), ReturnStatus::NotFound);
    }

    #[test]
    fn test_build_topology() {
        let config: Config = r#"
[net]
num_portsets = 8
legacy_bonds = false

[[portsets]]
name = "bond0"
ports = 16
kind = "bond"
uplinks = ["vmnic0", "vmnic1"]

[[portsets]]
name = "vswitch0"
ports = 16
kind = "hub"
uplinks = ["bond0"]
"#
        .parse()
        .unwrap();
        let net = config.build().unwrap();
        assert_eq!(net.num_portsets(), 8);
        assert_eq!(
            net.bond_admin_read("bond0").unwrap(),
            "slave[0] = vmnic0, status = disconnected\nslave[1] = vmnic1, status = disconnected\n"
        );
        assert!(net.uplink_device("bond0").unwrap().is_notified());
    }
}
