//! Node configuration.
//!
//! Read from `<config_dir>/config.toml`; a missing file means defaults,
//! which are written back so the user has something to edit.

use lantern_pki::{CertificateProfile, IdentityOptions, KeyAlgorithm, KeyLayout, MAX_VALIDITY_DAYS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::NodeError;

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Default control channel port; the issuance listener sits one above it.
pub const DEFAULT_CONTROL_CHANNEL_PORT: u16 = 16353;

/// Default local proxy port.
pub const DEFAULT_LOCAL_PROXY_PORT: u16 = 8080;

/// Configuration for a Lantern node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Where config, keys and trusted certificates live (not stored in the file).
    #[serde(skip)]
    pub config_dir: PathBuf,

    /// Mutual-TLS control listener port (default: 16353).
    #[serde(default = "default_control_port")]
    pub control_channel_port: u16,

    /// Address the control and issuance listeners bind (default: 0.0.0.0).
    #[serde(default = "default_any_host")]
    pub control_channel_host: IpAddr,

    /// Local proxy port (default: 8080).
    #[serde(default = "default_proxy_port")]
    pub local_proxy_port: u16,

    /// Local proxy bind address; absent means all interfaces.
    #[serde(default)]
    pub local_proxy_host: Option<IpAddr>,

    /// Node that signs our certificate; absent means standalone.
    #[serde(default)]
    pub sponsor: Option<SponsorAddress>,

    /// Shape of this node's certificates.
    #[serde(default)]
    pub identity: IdentitySettings,

    /// Bounds on connects and handshakes.
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Address of a sponsoring node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorAddress {
    /// Host name or IP address
    #[serde(alias = "ip")]
    pub host: String,
    /// The sponsor's control channel port
    pub port: u16,
}

/// Certificate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Subject common name (default: lantern).
    #[serde(default = "default_common_name")]
    pub common_name: String,

    /// Validity of self-signed and issued certificates (default: 7 days).
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    /// Key algorithm for new key pairs.
    #[serde(default)]
    pub algorithm: KeyAlgorithm,
}

/// Timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Outbound TCP connects: proxy upstreams and sponsors (default: 10).
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Whole sponsor issuance request (default: 30).
    #[serde(default = "default_issuance_secs")]
    pub issuance_secs: u64,

    /// Inbound TLS handshakes (default: 10).
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("."),
            control_channel_port: default_control_port(),
            control_channel_host: default_any_host(),
            local_proxy_port: default_proxy_port(),
            local_proxy_host: None,
            sponsor: None,
            identity: IdentitySettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            common_name: default_common_name(),
            validity_days: default_validity_days(),
            algorithm: KeyAlgorithm::default(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            issuance_secs: default_issuance_secs(),
            handshake_secs: default_handshake_secs(),
        }
    }
}

impl NodeConfig {
    /// Default config directory: `~/.lantern`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".lantern"))
    }

    /// Load config from `<config_dir>/config.toml`, falling back to defaults.
    ///
    /// Defaults are saved back to disk; failing to save is only logged.
    pub fn load(config_dir: &Path) -> crate::Result<Self> {
        let path = config_dir.join(CONFIG_FILE);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
            info!(path = %path.display(), "loaded config");
            config
        } else {
            let config = Self {
                config_dir: config_dir.to_path_buf(),
                ..Self::default()
            };
            info!(path = %path.display(), "no config file, using defaults");
            if let Err(e) = config.save() {
                warn!(path = %path.display(), error = %e, "unable to save configuration");
            }
            config
        };

        config.config_dir = config_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Save config to `<config_dir>/config.toml`.
    pub fn save(&self) -> crate::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let content =
            toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))?;
        std::fs::write(self.config_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    /// Reject values the listeners could never use.
    pub fn validate(&self) -> crate::Result<()> {
        self.issuance_port()?;
        if let Some(sponsor) = &self.sponsor {
            sponsor.issuance_port()?;
        }
        if !(1..=MAX_VALIDITY_DAYS).contains(&self.identity.validity_days) {
            return Err(NodeError::Config(format!(
                "identity.validity_days must be between 1 and {MAX_VALIDITY_DAYS}, got {}",
                self.identity.validity_days
            )));
        }
        self.timeouts.validate()
    }

    /// Port of the issuance listener: one above the control channel.
    pub fn issuance_port(&self) -> crate::Result<u16> {
        self.control_channel_port.checked_add(1).ok_or_else(|| {
            NodeError::Config(format!(
                "control_channel_port {} leaves no room for the issuance listener",
                self.control_channel_port
            ))
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.control_channel_host, self.control_channel_port)
    }

    pub fn issuance_addr(&self) -> crate::Result<SocketAddr> {
        Ok(SocketAddr::new(
            self.control_channel_host,
            self.issuance_port()?,
        ))
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.local_proxy_host.unwrap_or_else(default_any_host),
            self.local_proxy_port,
        )
    }

    pub fn key_layout(&self) -> KeyLayout {
        KeyLayout::new(&self.config_dir)
    }

    pub fn identity_options(&self) -> IdentityOptions {
        IdentityOptions {
            profile: CertificateProfile {
                common_name: self.identity.common_name.clone(),
                algorithm: self.identity.algorithm,
                validity_days: self.identity.validity_days,
            },
            authority_hints: Vec::new(),
        }
    }
}

impl TimeoutSettings {
    /// A zero timeout would fail every connect and handshake at once.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, secs) in [
            ("connect_secs", self.connect_secs),
            ("issuance_secs", self.issuance_secs),
            ("handshake_secs", self.handshake_secs),
        ] {
            if secs == 0 {
                return Err(NodeError::Config(format!("timeouts.{name} must be > 0")));
            }
        }
        Ok(())
    }

    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub const fn issuance(&self) -> Duration {
        Duration::from_secs(self.issuance_secs)
    }

    pub const fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }
}

impl SponsorAddress {
    /// The sponsor's issuance listener port.
    pub fn issuance_port(&self) -> crate::Result<u16> {
        self.port.checked_add(1).ok_or_else(|| {
            NodeError::Config(format!("sponsor port {} has no issuance port", self.port))
        })
    }
}

impl fmt::Display for SponsorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for SponsorAddress {
    type Err = NodeError;

    /// Parse `host:port` or `[v6addr]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            || NodeError::Config(format!("invalid sponsor address {s:?}, want host:port"));

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

// Default value functions for serde.
const fn default_control_port() -> u16 {
    DEFAULT_CONTROL_CHANNEL_PORT
}

const fn default_proxy_port() -> u16 {
    DEFAULT_LOCAL_PROXY_PORT
}

const fn default_any_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_common_name() -> String {
    String::from("lantern")
}

const fn default_validity_days() -> u32 {
    7
}

const fn default_connect_secs() -> u64 {
    10
}

const fn default_issuance_secs() -> u64 {
    30
}

const fn default_handshake_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.control_channel_port, 16353);
        assert_eq!(config.issuance_port().unwrap(), 16354);
        assert_eq!(config.local_proxy_port, 8080);
        assert_eq!(config.proxy_addr().ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(config.sponsor.is_none());
        assert_eq!(config.identity.validity_days, 7);
        assert_eq!(config.timeouts.connect(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            local_proxy_port = 8000

            [sponsor]
            ip = "10.0.0.7"
            port = 16300

            [identity]
            algorithm = "ecdsa_p384"
            "#,
        )
        .unwrap();

        assert_eq!(config.local_proxy_port, 8000);
        assert_eq!(config.control_channel_port, 16353);
        assert_eq!(
            config.sponsor,
            Some(SponsorAddress {
                host: "10.0.0.7".into(),
                port: 16300
            })
        );
        assert_eq!(config.identity.algorithm, KeyAlgorithm::EcdsaP384);
        assert_eq!(config.identity.common_name, "lantern");
    }

    #[test]
    fn test_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(config.config_dir, dir.path());
        assert!(dir.path().join(CONFIG_FILE).exists());

        let mut edited = config.clone();
        edited.sponsor = Some("sponsor.example:16353".parse().unwrap());
        edited.save().unwrap();

        let reloaded = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(reloaded.sponsor, edited.sponsor);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "control_channel_port = \"high\"").unwrap();
        assert!(matches!(
            NodeConfig::load(dir.path()),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_top_port_rejected() {
        let config = NodeConfig {
            control_channel_port: u16::MAX,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validity_days_bounded() {
        let mut config = NodeConfig::default();
        config.identity.validity_days = 4_000_000;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        config.identity.validity_days = 0;
        assert!(config.validate().is_err());

        config.identity.validity_days = MAX_VALIDITY_DAYS;
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for field in 0..3 {
            let mut config = NodeConfig::default();
            match field {
                0 => config.timeouts.connect_secs = 0,
                1 => config.timeouts.issuance_secs = 0,
                _ => config.timeouts.handshake_secs = 0,
            }
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("timeouts."), "{err}");
        }
    }

    #[test]
    fn test_sponsor_address_parsing() {
        let v4: SponsorAddress = "192.168.1.20:16353".parse().unwrap();
        assert_eq!(v4.host, "192.168.1.20");
        assert_eq!(v4.issuance_port().unwrap(), 16354);

        let v6: SponsorAddress = "[::1]:9000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");

        assert!("no-port".parse::<SponsorAddress>().is_err());
        assert!(":80".parse::<SponsorAddress>().is_err());
        assert!("host:http".parse::<SponsorAddress>().is_err());
    }
}
