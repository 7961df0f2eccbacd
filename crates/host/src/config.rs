//! Host configuration management

use crate::supervisor::SupervisorSettings;
use crate::usb::{ClassDefinition, DeviceKind, TypeConfig};
use anyhow::{Context, Result, anyhow};
use common::ClassId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Machine-wide, so one host runs whichever user starts it
const DEFAULT_RUNTIME_DIR: &str = "/tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub idle: IdleSettings,
    #[serde(default)]
    pub servers: ServerSettings,
    /// Recognized device classes
    #[serde(default = "HostConfig::default_classes")]
    pub classes: Vec<ClassEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
    /// Name of the instance lock and startup signal
    #[serde(default = "HostSettings::default_instance_name")]
    pub instance_name: String,
    /// Directory for the instance lock and startup signal. Must be shared
    /// by every user that may start a host; defaults to `/tmp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            instance_name: Self::default_instance_name(),
            runtime_dir: None,
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_instance_name() -> String {
        "receiver-host".to_string()
    }
}

/// Idle shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleSettings {
    /// Shut down after `threshold` consecutive samples with no connections
    #[serde(default = "IdleSettings::default_enabled")]
    pub enabled: bool,
    #[serde(default = "IdleSettings::default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "IdleSettings::default_threshold")]
    pub threshold: u32,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            poll_interval_secs: Self::default_poll_interval(),
            threshold: Self::default_threshold(),
        }
    }
}

impl IdleSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_poll_interval() -> u64 {
        5
    }

    fn default_threshold() -> u32 {
        3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_control")]
    pub control: ListenerSettings,
    #[serde(default = "ServerSettings::default_streaming")]
    pub streaming: ListenerSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            control: Self::default_control(),
            streaming: Self::default_streaming(),
        }
    }
}

impl ServerSettings {
    fn default_control() -> ListenerSettings {
        ListenerSettings {
            bind_addr: "127.0.0.1:40774".to_string(),
        }
    }

    fn default_streaming() -> ListenerSettings {
        ListenerSettings {
            bind_addr: "127.0.0.1:40775".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    pub bind_addr: String,
}

/// One `[[classes]]` entry
///
/// # Example Configuration
/// ```toml
/// [[classes]]
/// kind = "pxmlt"
/// usb_id = "0x0511:0x024e"
/// description = "PX-MLT5PE"
///
/// [classes.config]
/// tuners = 5
///
/// [[classes]]
/// kind = "px4"
/// class_id = "{0511083F-7573-6264-8000-000000000000}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassEntry {
    /// Driver kind tag ("px4", "pxmlt")
    pub kind: String,
    /// Interface class identifier in GUID form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
    /// USB vendor/product pair ("0xVID:0xPID")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Passed to the driver untouched
    #[serde(default, skip_serializing_if = "TypeConfig::is_empty")]
    pub config: TypeConfig,
}

impl ClassEntry {
    fn usb(kind: DeviceKind, usb_id: &str, description: &str) -> Self {
        Self {
            kind: kind.tag().to_string(),
            class_id: None,
            usb_id: Some(usb_id.to_string()),
            description: Some(description.to_string()),
            config: TypeConfig::new(),
        }
    }

    fn with_tuners(mut self, tuners: i64) -> Self {
        self.config
            .insert("tuners".to_string(), toml::Value::Integer(tuners));
        self
    }

    /// Resolve the entry's class identifier
    pub fn resolve_class_id(&self) -> Result<ClassId> {
        match (&self.class_id, &self.usb_id) {
            (Some(text), None) => text
                .parse()
                .map_err(|e| anyhow!("Invalid class_id '{}': {}", text, e)),
            (None, Some(usb_id)) => {
                let (vendor_id, product_id) = HostConfig::parse_usb_id(usb_id)?;
                Ok(ClassId::from_usb_ids(vendor_id, product_id))
            }
            (Some(_), Some(_)) => Err(anyhow!(
                "Class '{}' sets both class_id and usb_id, use one",
                self.kind
            )),
            (None, None) => Err(anyhow!(
                "Class '{}' needs either class_id or usb_id",
                self.kind
            )),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings::default(),
            idle: IdleSettings::default(),
            servers: ServerSettings::default(),
            classes: Self::default_classes(),
        }
    }
}

impl HostConfig {
    /// Known receivers
    fn default_classes() -> Vec<ClassEntry> {
        vec![
            ClassEntry::usb(DeviceKind::Px4, "0x0511:0x083f", "PX-W3U4"),
            ClassEntry::usb(DeviceKind::Px4, "0x0511:0x084a", "PX-Q3U4"),
            ClassEntry::usb(DeviceKind::Px4, "0x0511:0x023f", "PX-W3PE4"),
            ClassEntry::usb(DeviceKind::Px4, "0x0511:0x024a", "PX-Q3PE4"),
            ClassEntry::usb(DeviceKind::PxMlt, "0x0511:0x024e", "PX-MLT5PE").with_tuners(5),
            ClassEntry::usb(DeviceKind::PxMlt, "0x0511:0x0252", "PX-MLT8PE").with_tuners(8),
        ]
    }

    /// Load configuration from the specified path
    ///
    /// Without a path, the standard locations are tried in order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/receiver-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("receiver-host").join("host.toml")
        } else {
            PathBuf::from(".config/receiver-host/host.toml")
        }
    }

    /// Directory holding the instance lock and startup signal
    pub fn runtime_dir(&self) -> PathBuf {
        match &self.host.runtime_dir {
            Some(dir) => expand_path(dir),
            None => PathBuf::from(DEFAULT_RUNTIME_DIR),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let mut settings = SupervisorSettings::new(self.runtime_dir(), &self.host.instance_name);
        settings.poll_interval = Duration::from_secs(self.idle.poll_interval_secs);
        settings.idle_threshold = self.idle.threshold;
        settings.idle_shutdown = self.idle.enabled;
        settings
    }

    /// Class definitions for the device manager
    ///
    /// Entries with an unrecognized kind are dropped with a warning.
    pub fn class_definitions(&self) -> Vec<ClassDefinition> {
        let mut definitions = Vec::with_capacity(self.classes.len());

        for entry in &self.classes {
            let Some(kind) = DeviceKind::from_tag(&entry.kind) else {
                tracing::warn!("Dropping class with unknown kind '{}'", entry.kind);
                continue;
            };
            let class_id = match entry.resolve_class_id() {
                Ok(class_id) => class_id,
                Err(e) => {
                    tracing::warn!("Dropping class: {:#}", e);
                    continue;
                }
            };
            definitions
                .push(ClassDefinition::new(class_id, kind).with_config(entry.config.clone()));
        }

        definitions
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        let name = &self.host.instance_name;
        if name.is_empty() || name.contains('/') {
            return Err(anyhow!("Invalid instance name '{}'", name));
        }

        if self.idle.poll_interval_secs == 0 {
            return Err(anyhow!("idle.poll_interval_secs must be greater than 0"));
        }
        if self.idle.threshold == 0 {
            return Err(anyhow!("idle.threshold must be greater than 0"));
        }

        for (label, listener) in [
            ("control", &self.servers.control),
            ("streaming", &self.servers.streaming),
        ] {
            listener.bind_addr.parse::<SocketAddr>().map_err(|_| {
                anyhow!(
                    "Invalid {} bind address '{}', expected IP:PORT",
                    label,
                    listener.bind_addr
                )
            })?;
        }

        for entry in &self.classes {
            entry.resolve_class_id()?;
        }

        Ok(())
    }

    /// Parse a USB vendor/product pair ("0xVID:0xPID")
    pub fn parse_usb_id(usb_id: &str) -> Result<(u16, u16)> {
        let parts: Vec<&str> = usb_id.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid usb_id '{}', expected VID:PID (e.g., '0x0511:0x083f')",
                usb_id
            ));
        }

        let vendor_id = Self::parse_hex_id(parts[0], "VID")?;
        let product_id = Self::parse_hex_id(parts[1], "PID")?;
        Ok((vendor_id, product_id))
    }

    /// Parse a hex ID (VID or PID)
    fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x0511')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }
}

/// Expand `~` and environment variables in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}
