use crate::domain::models::PeripheralAddress;
use crate::infrastructure::bluetooth::protocol::{ButtonMode, Color};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "powered_up_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// How long a connect attempt scans for a remote
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Upper bound for connect + discovery + subscribe once a remote is found
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Port input mode requested from the remote firmware
    #[serde(default)]
    pub button_mode: ButtonMode,
    /// Only this remote may be promoted when set
    #[serde(default)]
    pub pinned_address: Option<PeripheralAddress>,
    /// Light color written once the remote is ready; `null` leaves it alone
    #[serde(default = "default_initial_color")]
    pub initial_color: Option<Color>,
    #[serde(default)]
    pub known_addresses: Vec<PeripheralAddress>,
    #[serde(default)]
    pub last_connected_address: Option<PeripheralAddress>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            button_mode: ButtonMode::default(),
            pinned_address: None,
            initial_color: default_initial_color(),
            known_addresses: Vec::new(),
            last_connected_address: None,
            log_settings: LogSettings::default(),
        }
    }
}

impl RemoteSettings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_scan_timeout_ms() -> u64 {
    5000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_initial_color() -> Option<Color> {
    Some(Color::Blue)
}

pub struct SettingsService {
    settings: RemoteSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("PoweredUpRemote");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<RemoteSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &RemoteSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut RemoteSettings {
        &mut self.settings
    }

    /// Remember a remote that completed the handshake.
    pub fn record_connection(&mut self, address: PeripheralAddress) -> anyhow::Result<()> {
        if !self.settings.known_addresses.contains(&address) {
            self.settings.known_addresses.push(address);
        }
        self.settings.last_connected_address = Some(address);
        self.save()
    }
}
