use crate::domain::controller::ControllerSettings;
use crate::domain::parameters::{default_parameters, ParameterCatalogue, ParameterDef};
use crate::domain::pedal::{default_bindings, PedalBinding};
use crate::domain::tuner::TunerSettings;
use crate::infrastructure::bluetooth::protocol::{DEFAULT_MTU, MIDI_IO_CHAR_UUID, MIDI_SERVICE_UUID};
use crate::infrastructure::bluetooth::transport::ReconnectPolicy;
use crate::infrastructure::midi::sysex::SysExProfile;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
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
    "boss_cube_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// One BLE-MIDI peripheral (amp or pedal)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub enabled: bool,
    /// Advertised name prefix to connect to
    pub name_prefix: String,
    /// Pin a specific peripheral address instead of matching by name
    pub address: Option<String>,
    pub service_uuid: String,
    pub write_char_uuid: String,
    pub notify_char_uuid: String,
    /// ATT MTU to packetize against; btleplug does not report the negotiated value
    pub mtu: usize,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl LinkSettings {
    pub fn amp() -> Self {
        Self {
            enabled: true,
            name_prefix: "CUBE".to_string(),
            address: None,
            service_uuid: MIDI_SERVICE_UUID.to_string(),
            write_char_uuid: MIDI_IO_CHAR_UUID.to_string(),
            notify_char_uuid: MIDI_IO_CHAR_UUID.to_string(),
            mtu: DEFAULT_MTU,
            scan_timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn pedal() -> Self {
        Self {
            enabled: false,
            name_prefix: "FS-1-WL".to_string(),
            ..Self::amp()
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::amp()
    }
}

/// Fields missing from a link section come from that role's defaults, not
/// the amp's
fn overlay_link<'de, D: Deserializer<'de>>(
    base: LinkSettings,
    deserializer: D,
) -> Result<LinkSettings, D::Error> {
    use serde::de::Error;

    let patch = serde_json::Value::deserialize(deserializer)?;
    let mut merged = serde_json::to_value(base).map_err(D::Error::custom)?;
    if let (Some(fields), serde_json::Value::Object(patch)) = (merged.as_object_mut(), patch) {
        fields.extend(patch);
    }
    serde_json::from_value(merged).map_err(D::Error::custom)
}

fn amp_link<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LinkSettings, D::Error> {
    overlay_link(LinkSettings::amp(), deserializer)
}

fn pedal_link<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LinkSettings, D::Error> {
    overlay_link(LinkSettings::pedal(), deserializer)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE links
    #[serde(default = "LinkSettings::amp", deserialize_with = "amp_link")]
    pub amp: LinkSettings,
    #[serde(default = "LinkSettings::pedal", deserialize_with = "pedal_link")]
    pub pedal: LinkSettings,

    // Protocol
    #[serde(default)]
    pub sysex: SysExProfile,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub tuner: TunerSettings,

    #[serde(default = "default_bindings")]
    pub pedal_bindings: Vec<PedalBinding>,

    /// Replaces the built-in parameter table when present
    #[serde(default)]
    pub parameters: Option<Vec<ParameterDef>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            amp: LinkSettings::amp(),
            pedal: LinkSettings::pedal(),
            sysex: SysExProfile::default(),
            controller: ControllerSettings::default(),
            tuner: TunerSettings::default(),
            pedal_bindings: default_bindings(),
            parameters: None,
        }
    }
}

impl Settings {
    /// Parameter table with entries the codec cannot address dropped
    pub fn catalogue(&self) -> ParameterCatalogue {
        let defs = self
            .parameters
            .clone()
            .unwrap_or_else(default_parameters)
            .into_iter()
            .filter(|def| {
                let usable = def.min <= def.max
                    && def.max < 0x80
                    && def.address.len() == self.sysex.address_width;
                if !usable {
                    warn!(
                        "Dropping parameter '{}' [{}]: range {}..={} or address width {} unusable",
                        def.name,
                        def.address,
                        def.min,
                        def.max,
                        def.address.len()
                    );
                }
                usable
            })
            .collect();
        let catalogue = ParameterCatalogue::new(defs);
        if catalogue.is_empty() {
            warn!("No usable parameters configured");
        }
        catalogue
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from `settings_path`, falling back to defaults if the file is
    /// missing or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!("Ignoring unreadable settings {:?}: {}", settings_path, e);
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BossCubeRemote");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        info!("Settings saved to {:?}", self.settings_path);
        Ok(())
    }

    /// Write the defaults out on first run so they can be edited
    pub fn save_if_missing(&self) -> anyhow::Result<()> {
        if !self.settings_path.exists() {
            self.save()?;
        }
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
