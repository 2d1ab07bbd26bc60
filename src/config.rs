//! Configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults describing the bench (three TEC controllers, one
//!    ozone generator, three relay modules, one thermocouple)
//! 2. A TOML file
//! 3. Environment variables prefixed with `RIGDAQ_`, nested keys split on `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RIGDAQ_APPLICATION__LOG_LEVEL=debug
//! RIGDAQ_APPLICATION__SIMULATE=true
//! RIGDAQ_VALVES__PORT=/dev/ttyUSB3
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rig_daq::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_from("config/rig.toml")?;
//!     println!("TEC controllers: {}", settings.tec.len());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::protocol::relay::{ModuleAddress, MAX_CHANNELS};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Where instrument settings are saved between runs
    #[serde(default)]
    pub persistence: PersistenceSettings,
    /// Thermoelectric controllers, one port each
    #[serde(default)]
    pub tec: Vec<TecSettings>,
    /// Ozone generators, one port each
    #[serde(default)]
    pub ozone: Vec<OzoneSettings>,
    /// Relay modules sharing one bus
    #[serde(default)]
    pub valves: Option<ValveBusSettings>,
    /// Thermocouple channels
    #[serde(default)]
    pub thermocouples: Vec<ThermocoupleSettings>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Synthesize device replies instead of opening ports
    #[serde(default)]
    pub simulate: bool,
}

/// Settings store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// Directory holding one JSON file per instrument; `None` disables saving
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Port parameters handed to a [`SerialTransport`](crate::adapters::SerialTransport)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Reply terminator
    pub delimiter: String,
    /// Reply timeout, see [`SerialSettings::timeout`]
    pub timeout_ms: u64,
}

impl SerialSettings {
    /// How long a driver waits for a reply to a query. Set-only commands
    /// keep their own short protocol wait.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One thermoelectric controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TecSettings {
    /// Instrument id, unique among controllers
    pub id: String,
    /// Shown as `Description`
    #[serde(default)]
    pub description: String,
    /// Shown as `Details`
    #[serde(default = "default_tec_details")]
    pub details: String,
    /// Serial port path
    #[serde(default)]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_tec_baud")]
    pub baud_rate: u32,
    /// Reply timeout for queries and power frames
    #[serde(default = "default_tec_timeout")]
    pub timeout_ms: u64,
    /// Poll period
    #[serde(default = "default_tec_refresh")]
    pub refresh_ms: u64,
}

impl TecSettings {
    /// Port parameters; replies end with the `^` acknowledgement byte.
    pub fn serial(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            delimiter: "^".to_string(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// One ozone generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OzoneSettings {
    /// Instrument id, unique among generators
    pub id: String,
    /// Shown as `Description`
    #[serde(default)]
    pub description: String,
    /// Shown as `Details`
    #[serde(default)]
    pub details: String,
    /// Serial port path
    #[serde(default)]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_ozone_baud")]
    pub baud_rate: u32,
    /// Reply timeout for readbacks
    #[serde(default = "default_ozone_timeout")]
    pub timeout_ms: u64,
    /// Poll period
    #[serde(default = "default_ozone_refresh")]
    pub refresh_ms: u64,
}

impl OzoneSettings {
    /// Port parameters; replies are CRLF terminated.
    pub fn serial(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            delimiter: "\r\n".to_string(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// The relay bus and the modules on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveBusSettings {
    /// Serial port path shared by every module
    #[serde(default)]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_valve_baud")]
    pub baud_rate: u32,
    /// Reply timeout on the bus
    #[serde(default = "default_valve_timeout")]
    pub timeout_ms: u64,
    /// Poll period of each module
    #[serde(default = "default_valve_refresh")]
    pub refresh_ms: u64,
    /// Modules on the bus
    #[serde(default)]
    pub modules: Vec<RelayModuleSettings>,
}

impl ValveBusSettings {
    /// Port parameters; replies are CR terminated.
    pub fn serial(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            delimiter: "\r".to_string(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// One relay module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayModuleSettings {
    /// Instrument id
    pub id: String,
    /// Two hex digits
    pub address: String,
    /// Shown as `Description`
    #[serde(default)]
    pub description: String,
    /// Shown as `Details`, usually the valve wiring
    #[serde(default)]
    pub details: String,
    /// Channel count used when the module name query fails
    #[serde(default)]
    pub channels: Option<usize>,
}

/// One thermocouple input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermocoupleSettings {
    /// Instrument id
    pub id: String,
    /// Shown as `Description`
    #[serde(default)]
    pub description: String,
    /// DAQ channel number
    #[serde(default)]
    pub channel: u8,
    /// Serial number of the DAQ board
    #[serde(default)]
    pub unique_id: Option<String>,
    /// Poll period
    #[serde(default = "default_thermocouple_refresh")]
    pub refresh_ms: u64,
}

// Default value functions
fn default_name() -> String {
    "rig_daq".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_tec_details() -> String {
    "Setpoint controls Thermistor 1; Power toggle button has 5-second response time".to_string()
}
fn default_tec_baud() -> u32 {
    230_400
}
fn default_tec_timeout() -> u64 {
    600
}
fn default_tec_refresh() -> u64 {
    6000
}
fn default_ozone_baud() -> u32 {
    115_200
}
fn default_ozone_timeout() -> u64 {
    200
}
fn default_ozone_refresh() -> u64 {
    300
}
fn default_valve_baud() -> u32 {
    9600
}
fn default_valve_timeout() -> u64 {
    300
}
fn default_valve_refresh() -> u64 {
    4000
}
fn default_thermocouple_refresh() -> u64 {
    300
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            simulate: false,
        }
    }
}

fn tec(id: &str) -> TecSettings {
    TecSettings {
        id: id.to_string(),
        description: String::new(),
        details: default_tec_details(),
        port: String::new(),
        baud_rate: default_tec_baud(),
        timeout_ms: default_tec_timeout(),
        refresh_ms: default_tec_refresh(),
    }
}

fn relay_module(id: &str, description: &str, details: &str) -> RelayModuleSettings {
    RelayModuleSettings {
        id: id.to_string(),
        address: id.to_string(),
        description: description.to_string(),
        details: details.to_string(),
        channels: None,
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            persistence: PersistenceSettings::default(),
            tec: vec![tec("HFVG"), tec("LFVG"), tec("Sorbent")],
            ozone: vec![OzoneSettings {
                id: "A".to_string(),
                description: String::new(),
                details: String::new(),
                port: String::new(),
                baud_rate: default_ozone_baud(),
                timeout_ms: default_ozone_timeout(),
                refresh_ms: default_ozone_refresh(),
            }],
            valves: Some(ValveBusSettings {
                port: String::new(),
                baud_rate: default_valve_baud(),
                timeout_ms: default_valve_timeout(),
                refresh_ms: default_valve_refresh(),
                modules: vec![
                    relay_module(
                        "01",
                        "Relay Module #1 (Chemical Analysis)",
                        "V0 = Max-IR/Exhaust; V1 = O2/Exhaust; V2 = O3/Exhaust; V3 = Sorbent Tube",
                    ),
                    relay_module("02", "Relay Module #2", "On humidifier/bleed air shelf"),
                    relay_module(
                        "03",
                        "Relay Module #3 (Vapor Generator/Gas Dilution)",
                        "V0 = HFVG; V1 = LFVG; V2 = Gas Mixer; V3 = O3 (Ozone); \
                         V4 = Product Air Test; V5 = Gas Dilution Waste",
                    ),
                ],
            }),
            thermocouples: vec![ThermocoupleSettings {
                id: "A".to_string(),
                description: String::new(),
                channel: 0,
                unique_id: None,
                refresh_ms: default_thermocouple_refresh(),
            }],
        }
    }
}

impl Settings {
    /// Load configuration from a specific file path, over the built-in
    /// defaults and under `RIGDAQ_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Config` if a layer cannot be parsed and
    /// `DaqError::Configuration` if the merged result is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Self::extract(Some(path.as_ref()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Merge the layers without validating, for callers that adjust the
    /// result (command-line overrides) before calling [`Settings::validate`].
    pub fn extract(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment
            .merge(Env::prefixed("RIGDAQ_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Instrument ids are unique within each group
    /// - Relay addresses are two hex digits and unique on the bus
    /// - Timeouts and refresh rates are non-zero
    /// - Ports are set unless simulating
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        unique("tec", self.tec.iter().map(|t| t.id.as_str()))?;
        unique("ozone", self.ozone.iter().map(|o| o.id.as_str()))?;
        unique("thermocouples", self.thermocouples.iter().map(|t| t.id.as_str()))?;

        for t in &self.tec {
            self.check_link("tec", &t.id, &t.port, t.timeout_ms, t.refresh_ms)?;
        }
        for o in &self.ozone {
            self.check_link("ozone", &o.id, &o.port, o.timeout_ms, o.refresh_ms)?;
        }
        for t in &self.thermocouples {
            nonzero("thermocouples", &t.id, "refresh_ms", t.refresh_ms)?;
        }

        if let Some(bus) = &self.valves {
            self.check_link("valves", "bus", &bus.port, bus.timeout_ms, bus.refresh_ms)?;
            unique("valves", bus.modules.iter().map(|m| m.id.as_str()))?;
            let mut addresses = HashSet::new();
            for module in &bus.modules {
                let address = ModuleAddress::parse(&module.address)?;
                if !addresses.insert(address) {
                    return Err(DaqError::Configuration(format!(
                        "valves: address '{}' used twice",
                        module.address
                    )));
                }
                if let Some(channels) = module.channels {
                    if channels == 0 || channels > MAX_CHANNELS {
                        return Err(DaqError::Configuration(format!(
                            "valves.{}: channels must be 1..={}",
                            module.id, MAX_CHANNELS
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_link(
        &self,
        group: &str,
        id: &str,
        port: &str,
        timeout_ms: u64,
        refresh_ms: u64,
    ) -> AppResult<()> {
        nonzero(group, id, "timeout_ms", timeout_ms)?;
        nonzero(group, id, "refresh_ms", refresh_ms)?;
        if port.is_empty() && !self.application.simulate {
            return Err(DaqError::Configuration(format!(
                "{}.{}: port is required unless simulating",
                group, id
            )));
        }
        Ok(())
    }
}

fn unique<'a>(group: &str, ids: impl Iterator<Item = &'a str>) -> AppResult<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(DaqError::Configuration(format!(
                "{}: duplicate id '{}'",
                group, id
            )));
        }
    }
    Ok(())
}

fn nonzero(group: &str, id: &str, field: &str, value: u64) -> AppResult<()> {
    if value == 0 {
        return Err(DaqError::Configuration(format!(
            "{}.{}: {} must be greater than zero",
            group, id, field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn simulated() -> Settings {
        let mut settings = Settings::default();
        settings.application.simulate = true;
        settings
    }

    #[test]
    fn test_defaults_describe_the_bench() {
        let settings = Settings::default();
        assert_eq!(settings.tec.len(), 3);
        assert_eq!(settings.tec[0].serial().baud_rate, 230_400);
        assert_eq!(settings.tec[0].serial().delimiter, "^");
        assert_eq!(settings.tec[0].serial().timeout(), Duration::from_millis(600));
        assert_eq!(settings.ozone[0].serial().delimiter, "\r\n");
        let bus = settings.valves.as_ref().unwrap();
        assert_eq!(bus.modules.len(), 3);
        assert_eq!(bus.refresh_ms, 4000);
    }

    #[test]
    fn test_defaults_need_ports_without_simulation() {
        assert!(Settings::default().validate().is_err());
        assert!(simulated().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = simulated();
        settings.application.log_level = "verbose".to_string();
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut settings = simulated();
        settings.tec.push(settings.tec[0].clone());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bad_relay_address_rejected() {
        let mut settings = simulated();
        if let Some(bus) = settings.valves.as_mut() {
            bus.modules[0].address = "1".to_string();
        }
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
simulate = true

[[tec]]
id = "HFVG"
refresh_ms = 1000

[valves]
modules = [{{ id = "07", address = "07", channels = 4 }}]
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.tec.len(), 1);
        assert_eq!(settings.tec[0].refresh_ms, 1000);
        assert_eq!(settings.tec[0].timeout_ms, 600);
        let bus = settings.valves.unwrap();
        assert_eq!(bus.modules.len(), 1);
        assert_eq!(bus.modules[0].channels, Some(4));
        assert_eq!(bus.baud_rate, 9600);
    }
}
