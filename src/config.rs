//! Pump configuration.
//!
//! A configuration file names one or more pumps and the idle-wait policy:
//!
//! ```toml
//! [idle_wait]
//! poll_interval_ms = 50
//! timeout_ms = 120000
//!
//! [[pumps]]
//! name = "Tecan"
//! syringe_volume_ml = 5.0
//! increment_mode = 0      # 0 = standard, 1 = microstep
//! stroke_steps = 3000     # full-stroke class of the pump: 3000 or 24000
//! address = "1"
//! port = "/dev/ttyUSB0"
//! ```
//!
//! Values can be overridden with `CSERIES_`-prefixed environment variables,
//! nested keys separated by `__` (e.g. `CSERIES_IDLE_WAIT__TIMEOUT_MS=5000`).
//!
//! [`PumpRegistry::resolve`] turns a named entry into a validated, immutable
//! [`PumpConfig`].

use crate::error::{PumpError, PumpResult};
use crate::idle::IdleWait;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Step resolution selected with the `N` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementMode {
    /// `N0`
    Standard,
    /// `N1`, eight times the resolution
    MicroStep,
}

impl IncrementMode {
    /// Decode the `N` operand (0 or 1).
    pub fn from_code(code: u8) -> PumpResult<Self> {
        match code {
            0 => Ok(IncrementMode::Standard),
            1 => Ok(IncrementMode::MicroStep),
            other => Err(PumpError::ConfigInvalid(format!(
                "increment mode {} (expected 0 = standard or 1 = microstep)",
                other
            ))),
        }
    }

    /// Operand for the `N` command.
    pub fn code(self) -> u8 {
        match self {
            IncrementMode::Standard => 0,
            IncrementMode::MicroStep => 1,
        }
    }
}

/// Physical full-stroke step count of the pump in standard mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrokeClass {
    /// 3000 steps
    ThreeThousand,
    /// 24000 steps
    TwentyFourThousand,
}

impl StrokeClass {
    /// Decode the configured stroke step count (3000 or 24000).
    pub fn from_steps(steps: u32) -> PumpResult<Self> {
        match steps {
            3000 => Ok(StrokeClass::ThreeThousand),
            24000 => Ok(StrokeClass::TwentyFourThousand),
            other => Err(PumpError::ConfigInvalid(format!(
                "stroke class {} (expected 3000 or 24000)",
                other
            ))),
        }
    }

    /// Standard-mode full stroke.
    pub fn steps(self) -> u32 {
        match self {
            StrokeClass::ThreeThousand => 3000,
            StrokeClass::TwentyFourThousand => 24000,
        }
    }
}

/// Full-stroke step count for a mode / stroke class pair.
pub fn max_steps(mode: IncrementMode, class: StrokeClass) -> u32 {
    match (mode, class) {
        (IncrementMode::Standard, StrokeClass::ThreeThousand) => 3000,
        (IncrementMode::Standard, StrokeClass::TwentyFourThousand) => 24000,
        (IncrementMode::MicroStep, StrokeClass::ThreeThousand) => 24000,
        (IncrementMode::MicroStep, StrokeClass::TwentyFourThousand) => 196000,
    }
}

/// Full-stroke step count from raw configuration codes.
///
/// Any pair outside the four documented combinations is `ConfigInvalid`.
pub fn derive_max_steps(mode_code: u8, stroke_steps: u32) -> PumpResult<u32> {
    let mode = IncrementMode::from_code(mode_code)?;
    let class = StrokeClass::from_steps(stroke_steps)?;
    Ok(max_steps(mode, class))
}

/// Resolved configuration for one pump. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpConfig {
    /// Registry key, also used in log lines
    pub name: String,
    /// Syringe capacity in mL
    pub syringe_volume_ml: f64,
    /// Step resolution uploaded by `configure`
    pub increment_mode: IncrementMode,
    /// Physical stroke of the pump model
    pub stroke_class: StrokeClass,
    /// `L` operand
    pub acceleration_slope: u32,
    /// `v` operand, steps per second
    pub start_velocity: u32,
    /// `V` operand, steps per second
    pub top_velocity: u32,
    /// `c` operand, steps per second
    pub cutoff_velocity: u32,
    /// `C` operand
    pub cutoff_increment: u32,
    /// Device address character
    pub address: char,
    /// Serial port path
    pub port: String,
    /// Line speed
    pub baud_rate: u32,
    /// Transport read timeout for one reply line
    pub timeout: Duration,
}

impl PumpConfig {
    /// Config with the device's power-up defaults for everything but identity.
    pub fn new(
        name: impl Into<String>,
        syringe_volume_ml: f64,
        increment_mode: IncrementMode,
        stroke_class: StrokeClass,
        address: char,
        port: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            syringe_volume_ml,
            increment_mode,
            stroke_class,
            acceleration_slope: default_acceleration_slope(),
            start_velocity: default_start_velocity(),
            top_velocity: default_top_velocity(),
            cutoff_velocity: default_cutoff_velocity(),
            cutoff_increment: 0,
            address,
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout: Duration::from_millis(default_timeout_ms()),
        }
    }

    /// Plunger steps for a full syringe.
    pub fn max_steps(&self) -> u32 {
        max_steps(self.increment_mode, self.stroke_class)
    }

    /// Check invariants the type system cannot express.
    pub fn validate(&self) -> PumpResult<()> {
        if !(self.syringe_volume_ml.is_finite() && self.syringe_volume_ml > 0.0) {
            return Err(PumpError::ConfigInvalid(format!(
                "pump '{}': syringe volume must be positive, got {}",
                self.name, self.syringe_volume_ml
            )));
        }
        validate_address(self.address).map_err(|reason| {
            PumpError::ConfigInvalid(format!("pump '{}': {}", self.name, reason))
        })?;
        if self.baud_rate == 0 {
            return Err(PumpError::ConfigInvalid(format!(
                "pump '{}': baud rate must be non-zero",
                self.name
            )));
        }
        Ok(())
    }
}

fn validate_address(address: char) -> Result<(), String> {
    if address.is_ascii_graphic() && address != '/' {
        Ok(())
    } else {
        Err(format!("invalid device address {:?}", address))
    }
}

/// One `[[pumps]]` entry as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpSettings {
    /// Name used with `--pump` and [`PumpRegistry::resolve`]
    pub name: String,
    /// Syringe capacity in mL
    pub syringe_volume_ml: f64,
    /// 0 = standard, 1 = microstep
    #[serde(default)]
    pub increment_mode: u8,
    /// Full-stroke class: 3000 or 24000
    pub stroke_steps: u32,
    /// Single address character, as a string
    pub address: String,
    /// Serial port path
    pub port: String,
    /// Defaults to 9600
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout for one reply line
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Defaults to 14
    #[serde(default = "default_acceleration_slope")]
    pub acceleration_slope: u32,
    /// Defaults to 900
    #[serde(default = "default_start_velocity")]
    pub start_velocity: u32,
    /// Defaults to 5600
    #[serde(default = "default_top_velocity")]
    pub top_velocity: u32,
    /// Defaults to 900
    #[serde(default = "default_cutoff_velocity")]
    pub cutoff_velocity: u32,
    /// Defaults to 0
    #[serde(default)]
    pub cutoff_increment: u32,
}

impl TryFrom<&PumpSettings> for PumpConfig {
    type Error = PumpError;

    fn try_from(settings: &PumpSettings) -> PumpResult<Self> {
        let context = |e: PumpError| match e {
            PumpError::ConfigInvalid(msg) => {
                PumpError::ConfigInvalid(format!("pump '{}': {}", settings.name, msg))
            }
            other => other,
        };
        let increment_mode = IncrementMode::from_code(settings.increment_mode).map_err(context)?;
        let stroke_class = StrokeClass::from_steps(settings.stroke_steps).map_err(context)?;

        let mut chars = settings.address.chars();
        let address = match (chars.next(), chars.next()) {
            (Some(c), None) => c,
            _ => {
                return Err(PumpError::ConfigInvalid(format!(
                    "pump '{}': address must be a single character, got {:?}",
                    settings.name, settings.address
                )))
            }
        };

        let config = PumpConfig {
            name: settings.name.clone(),
            syringe_volume_ml: settings.syringe_volume_ml,
            increment_mode,
            stroke_class,
            acceleration_slope: settings.acceleration_slope,
            start_velocity: settings.start_velocity,
            top_velocity: settings.top_velocity,
            cutoff_velocity: settings.cutoff_velocity,
            cutoff_increment: settings.cutoff_increment,
            address,
            port: settings.port.clone(),
            baud_rate: settings.baud_rate,
            timeout: Duration::from_millis(settings.timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

/// `[idle_wait]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleWaitSettings {
    /// Sleep before each poll (default 50)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall bound in milliseconds (default two minutes)
    #[serde(default = "default_idle_timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// Poll count bound, off by default
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for IdleWaitSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_idle_timeout_ms(),
            max_attempts: None,
        }
    }
}

impl IdleWaitSettings {
    /// Convert to the runtime form.
    pub fn to_idle_wait(&self) -> IdleWait {
        IdleWait {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: self.timeout_ms.map(Duration::from_millis),
            max_attempts: self.max_attempts,
        }
    }
}

// ============================================================================
// Default value functions (C-Series mode 0 power-up defaults)
// ============================================================================

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_acceleration_slope() -> u32 {
    14
}

fn default_start_velocity() -> u32 {
    900
}

fn default_top_velocity() -> u32 {
    5600
}

fn default_cutoff_velocity() -> u32 {
    900
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_idle_timeout_ms() -> Option<u64> {
    Some(120_000)
}

/// All pumps named in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpRegistry {
    /// Shared by every pump
    #[serde(default)]
    pub idle_wait: IdleWaitSettings,
    /// `[[pumps]]` entries in file order
    #[serde(default)]
    pub pumps: Vec<PumpSettings>,
}

impl PumpRegistry {
    /// Load from a TOML file merged with `CSERIES_` environment overrides.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if the file does not exist or fails validation,
    /// `ConfigLoad` if it cannot be parsed.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PumpResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PumpError::ConfigInvalid(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Parse from an in-memory TOML document (environment overrides still apply).
    pub fn from_toml_str(toml: &str) -> PumpResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> PumpResult<Self> {
        let registry: Self = figment
            .merge(Env::prefixed("CSERIES_").split("__"))
            .extract()?;
        registry.validate()?;
        Ok(registry)
    }

    /// Checks:
    /// - pump names are non-empty and unique
    /// - every pump entry resolves to a valid [`PumpConfig`]
    /// - the poll interval is non-zero
    pub fn validate(&self) -> PumpResult<()> {
        if self.idle_wait.poll_interval_ms == 0 {
            return Err(PumpError::ConfigInvalid(
                "idle_wait.poll_interval_ms must be non-zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for pump in &self.pumps {
            if pump.name.trim().is_empty() {
                return Err(PumpError::ConfigInvalid(
                    "pump name cannot be empty".to_string(),
                ));
            }
            if !names.insert(pump.name.as_str()) {
                return Err(PumpError::ConfigInvalid(format!(
                    "duplicate pump name '{}'",
                    pump.name
                )));
            }
            PumpConfig::try_from(pump)?;
        }
        Ok(())
    }

    /// Resolve a pump by name.
    pub fn resolve(&self, name: &str) -> PumpResult<PumpConfig> {
        self.pumps
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PumpError::PumpNotFound(name.to_string()))
            .and_then(PumpConfig::try_from)
    }

    /// Pump names in file order.
    pub fn names(&self) -> Vec<&str> {
        self.pumps.iter().map(|p| p.name.as_str()).collect()
    }

    /// Idle-wait settings in runtime form.
    pub fn idle_wait(&self) -> IdleWait {
        self.idle_wait.to_idle_wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TWO_PUMPS: &str = r#"
[idle_wait]
poll_interval_ms = 25

[[pumps]]
name = "Tecan"
syringe_volume_ml = 5.0
increment_mode = 0
stroke_steps = 3000
address = "1"
port = "/dev/ttyUSB0"

[[pumps]]
name = "TriCont"
syringe_volume_ml = 12.5
increment_mode = 1
stroke_steps = 24000
address = "2"
port = "/dev/ttyUSB1"
baud_rate = 38400
top_velocity = 6000
"#;

    #[test]
    fn test_max_steps_table() {
        assert_eq!(derive_max_steps(0, 3000).unwrap(), 3000);
        assert_eq!(derive_max_steps(0, 24000).unwrap(), 24000);
        assert_eq!(derive_max_steps(1, 3000).unwrap(), 24000);
        assert_eq!(derive_max_steps(1, 24000).unwrap(), 196000);
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        for (mode, steps) in [(2, 3000), (0, 196000), (1, 1), (0, 0), (9, 24000)] {
            assert!(matches!(
                derive_max_steps(mode, steps),
                Err(PumpError::ConfigInvalid(_))
            ));
        }
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let registry = PumpRegistry::from_toml_str(TWO_PUMPS).unwrap();
        let tecan = registry.resolve("Tecan").unwrap();
        assert_eq!(tecan.address, '1');
        assert_eq!(tecan.max_steps(), 3000);
        assert_eq!(tecan.baud_rate, 9600);
        assert_eq!(tecan.timeout, Duration::from_secs(1));
        assert_eq!(tecan.acceleration_slope, 14);
        assert_eq!(tecan.top_velocity, 5600);

        let tricont = registry.resolve("TriCont").unwrap();
        assert_eq!(tricont.max_steps(), 196000);
        assert_eq!(tricont.baud_rate, 38400);
        assert_eq!(tricont.top_velocity, 6000);

        assert_eq!(registry.idle_wait().poll_interval, Duration::from_millis(25));
        assert_eq!(registry.idle_wait().timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_resolve_unknown_pump() {
        let registry = PumpRegistry::from_toml_str(TWO_PUMPS).unwrap();
        assert!(matches!(
            registry.resolve("Hamilton"),
            Err(PumpError::PumpNotFound(name)) if name == "Hamilton"
        ));
    }

    #[test]
    fn test_duplicate_pump_names() {
        let toml = TWO_PUMPS.replace("TriCont", "Tecan");
        let err = PumpRegistry::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("duplicate pump name"));
    }

    #[test]
    fn test_invalid_mode_class_pair_in_file() {
        let toml = TWO_PUMPS.replace("stroke_steps = 24000", "stroke_steps = 12000");
        let err = PumpRegistry::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, PumpError::ConfigInvalid(_)));
        assert!(err.to_string().contains("TriCont"));
    }

    #[test]
    fn test_bad_address_and_volume() {
        let toml = TWO_PUMPS.replace("address = \"1\"", "address = \"12\"");
        assert!(PumpRegistry::from_toml_str(&toml).is_err());

        let toml = TWO_PUMPS.replace("syringe_volume_ml = 5.0", "syringe_volume_ml = 0.0");
        assert!(PumpRegistry::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(TWO_PUMPS.as_bytes()).unwrap();
        let registry = PumpRegistry::load_from(file.path()).unwrap();
        assert_eq!(registry.names(), vec!["Tecan", "TriCont"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = PumpRegistry::load_from("/nonexistent/cseries.toml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_validate_direct_config() {
        let mut config = PumpConfig::new(
            "bench",
            5.0,
            IncrementMode::Standard,
            StrokeClass::ThreeThousand,
            '1',
            "/dev/null",
        );
        assert!(config.validate().is_ok());
        config.address = '/';
        assert!(config.validate().is_err());
        config.address = '1';
        config.syringe_volume_ml = f64::NAN;
        assert!(config.validate().is_err());
    }
}
