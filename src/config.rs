//! Rig configuration loaded from TOML.
//!
//! ```toml
//! inputs = ["Lin", "Cin", "Rin"]
//! outputs = ["ValveL", "ValveR"]
//!
//! [interface]
//! kind = "serial"
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//!
//! [interface.pins]
//! ValveL = 4
//! ValveR = 5
//!
//! [session]
//! max_duration_secs = 3600
//! max_trials = 100
//! on_hardware_error = "stop"
//!
//! [timing]
//! overrun_slack_ms = 2.0
//! ```

use crate::builder::{ConfigurationError, LabelKind};
use crate::core::{MAX_INPUTS, MAX_OUTPUTS};
use crate::executor::{Emulator, HardwareExecutor};
use crate::validation::rules;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or applying a [`RigConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid line declaration: {0}")]
    Lines(#[from] ConfigurationError),

    #[error("Pin mapping names undeclared line '{0}'")]
    UnknownPin(String),

    #[error("Invalid timing setting: {0}")]
    Timing(String),

    #[error("Serial support not compiled in (enable the `serial` feature) for port {port}")]
    SerialUnavailable { port: String },

    #[cfg(feature = "serial")]
    #[error("Failed to open serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
}

/// Which hardware interface executes trials.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// In-process emulator with a software timer.
    #[default]
    Emulator,
    /// Microcontroller on a serial port.
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Optional label -> pin mapping sent with the line declaration.
        #[serde(default)]
        pins: BTreeMap<String, u8>,
    },
}

fn default_baud_rate() -> u32 {
    115_200
}

/// What the controller does after a trial fails with a hardware error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwarePolicy {
    /// End the session.
    #[default]
    Stop,
    /// Skip the failed trial and request the next one.
    Continue,
}

/// Session limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_duration_secs: f64,
    pub max_trials: Option<u32>,
    pub on_hardware_error: HardwarePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 3600.0,
            max_trials: None,
            on_hardware_error: HardwarePolicy::Stop,
        }
    }
}

impl SessionConfig {
    /// Saturates at `Duration::MAX`, which never trips the watchdog.
    pub fn max_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_duration_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn with_max_trials(mut self, max_trials: u32) -> Self {
        self.max_trials = Some(max_trials);
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration_secs = duration.as_secs_f64();
        self
    }

    pub fn with_policy(mut self, policy: HardwarePolicy) -> Self {
        self.on_hardware_error = policy;
        self
    }
}

/// Executor timing knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// A timer firing later than nominal by more than this is a timing overrun.
    pub overrun_slack_ms: f64,
    /// Final stretch before a deadline that the emulator busy-waits instead of sleeping.
    pub spin_margin_us: u64,
    pub handshake_timeout_ms: u64,
    /// How long the driver waits for the device to confirm an abort.
    pub abort_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            overrun_slack_ms: 2.0,
            spin_margin_us: 0,
            handshake_timeout_ms: 3000,
            abort_timeout_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn overrun_slack(&self) -> Duration {
        Duration::try_from_secs_f64(self.overrun_slack_ms.max(0.0) / 1000.0)
            .unwrap_or(Duration::MAX)
    }

    pub fn spin_margin(&self) -> Duration {
        Duration::from_micros(self.spin_margin_us)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}

/// Complete description of one behavioral rig.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl RigConfig {
    /// Emulator rig with default limits.
    pub fn emulated<I, O, S, T>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check label lists, pin mapping and timing values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = rules::label_problems(LabelKind::Input, &self.inputs, MAX_INPUTS);
        problems.extend(rules::label_problems(
            LabelKind::Output,
            &self.outputs,
            MAX_OUTPUTS,
        ));
        if let Some(problem) = problems.into_iter().next() {
            return Err(problem.into());
        }

        if let InterfaceConfig::Serial { pins, .. } = &self.interface {
            if let Some(label) = pins
                .keys()
                .find(|label| !self.inputs.contains(label) && !self.outputs.contains(label))
            {
                return Err(ConfigError::UnknownPin(label.clone()));
            }
        }

        if Duration::try_from_secs_f64(self.timing.overrun_slack_ms / 1000.0).is_err() {
            return Err(ConfigError::Timing(format!(
                "overrun_slack_ms must be a non-negative duration, got {}",
                self.timing.overrun_slack_ms
            )));
        }
        if self.session.max_duration_secs <= 0.0
            || Duration::try_from_secs_f64(self.session.max_duration_secs).is_err()
        {
            return Err(ConfigError::Timing(format!(
                "max_duration_secs must be a positive duration, got {}",
                self.session.max_duration_secs
            )));
        }
        Ok(())
    }
}

/// Build the executor selected by `config.interface`.
pub fn build_executor(config: &RigConfig) -> Result<Box<dyn HardwareExecutor>, ConfigError> {
    match &config.interface {
        InterfaceConfig::Emulator => Ok(Box::new(Emulator::new(
            config.inputs.clone(),
            config.outputs.clone(),
            config.timing.clone(),
        ))),

        #[cfg(feature = "serial")]
        InterfaceConfig::Serial {
            port,
            baud_rate,
            pins,
        } => {
            let stream = crate::executor::device::open_serial(port, *baud_rate).map_err(|source| {
                ConfigError::Serial {
                    port: port.clone(),
                    source,
                }
            })?;
            Ok(Box::new(
                crate::executor::device::SerialDevice::new(
                    stream,
                    config.inputs.clone(),
                    config.outputs.clone(),
                    config.timing.clone(),
                )
                .with_name(port.clone())
                .with_pins(pins.clone()),
            ))
        }

        #[cfg(not(feature = "serial"))]
        InterfaceConfig::Serial { port, .. } => {
            Err(ConfigError::SerialUnavailable { port: port.clone() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RIG: &str = r#"
        inputs = ["Lin", "Cin", "Rin"]
        outputs = ["ValveL", "ValveR"]

        [session]
        max_trials = 20
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = RigConfig::from_toml_str(RIG).unwrap();

        assert_eq!(config.interface, InterfaceConfig::Emulator);
        assert_eq!(config.session.max_duration(), Duration::from_secs(3600));
        assert_eq!(config.session.max_trials, Some(20));
        assert_eq!(config.session.on_hardware_error, HardwarePolicy::Stop);
        assert_eq!(config.timing.overrun_slack(), Duration::from_millis(2));
        assert_eq!(config.timing.handshake_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn serial_interface_parses_pins() {
        let text = r#"
            inputs = ["Cin"]
            outputs = ["ValveL"]

            [interface]
            kind = "serial"
            port = "/dev/ttyACM0"

            [interface.pins]
            ValveL = 4
            Cin = 7

            [session]
            on_hardware_error = "continue"
        "#;
        let config = RigConfig::from_toml_str(text).unwrap();

        match &config.interface {
            InterfaceConfig::Serial {
                port,
                baud_rate,
                pins,
            } => {
                assert_eq!(port, "/dev/ttyACM0");
                assert_eq!(*baud_rate, 115_200);
                assert_eq!(pins.get("Cin"), Some(&7));
            }
            other => panic!("Expected serial interface, got {other:?}"),
        }
        assert_eq!(config.session.on_hardware_error, HardwarePolicy::Continue);
    }

    #[test]
    fn pin_for_undeclared_line_fails() {
        let text = r#"
            inputs = ["Cin"]
            outputs = ["ValveL"]

            [interface]
            kind = "serial"
            port = "COM3"

            [interface.pins]
            Buzzer = 9
        "#;
        assert!(matches!(
            RigConfig::from_toml_str(text),
            Err(ConfigError::UnknownPin(label)) if label == "Buzzer"
        ));
    }

    #[test]
    fn reserved_input_label_fails() {
        let text = r#"
            inputs = ["Tup"]
            outputs = ["ValveL"]
        "#;
        assert!(matches!(
            RigConfig::from_toml_str(text),
            Err(ConfigError::Lines(ConfigurationError::ReservedLabel { .. }))
        ));
    }

    #[test]
    fn negative_slack_fails() {
        let mut config = RigConfig::emulated(["Cin"], ["ValveL"]);
        config.timing.overrun_slack_ms = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Timing(_))));
    }

    #[test]
    fn unrepresentable_durations_fail() {
        let toml = r#"
inputs = ["Cin"]
outputs = ["ValveL"]

[session]
max_duration_secs = 1e300
"#;
        let config = RigConfig::from_toml_str(toml);
        assert!(matches!(config, Err(ConfigError::Timing(_))), "{config:?}");

        let mut config = RigConfig::emulated(["Cin"], ["ValveL"]);
        config.timing.overrun_slack_ms = 1e300;
        assert!(matches!(config.validate(), Err(ConfigError::Timing(_))));
        assert_eq!(config.timing.overrun_slack(), Duration::MAX);
    }

    #[test]
    fn unlimited_session_saturates() {
        let session = SessionConfig::default().with_max_duration(Duration::MAX);
        assert_eq!(session.max_duration(), Duration::MAX);

        let session = SessionConfig::default().with_max_duration(Duration::from_secs(90));
        assert_eq!(session.max_duration(), Duration::from_secs(90));
    }

    #[test]
    fn malformed_toml_fails() {
        assert!(matches!(
            RigConfig::from_toml_str("inputs = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn emulator_is_built_by_default() {
        let config = RigConfig::emulated(["Cin"], ["ValveL"]);
        let executor = build_executor(&config).unwrap();
        assert_eq!(executor.name(), "emulator");
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn serial_without_feature_is_reported() {
        let mut config = RigConfig::emulated(["Cin"], ["ValveL"]);
        config.interface = InterfaceConfig::Serial {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            pins: BTreeMap::new(),
        };
        assert!(matches!(
            build_executor(&config),
            Err(ConfigError::SerialUnavailable { .. })
        ));
    }
}
