//! Camera settings domain and the versioned settings store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::ControlError;

/// Direction for relative setting changes. Stepping wraps at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Up,
    Down,
}

/// Wire form accepted for ISO and shutter values: `400`, `"400"`, `"1/250"`, `"auto"`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ValueRepr {
    Number(u32),
    Text(String),
}

/// Sensor sensitivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "ValueRepr", into = "String")]
pub enum Iso {
    #[default]
    Auto,
    Iso100,
    Iso200,
    Iso400,
    Iso800,
    Iso1600,
    Iso3200,
}

impl Iso {
    pub const ALL: [Iso; 7] = [
        Iso::Auto,
        Iso::Iso100,
        Iso::Iso200,
        Iso::Iso400,
        Iso::Iso800,
        Iso::Iso1600,
        Iso::Iso3200,
    ];

    /// Numeric sensitivity, `None` for automatic exposure
    pub fn value(self) -> Option<u32> {
        match self {
            Iso::Auto => None,
            Iso::Iso100 => Some(100),
            Iso::Iso200 => Some(200),
            Iso::Iso400 => Some(400),
            Iso::Iso800 => Some(800),
            Iso::Iso1600 => Some(1600),
            Iso::Iso3200 => Some(3200),
        }
    }

    /// Analogue gain the sensor needs for this ISO (ISO 100 = unity gain)
    pub fn analogue_gain(self) -> Option<f32> {
        self.value().map(|v| v as f32 / 100.0)
    }

    pub fn from_value(value: u32) -> Result<Self, ControlError> {
        Self::ALL
            .iter()
            .copied()
            .find(|iso| iso.value() == Some(value))
            .ok_or_else(|| ControlError::InvalidValue(format!("unsupported ISO {}", value)))
    }

    pub fn step(self, step: Step) -> Self {
        let index = Self::ALL.iter().position(|i| *i == self).unwrap_or(0);
        Self::ALL[wrap_index(index, Self::ALL.len(), step)]
    }
}

impl fmt::Display for Iso {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => write!(f, "{}", v),
            None => f.write_str("Auto"),
        }
    }
}

impl FromStr for Iso {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Iso::Auto);
        }
        let value = s
            .strip_prefix("ISO")
            .or_else(|| s.strip_prefix("iso"))
            .unwrap_or(s)
            .trim()
            .parse::<u32>()
            .map_err(|_| ControlError::InvalidValue(format!("unsupported ISO '{}'", s)))?;
        Iso::from_value(value)
    }
}

impl TryFrom<ValueRepr> for Iso {
    type Error = ControlError;

    fn try_from(repr: ValueRepr) -> Result<Self, Self::Error> {
        match repr {
            ValueRepr::Number(v) => Iso::from_value(v),
            ValueRepr::Text(s) => s.parse(),
        }
    }
}

impl From<Iso> for String {
    fn from(iso: Iso) -> Self {
        iso.to_string()
    }
}

/// Exposure time, expressed as `1/denominator` seconds or automatic.
///
/// Only the enumerated stops between 1/4000s and 1/4s are constructible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "ValueRepr", into = "String")]
pub struct ShutterSpeed {
    denominator: Option<u32>,
}

impl ShutterSpeed {
    pub const AUTO: ShutterSpeed = ShutterSpeed { denominator: None };

    /// Supported denominators, fastest first
    pub const STOPS: [u32; 11] = [4000, 2000, 1000, 500, 250, 125, 60, 30, 15, 8, 4];

    pub fn one_over(denominator: u32) -> Result<Self, ControlError> {
        if Self::STOPS.contains(&denominator) {
            Ok(ShutterSpeed {
                denominator: Some(denominator),
            })
        } else {
            Err(ControlError::InvalidValue(format!(
                "unsupported shutter speed 1/{}",
                denominator
            )))
        }
    }

    pub fn all() -> impl Iterator<Item = ShutterSpeed> {
        std::iter::once(Self::AUTO).chain(
            Self::STOPS
                .iter()
                .map(|d| ShutterSpeed { denominator: Some(*d) }),
        )
    }

    pub fn is_auto(self) -> bool {
        self.denominator.is_none()
    }

    pub fn denominator(self) -> Option<u32> {
        self.denominator
    }

    /// Exposure time in microseconds, `None` for automatic exposure
    pub fn exposure_us(self) -> Option<u32> {
        self.denominator.map(|d| 1_000_000 / d)
    }

    /// `Up` moves towards longer exposures, `Down` towards faster ones
    pub fn step(self, step: Step) -> Self {
        let all: Vec<ShutterSpeed> = Self::all().collect();
        let index = all.iter().position(|s| *s == self).unwrap_or(0);
        all[wrap_index(index, all.len(), step)]
    }
}

impl fmt::Display for ShutterSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.denominator {
            Some(d) => write!(f, "1/{}", d),
            None => f.write_str("Auto"),
        }
    }
}

impl FromStr for ShutterSpeed {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ShutterSpeed::AUTO);
        }
        let denominator = s.strip_prefix("1/").unwrap_or(s).trim_end_matches('s');
        let denominator = denominator
            .parse::<u32>()
            .map_err(|_| ControlError::InvalidValue(format!("unsupported shutter speed '{}'", s)))?;
        ShutterSpeed::one_over(denominator)
    }
}

impl TryFrom<ValueRepr> for ShutterSpeed {
    type Error = ControlError;

    fn try_from(repr: ValueRepr) -> Result<Self, Self::Error> {
        match repr {
            ValueRepr::Number(d) => ShutterSpeed::one_over(d),
            ValueRepr::Text(s) => s.parse(),
        }
    }
}

impl From<ShutterSpeed> for String {
    fn from(speed: ShutterSpeed) -> Self {
        speed.to_string()
    }
}

fn wrap_index(index: usize, len: usize, step: Step) -> usize {
    match step {
        Step::Up => (index + 1) % len,
        Step::Down => (index + len - 1) % len,
    }
}

/// Device power mode. Transitions are explicit commands, never inferred
/// from what the display driver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    Active,
    MonitorOff,
    Standby,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::Active => "active",
            PowerState::MonitorOff => "monitor_off",
            PowerState::Standby => "standby",
        };
        f.write_str(name)
    }
}

/// The shared mutable state every surface observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraSettings {
    pub iso: Iso,
    pub shutter: ShutterSpeed,
    /// Black and white rendering (saturation 0)
    pub monochrome: bool,
    pub power: PowerState,
}

/// Settings together with the version they were published under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettingsSnapshot {
    pub settings: CameraSettings,
    pub version: u64,
}

/// Versioned settings store with change notification.
///
/// Cloning yields another handle onto the same store. Only the camera
/// controller writes; everyone else reads snapshots or subscribes.
#[derive(Clone)]
pub struct SettingsStore {
    tx: Arc<watch::Sender<SettingsSnapshot>>,
}

impl SettingsStore {
    pub fn new(initial: CameraSettings) -> Self {
        let (tx, _rx) = watch::channel(SettingsSnapshot {
            settings: initial,
            version: 1,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn read(&self) -> SettingsSnapshot {
        *self.tx.borrow()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Replace the settings if the store is still at `expected_version`.
    ///
    /// Returns the new version. A stale version never applies.
    pub fn compare_and_set(
        &self,
        expected_version: u64,
        settings: CameraSettings,
    ) -> Result<SettingsSnapshot, ControlError> {
        let mut outcome = Err(ControlError::StaleWrite {
            expected: expected_version,
            current: 0,
        });

        self.tx.send_if_modified(|current| {
            if current.version != expected_version {
                outcome = Err(ControlError::StaleWrite {
                    expected: expected_version,
                    current: current.version,
                });
                return false;
            }
            current.settings = settings;
            current.version += 1;
            outcome = Ok(*current);
            true
        });

        outcome
    }

    /// Change notifications. The receiver starts marked as changed so the
    /// first `changed()` yields the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SettingsSnapshot> {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        rx
    }
}
