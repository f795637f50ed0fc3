//! Session configuration: the exercise protocol, the load window to sonify
//! against, and the engine's aesthetic tuning.
//!
//! A session can be described in a RON file. Every section and field is
//! optional and falls back to its default, durations are written as seconds:
//!
//! ```text
//! (
//!     protocol: (work: 7.0, rest: 120.0, sets: 6, countdown: 10.0),
//!     sonification: (target_load: 20.0, tolerance: 2.0),
//!     tuning: (pitch_hz: 440.0, noise_curve: Deadband),
//! )
//! ```

use crate::error::{ConfigurationError, SessionError};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Durations of one protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long each work interval lasts
    #[serde(rename = "work", with = "seconds")]
    pub work_duration: Duration,
    /// How long each rest interval lasts
    #[serde(rename = "rest", with = "seconds")]
    pub rest_duration: Duration,
    /// Number of work/rest cycles
    #[serde(rename = "sets")]
    pub set_count: u32,
    /// Lead-in before the first work interval
    #[serde(rename = "countdown", with = "seconds")]
    pub countdown_duration: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            work_duration: Duration::from_secs(7),
            rest_duration: Duration::from_secs(120),
            set_count: 6,
            countdown_duration: Duration::from_secs(10),
        }
    }
}

impl ProtocolConfig {
    /// All durations must be strictly positive and there must be a set.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, duration) in [
            ("work duration", self.work_duration),
            ("rest duration", self.rest_duration),
            ("countdown duration", self.countdown_duration),
        ] {
            if duration.is_zero() {
                return Err(ConfigurationError::NonPositiveDuration { field });
            }
        }
        if self.set_count == 0 {
            return Err(ConfigurationError::ZeroSetCount);
        }
        Ok(())
    }

    /// Wall time from `start()` to `Complete`.
    /// Saturates at [`Duration::MAX`] for absurdly long protocols.
    pub fn total_duration(&self) -> Duration {
        self.work_duration
            .checked_add(self.rest_duration)
            .and_then(|set| set.checked_mul(self.set_count))
            .and_then(|sets| sets.checked_add(self.countdown_duration))
            .unwrap_or(Duration::MAX)
    }
}

/// The load the user should hold, and how far from it is still on target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonificationConfig {
    /// Load to hold, in sensor units
    pub target_load: f32,
    /// Half-width of the deadband around the target, in sensor units
    pub tolerance: f32,
}

impl Default for SonificationConfig {
    fn default() -> Self {
        Self {
            target_load: 10.0,
            tolerance: 1.0,
        }
    }
}

impl SonificationConfig {
    /// Rejects a tolerance that is not strictly positive. The target is
    /// accepted as-is as long as it is a real number.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.target_load.is_finite() {
            return Err(ConfigurationError::NonFinite {
                field: "target load",
            });
        }
        if !self.tolerance.is_finite() {
            return Err(ConfigurationError::NonFinite { field: "tolerance" });
        }
        if self.tolerance <= 0.0 {
            return Err(ConfigurationError::NonPositiveTolerance(self.tolerance));
        }
        Ok(())
    }

    /// Distance from the target in units of tolerance: 0 on target, 1 at the
    /// edge of the deadband, unbounded past it.
    pub fn error(&self, load: f32) -> f32 {
        (load - self.target_load).abs() / self.tolerance
    }
}

/// How the normalised error maps onto noise level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoiseCurve {
    /// Silent strictly inside the tolerance. Jumps to half the ceiling at the
    /// tolerance edge and ramps linearly to the full ceiling at twice it.
    #[default]
    Deadband,
    /// Ramps linearly from the target to the ceiling at the tolerance edge.
    Proportional,
}

impl NoiseCurve {
    /// Noise level in `[0, 1]` for a normalised error.
    pub fn level(self, error: f32) -> f32 {
        // NaN compares false everywhere and lands on zero
        match self {
            NoiseCurve::Deadband if error >= 1.0 => (error / 2.0).clamp(0.5, 1.0),
            NoiseCurve::Deadband => 0.0,
            NoiseCurve::Proportional if error > 0.0 => error.min(1.0),
            NoiseCurve::Proportional => 0.0,
        }
    }
}

/// Aesthetic constants of the sonification engine and protocol clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    /// Reference tone frequency
    pub pitch_hz: f32,
    /// Peak amplitude of the reference tone
    pub tone_level: f32,
    /// Peak amplitude of the noise when fully off target
    pub noise_ceiling: f32,
    /// Error to noise mapping
    pub noise_curve: NoiseCurve,
    /// One-pole time constant for gain changes while armed
    #[serde(with = "seconds")]
    pub smoothing: Duration,
    /// Linear ramp to silence when disarmed or stale
    #[serde(with = "seconds")]
    pub release: Duration,
    /// Sensor silence after which feedback is muted
    #[serde(with = "seconds")]
    pub stale_after: Duration,
    /// Protocol timer period
    #[serde(with = "seconds")]
    pub tick: Duration,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            pitch_hz: 500.0,
            tone_level: 0.2,
            noise_ceiling: 0.5,
            noise_curve: NoiseCurve::Deadband,
            smoothing: Duration::from_millis(30),
            release: Duration::from_millis(5),
            stale_after: Duration::from_millis(500),
            tick: Duration::from_millis(100),
        }
    }
}

impl EngineTuning {
    /// Checks the values the engine divides by or feeds to the oscillator.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |field, reason| Err(ConfigurationError::InvalidTuning { field, reason });
        if !(self.pitch_hz.is_finite() && self.pitch_hz > 0.0) {
            return invalid("pitch_hz", "must be a positive frequency");
        }
        for (field, level) in [
            ("tone_level", self.tone_level),
            ("noise_ceiling", self.noise_ceiling),
        ] {
            if !(0.0..=1.0).contains(&level) {
                return invalid(field, "must be between 0 and 1");
            }
        }
        for (field, duration) in [
            ("smoothing", self.smoothing),
            ("release", self.release),
            ("stale_after", self.stale_after),
            ("tick", self.tick),
        ] {
            if duration.is_zero() {
                return invalid(field, "must be greater than zero");
            }
        }
        Ok(())
    }
}

/// Everything a session file may carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFile {
    /// Protocol section
    pub protocol: ProtocolConfig,
    /// Sonification section
    pub sonification: SonificationConfig,
    /// Tuning section
    pub tuning: EngineTuning,
}

impl SessionFile {
    /// Reads and parses a RON session file. Values are not validated here;
    /// the session controller does that when the session starts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Parses a RON session description.
    pub fn from_ron(text: &str) -> Result<Self, SessionError> {
        Ok(ron::from_str(text)?)
    }
}

/// `Duration`s as floating point seconds, kept to microsecond precision.
mod seconds {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!(
                "expected a non-negative number of seconds, got {secs}"
            )));
        }
        Ok(Duration::from_micros((secs * 1e6).round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_protocol_is_valid() {
        assert_eq!(ProtocolConfig::default().validate(), Ok(()));
        assert_eq!(
            ProtocolConfig::default().total_duration(),
            Duration::from_secs(10 + 127 * 6)
        );
    }

    #[test]
    fn total_duration_saturates() {
        let huge = ProtocolConfig {
            work_duration: Duration::from_secs(1_000_000_000_000_000),
            set_count: 100_000,
            ..Default::default()
        };
        assert_eq!(huge.validate(), Ok(()));
        assert_eq!(huge.total_duration(), Duration::MAX);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let cfg = ProtocolConfig {
            rest_duration: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigurationError::NonPositiveDuration {
                field: "rest duration"
            })
        );

        let cfg = ProtocolConfig {
            set_count: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigurationError::ZeroSetCount));
    }

    #[test]
    fn tolerance_must_be_positive() {
        let zero = SonificationConfig {
            target_load: 20.0,
            tolerance: 0.0,
        };
        assert_eq!(
            zero.validate(),
            Err(ConfigurationError::NonPositiveTolerance(0.0))
        );

        let negative = SonificationConfig {
            tolerance: -1.0,
            ..zero
        };
        assert!(negative.validate().is_err());

        // A zero target is fine
        let at_zero = SonificationConfig {
            target_load: 0.0,
            tolerance: 0.5,
        };
        assert_eq!(at_zero.validate(), Ok(()));
    }

    #[test]
    fn error_is_measured_in_tolerances() {
        let cfg = SonificationConfig {
            target_load: 20.0,
            tolerance: 2.0,
        };
        assert_eq!(cfg.error(20.0), 0.0);
        assert_eq!(cfg.error(22.0), 1.0);
        assert_eq!(cfg.error(18.0), 1.0);
        assert_eq!(cfg.error(26.0), 3.0);
    }

    #[test]
    fn deadband_curve() {
        let curve = NoiseCurve::Deadband;
        assert_eq!(curve.level(0.0), 0.0);
        assert_eq!(curve.level(0.999), 0.0);
        assert_eq!(curve.level(1.0), 0.5);
        assert_eq!(curve.level(1.5), 0.75);
        assert_eq!(curve.level(2.0), 1.0);
        assert_eq!(curve.level(3.0), 1.0);
        assert_eq!(curve.level(f32::NAN), 0.0);
    }

    #[test]
    fn curves_are_monotone() {
        for curve in [NoiseCurve::Deadband, NoiseCurve::Proportional] {
            let mut last = 0.0;
            for step in 0..=300 {
                let level = curve.level(step as f32 / 100.0);
                assert!(level >= last, "{curve:?} dipped at step {step}");
                last = level;
            }
        }
        assert_eq!(NoiseCurve::Proportional.level(0.5), 0.5);
        assert_eq!(NoiseCurve::Proportional.level(3.0), 1.0);
    }

    #[test]
    fn bad_tuning_is_rejected() {
        assert_eq!(EngineTuning::default().validate(), Ok(()));
        let tuning = EngineTuning {
            noise_ceiling: 1.5,
            ..Default::default()
        };
        assert!(tuning.validate().is_err());
        let tuning = EngineTuning {
            pitch_hz: 0.0,
            ..Default::default()
        };
        assert!(tuning.validate().is_err());
        let tuning = EngineTuning {
            release: Duration::ZERO,
            ..Default::default()
        };
        assert!(tuning.validate().is_err());
    }

    #[test]
    fn partial_session_file_uses_defaults() {
        let file = SessionFile::from_ron(
            "(protocol: (work: 5.0, sets: 3), sonification: (target_load: 20.0, tolerance: 2.0))",
        )
        .unwrap();
        assert_eq!(file.protocol.work_duration, Duration::from_secs(5));
        assert_eq!(file.protocol.set_count, 3);
        assert_eq!(file.protocol.rest_duration, Duration::from_secs(120));
        assert_eq!(file.sonification.target_load, 20.0);
        assert_eq!(file.tuning, EngineTuning::default());
    }

    #[test]
    fn session_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "(tuning: (pitch_hz: 440.0, smoothing: 0.05, noise_curve: Proportional))"
        )
        .unwrap();

        let loaded = SessionFile::load(file.path()).unwrap();
        assert_eq!(loaded.tuning.pitch_hz, 440.0);
        assert_eq!(loaded.tuning.smoothing, Duration::from_millis(50));
        assert_eq!(loaded.tuning.noise_curve, NoiseCurve::Proportional);
        assert_eq!(loaded.protocol, ProtocolConfig::default());
    }

    #[test]
    fn negative_seconds_fail_to_parse() {
        let res = SessionFile::from_ron("(protocol: (work: -1.0))");
        assert!(matches!(res, Err(SessionError::SessionFile(_))));
    }

    #[test]
    fn session_file_round_trips() {
        let file = SessionFile::default();
        let text = ron::to_string(&file).unwrap();
        assert_eq!(SessionFile::from_ron(&text).unwrap(), file);
    }
}
