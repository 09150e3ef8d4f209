// Tunable parameters for encoding and augmentation.
//
// Every timing constant and clamp bound the core uses lives here rather than
// as a literal at the call site, so tests can run the encoder and augmenter
// against alternate tunings. `ImprovConfig` is loaded from JSON; all structs
// use `#[serde(default)]` so a config file only needs the keys it overrides.
//
// The pitch bounds 33–85 and velocity bounds 32–127 are conventions of this
// system (the range the generation prompt asks the model for), not MIDI
// limits. The encoder itself accepts the full 7-bit range.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Microseconds per quarter note written to the tempo track (120 BPM).
pub const DEFAULT_TEMPO_US: u32 = 500_000;

/// MIDI resolution, ticks per quarter note.
pub const DEFAULT_TICKS_PER_QUARTER: u16 = 480;

/// Inclusive pitch range perturbed notes are clamped to.
pub const DEFAULT_PITCH_BOUNDS: (u8, u8) = (33, 85);

/// Inclusive velocity range perturbed notes are clamped to.
pub const DEFAULT_VELOCITY_BOUNDS: (u8, u8) = (32, 127);

/// Chance that an appended note is perturbed rather than copied verbatim.
pub const DEFAULT_PERTURB_PROBABILITY: f64 = 0.3;

/// Minimum note count the generation prompt asks for.
pub const DEFAULT_MIN_NOTES: usize = 100;

/// Encoder settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Tempo in microseconds per quarter note.
    pub tempo_us: u32,
    /// Ticks per quarter note.
    pub ticks_per_quarter: u16,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            tempo_us: DEFAULT_TEMPO_US,
            ticks_per_quarter: DEFAULT_TICKS_PER_QUARTER,
        }
    }
}

impl MidiConfig {
    /// Ticks per second at this tempo and resolution (960 at the defaults).
    pub fn ticks_per_second(&self) -> f64 {
        f64::from(self.ticks_per_quarter) * 1_000_000.0 / f64::from(self.tempo_us)
    }

    /// Convert a time in seconds to the nearest tick.
    pub fn seconds_to_ticks(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.ticks_per_second()).round() as u64
    }

    /// Tempo in beats per minute.
    pub fn bpm(&self) -> f64 {
        60_000_000.0 / f64::from(self.tempo_us)
    }
}

/// Perturbation bounds for the note-count augmenter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Probability that an appended note is perturbed.
    pub perturb_probability: f64,
    /// Maximum absolute pitch shift in semitones.
    pub pitch_shift: i32,
    /// Inclusive clamp range for perturbed pitches.
    pub pitch_bounds: (u8, u8),
    /// Maximum absolute velocity shift.
    pub velocity_shift: i32,
    /// Inclusive clamp range for perturbed velocities.
    pub velocity_bounds: (u8, u8),
    /// Inclusive range of the duration scale factor.
    pub duration_scale: (f64, f64),
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            perturb_probability: DEFAULT_PERTURB_PROBABILITY,
            pitch_shift: 3,
            pitch_bounds: DEFAULT_PITCH_BOUNDS,
            velocity_shift: 10,
            velocity_bounds: DEFAULT_VELOCITY_BOUNDS,
            duration_scale: (0.8, 1.2),
        }
    }
}

/// Top-level configuration for the repair/encode core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovConfig {
    pub midi: MidiConfig,
    pub augment: AugmentConfig,
    /// Minimum total note count enforced by the augmenter.
    pub min_notes: usize,
}

impl Default for ImprovConfig {
    fn default() -> Self {
        Self {
            midi: MidiConfig::default(),
            augment: AugmentConfig::default(),
            min_notes: DEFAULT_MIN_NOTES,
        }
    }
}

impl ImprovConfig {
    /// Parse a config from a JSON string. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ImprovConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject values the encoder or augmenter cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.midi.tempo_us == 0 || self.midi.tempo_us > 0x00FF_FFFF {
            return Err(ConfigError::Invalid(format!(
                "tempo_us must be in 1..=16777215, got {}",
                self.midi.tempo_us
            )));
        }
        if self.midi.ticks_per_quarter == 0 || self.midi.ticks_per_quarter > 0x7FFF {
            return Err(ConfigError::Invalid(format!(
                "ticks_per_quarter must be in 1..=32767, got {}",
                self.midi.ticks_per_quarter
            )));
        }
        let a = &self.augment;
        if !(0.0..=1.0).contains(&a.perturb_probability) {
            return Err(ConfigError::Invalid(format!(
                "perturb_probability must be in [0, 1], got {}",
                a.perturb_probability
            )));
        }
        if a.pitch_shift < 0 || a.velocity_shift < 0 {
            return Err(ConfigError::Invalid("shift amounts must be non-negative".into()));
        }
        if a.pitch_bounds.0 > a.pitch_bounds.1 || a.pitch_bounds.1 > 127 {
            return Err(ConfigError::Invalid(format!(
                "pitch_bounds {:?} must be an ordered range within 0..=127",
                a.pitch_bounds
            )));
        }
        if a.velocity_bounds.0 > a.velocity_bounds.1 || a.velocity_bounds.1 > 127 {
            return Err(ConfigError::Invalid(format!(
                "velocity_bounds {:?} must be an ordered range within 0..=127",
                a.velocity_bounds
            )));
        }
        let (lo, hi) = a.duration_scale;
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "duration_scale {:?} must be a positive ordered range",
                a.duration_scale
            )));
        }
        Ok(())
    }
}

/// Failure to load a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_rate_is_960_per_second() {
        let midi = MidiConfig::default();
        assert_eq!(midi.ticks_per_second(), 960.0);
        assert_eq!(midi.seconds_to_ticks(1.0), 960);
        assert_eq!(midi.seconds_to_ticks(2.4), 2304);
        assert_eq!(midi.bpm(), 120.0);
    }

    #[test]
    fn seconds_to_ticks_rounds_to_nearest() {
        let midi = MidiConfig::default();
        // 0.0015 s = 1.44 ticks, 0.0016 s = 1.536 ticks
        assert_eq!(midi.seconds_to_ticks(0.0015), 1);
        assert_eq!(midi.seconds_to_ticks(0.0016), 2);
        assert_eq!(midi.seconds_to_ticks(-1.0), 0);
    }

    #[test]
    fn alternate_tuning_changes_tick_rate() {
        let midi = MidiConfig {
            tempo_us: 1_000_000,
            ticks_per_quarter: 96,
        };
        assert_eq!(midi.ticks_per_second(), 96.0);
        assert_eq!(midi.seconds_to_ticks(0.5), 48);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = ImprovConfig::from_json(r#"{"min_notes": 12, "augment": {"pitch_shift": 5}}"#)
            .unwrap();
        assert_eq!(config.min_notes, 12);
        assert_eq!(config.augment.pitch_shift, 5);
        assert_eq!(config.augment.pitch_bounds, DEFAULT_PITCH_BOUNDS);
        assert_eq!(config.midi, MidiConfig::default());
    }

    #[test]
    fn empty_json_uses_prompt_minimum() {
        let config = ImprovConfig::from_json("{}").unwrap();
        assert_eq!(config.min_notes, DEFAULT_MIN_NOTES);
        assert_eq!(config, ImprovConfig::default());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = ImprovConfig::from_json(r#"{"augment": {"pitch_bounds": [90, 30]}}"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_tempo() {
        let err = ImprovConfig::from_json(r#"{"midi": {"tempo_us": 0}}"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_probability() {
        let err = ImprovConfig::from_json(r#"{"augment": {"perturb_probability": 1.5}}"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }
}
