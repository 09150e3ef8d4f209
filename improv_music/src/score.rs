// The canonical note model: Score → Track → Note.
//
// A Score is built either from sanitized LLM output (via `Score::from_value`)
// or from a decoded MIDI file (decode.rs). Times are in seconds; the encoder
// converts to ticks using `MidiConfig`. The serde representation is exactly
// the JSON shape the generation prompt asks for:
//
//   { "tracks": [ { "instrument": 0, "notes": [
//         {"pitch": 60, "time": 0.0, "duration": 1.0, "velocity": 64} ] } ],
//     "time_signatures": ["4/4"], "key_signatures": [] }
//
// `from_value` is the lenient gate between free-form JSON and this typed
// model: missing note fields take defaults, out-of-range pitch/velocity are
// clamped into 7 bits, and anything non-numeric is rejected with the path of
// the offending field.

use crate::error::EncodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_PITCH: u8 = 60;
pub const DEFAULT_VELOCITY: u8 = 64;
pub const DEFAULT_DURATION: f64 = 1.0;
pub const DEFAULT_TIME_SIGNATURE: &str = "4/4";

/// A single note event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// MIDI pitch (0-127).
    pub pitch: u8,
    /// Onset in seconds from the start of the piece.
    #[serde(rename = "time")]
    pub onset: f64,
    /// Duration in seconds, always positive.
    pub duration: f64,
    /// Note-on velocity (0-127).
    pub velocity: u8,
}

impl Note {
    pub fn new(pitch: u8, onset: f64, duration: f64, velocity: u8) -> Self {
        Note {
            pitch,
            onset,
            duration,
            velocity,
        }
    }

    /// Time in seconds at which the note stops sounding.
    pub fn end(&self) -> f64 {
        self.onset + self.duration
    }
}

/// One instrument part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Track name, when one was present in a decoded file or the JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// General MIDI program number.
    #[serde(rename = "instrument", default)]
    pub program: u8,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl Track {
    pub fn new(program: u8, notes: Vec<Note>) -> Self {
        Track {
            name: None,
            program,
            notes,
        }
    }

    /// Latest note end in the track, or `None` for an empty track.
    pub fn last_end(&self) -> Option<f64> {
        self.notes.iter().map(Note::end).reduce(f64::max)
    }
}

/// The full musical structure passed between pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub time_signatures: Vec<String>,
    #[serde(default)]
    pub key_signatures: Vec<String>,
}

impl Score {
    /// Total number of notes across all tracks.
    pub fn total_notes(&self) -> usize {
        self.tracks.iter().map(|t| t.notes.len()).sum()
    }

    /// The authoritative time signature: the first entry, or 4/4.
    pub fn time_signature(&self) -> &str {
        self.time_signatures
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_TIME_SIGNATURE)
    }

    /// The authoritative key signature, if any.
    pub fn key_signature(&self) -> Option<&str> {
        self.key_signatures.first().map(String::as_str)
    }

    /// Serialize into the Score JSON shape.
    pub fn to_value(&self) -> Value {
        // Derived Serialize on plain data cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Validate a Score-shaped JSON value into a typed Score.
    ///
    /// Defaults: instrument 0, pitch 60, time 0, duration 1, velocity 64.
    /// Pitch, velocity and instrument are rounded and clamped to 0..=127;
    /// negative onsets are clamped to 0. Non-numeric values, non-finite
    /// numbers and non-positive durations are rejected.
    pub fn from_value(value: &Value) -> Result<Score, EncodeError> {
        let root = value.as_object().ok_or_else(|| EncodeError::InvalidField {
            location: "score".into(),
            field: "tracks",
            reason: format!("expected an object, found {}", kind(value)),
        })?;

        let tracks = match root.get("tracks") {
            Some(Value::Array(tracks)) => tracks,
            Some(other) => {
                return Err(EncodeError::InvalidField {
                    location: "score".into(),
                    field: "tracks",
                    reason: format!("expected an array, found {}", kind(other)),
                });
            }
            None => {
                return Err(EncodeError::InvalidField {
                    location: "score".into(),
                    field: "tracks",
                    reason: "missing".into(),
                });
            }
        };

        let tracks = tracks
            .iter()
            .enumerate()
            .map(|(ti, track)| track_from_value(ti, track))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Score {
            tracks,
            time_signatures: string_list(root, "time_signatures")?,
            key_signatures: string_list(root, "key_signatures")?,
        })
    }
}

fn track_from_value(ti: usize, value: &Value) -> Result<Track, EncodeError> {
    let location = format!("tracks[{ti}]");
    let obj = value.as_object().ok_or_else(|| EncodeError::InvalidField {
        location: location.clone(),
        field: "track",
        reason: format!("expected an object, found {}", kind(value)),
    })?;

    let program = match obj.get("instrument") {
        None | Some(Value::Null) => 0,
        Some(v) => seven_bit(&location, "instrument", v)?,
    };

    let name = match obj.get("name") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };

    let notes = match obj.get("notes") {
        None => Vec::new(),
        Some(Value::Array(notes)) => notes
            .iter()
            .enumerate()
            .map(|(ni, note)| note_from_value(&format!("{location}.notes[{ni}]"), note))
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(EncodeError::InvalidField {
                location,
                field: "notes",
                reason: format!("expected an array, found {}", kind(other)),
            });
        }
    };

    Ok(Track {
        name,
        program,
        notes,
    })
}

fn note_from_value(location: &str, value: &Value) -> Result<Note, EncodeError> {
    let obj = value.as_object().ok_or_else(|| EncodeError::InvalidField {
        location: location.to_string(),
        field: "note",
        reason: format!("expected an object, found {}", kind(value)),
    })?;

    let pitch = match obj.get("pitch") {
        Some(v) => seven_bit(location, "pitch", v)?,
        None => DEFAULT_PITCH,
    };
    let velocity = match obj.get("velocity") {
        Some(v) => seven_bit(location, "velocity", v)?,
        None => DEFAULT_VELOCITY,
    };
    let onset = match obj.get("time") {
        Some(v) => number(location, "time", v)?.max(0.0),
        None => 0.0,
    };
    let duration = match obj.get("duration") {
        Some(v) => number(location, "duration", v)?,
        None => DEFAULT_DURATION,
    };
    if duration <= 0.0 {
        return Err(EncodeError::InvalidField {
            location: location.to_string(),
            field: "duration",
            reason: format!("must be positive, got {duration}"),
        });
    }

    Ok(Note {
        pitch,
        onset,
        duration,
        velocity,
    })
}

fn number(location: &str, field: &'static str, value: &Value) -> Result<f64, EncodeError> {
    let n = value.as_f64().ok_or_else(|| EncodeError::InvalidField {
        location: location.to_string(),
        field,
        reason: format!("expected a number, found {}", kind(value)),
    })?;
    if !n.is_finite() {
        return Err(EncodeError::InvalidField {
            location: location.to_string(),
            field,
            reason: "not a finite number".into(),
        });
    }
    Ok(n)
}

/// Round and clamp a numeric field into the MIDI 7-bit range.
fn seven_bit(location: &str, field: &'static str, value: &Value) -> Result<u8, EncodeError> {
    let n = number(location, field, value)?;
    Ok(n.round().clamp(0.0, 127.0) as u8)
}

fn string_list(root: &Map<String, Value>, field: &'static str) -> Result<Vec<String>, EncodeError> {
    match root.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(EncodeError::InvalidField {
                    location: format!("{field}[{i}]"),
                    field,
                    reason: format!("expected a string, found {}", kind(other)),
                }),
            })
            .collect(),
        Some(other) => Err(EncodeError::InvalidField {
            location: "score".into(),
            field,
            reason: format!("expected an array, found {}", kind(other)),
        }),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
