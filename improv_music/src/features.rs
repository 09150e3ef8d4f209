// Descriptive statistics over a Score, used as the retrieval query for
// similar pieces and embedded in the generation prompt.
//
// `to_query_text` renders one "Label: value" line per feature in a fixed
// order so identical pieces always produce identical query strings.

use crate::config::DEFAULT_TEMPO_US;
use crate::score::Score;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// A flat feature map keyed by feature name.
pub type FeatureMap = BTreeMap<String, Value>;

/// Inclusive min/max of some per-note quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub min: u8,
    pub max: u8,
}

/// Summary statistics for one piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub tempo_bpm: f64,
    pub time_signatures: Vec<String>,
    pub key_signatures: Vec<String>,
    pub notes_per_track: Vec<usize>,
    pub instruments: Vec<u8>,
    /// Notes per second over the span from first onset to last note end.
    pub note_density: f64,
    pub pitch_range: Option<Span>,
    pub velocity_range: Option<Span>,
    pub average_duration: f64,
    /// Seconds from 0 to the latest note end.
    pub total_duration: f64,
}

/// Summarize a Score at the default tempo of 120 BPM.
pub fn summarize(score: &Score) -> FeatureSummary {
    let notes = || score.tracks.iter().flat_map(|t| t.notes.iter());
    let count = notes().count();

    let first_onset = notes().map(|n| n.onset).reduce(f64::min).unwrap_or(0.0);
    let last_end = notes().map(|n| n.end()).reduce(f64::max).unwrap_or(0.0);
    let span = last_end - first_onset;

    let range = |values: &mut dyn Iterator<Item = u8>| {
        values.fold(None, |acc: Option<Span>, v| {
            Some(match acc {
                None => Span { min: v, max: v },
                Some(s) => Span {
                    min: s.min.min(v),
                    max: s.max.max(v),
                },
            })
        })
    };

    FeatureSummary {
        tempo_bpm: 60_000_000.0 / f64::from(DEFAULT_TEMPO_US),
        time_signatures: score.time_signatures.clone(),
        key_signatures: score.key_signatures.clone(),
        notes_per_track: score.tracks.iter().map(|t| t.notes.len()).collect(),
        instruments: score.tracks.iter().map(|t| t.program).collect(),
        note_density: if span > 0.0 { count as f64 / span } else { 0.0 },
        pitch_range: range(&mut notes().map(|n| n.pitch)),
        velocity_range: range(&mut notes().map(|n| n.velocity)),
        average_duration: if count > 0 {
            notes().map(|n| n.duration).sum::<f64>() / count as f64
        } else {
            0.0
        },
        total_duration: last_end,
    }
}

impl FeatureSummary {
    /// Replace the tempo with the one a decoded file declared.
    pub fn with_tempo_us(mut self, tempo_us: u32) -> Self {
        if tempo_us > 0 {
            self.tempo_bpm = 60_000_000.0 / f64::from(tempo_us);
        }
        self
    }

    pub fn total_notes(&self) -> usize {
        self.notes_per_track.iter().sum()
    }

    pub fn to_feature_map(&self) -> FeatureMap {
        let span = |s: Option<Span>| match s {
            Some(s) => json!([s.min, s.max]),
            None => Value::Null,
        };
        let mut map = FeatureMap::new();
        map.insert("tempo_bpm".into(), json!(round2(self.tempo_bpm)));
        map.insert("time_signatures".into(), json!(self.time_signatures));
        map.insert("key_signatures".into(), json!(self.key_signatures));
        map.insert("track_count".into(), json!(self.notes_per_track.len()));
        map.insert("notes_per_track".into(), json!(self.notes_per_track));
        map.insert("instruments".into(), json!(self.instruments));
        map.insert("total_notes".into(), json!(self.total_notes()));
        map.insert("note_density".into(), json!(round2(self.note_density)));
        map.insert("pitch_range".into(), span(self.pitch_range));
        map.insert("velocity_range".into(), span(self.velocity_range));
        map.insert(
            "average_duration".into(),
            json!(round2(self.average_duration)),
        );
        map.insert("total_duration".into(), json!(round2(self.total_duration)));
        map
    }

    pub fn to_query_text(&self) -> String {
        let list = |items: &[String]| {
            if items.is_empty() {
                "Unknown".to_string()
            } else {
                items.join(", ")
            }
        };
        let span = |s: Option<Span>| match s {
            Some(s) => format!("{}-{}", s.min, s.max),
            None => "Unknown".to_string(),
        };
        let instruments: Vec<String> = self.instruments.iter().map(u8::to_string).collect();

        [
            format!("Tempo: {:.2} BPM", self.tempo_bpm),
            format!("Time Signatures: {}", list(&self.time_signatures)),
            format!("Key Signatures: {}", list(&self.key_signatures)),
            format!("Instruments: {}", list(&instruments)),
            format!("Tracks: {}", self.notes_per_track.len()),
            format!("Note Count: {}", self.total_notes()),
            format!("Average Note Density: {:.2}", self.note_density),
            format!("Pitch Range: {}", span(self.pitch_range)),
            format!("Velocity Range: {}", span(self.velocity_range)),
            format!("Average Note Duration: {:.2}", self.average_duration),
            format!("Total Duration: {:.2} seconds", self.total_duration),
        ]
        .join("\n")
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
