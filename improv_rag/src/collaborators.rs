// External collaborators of the generation pipeline.
//
// Feature extraction, similarity retrieval and text completion are traits so
// that the pipeline can run against a real model server, a vector store, or
// in-memory fakes in tests. Each returns `CollaboratorError`, a boxed error,
// since implementations wrap unrelated client libraries.
//
// Two implementations ship here: `ScoreFeatureExtractor` (MIDI decoder +
// feature summary) and `FeatureIndex`, an in-memory nearest-neighbour index
// over feature summaries of a MIDI corpus.

use improv_music::{FeatureMap, FeatureSummary, read_midi_detailed, summarize};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Error returned by any collaborator implementation.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Produces a feature map for a MIDI file.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<FeatureMap, CollaboratorError>;

    /// The text form of `features` used as the retrieval query.
    fn query_text(&self, features: &FeatureMap) -> String {
        features_to_text(features)
    }
}

/// A retrieved reference piece.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedExample {
    pub id: String,
    /// Text embedded in the prompt for this example.
    pub content: String,
    pub features: FeatureMap,
}

/// Finds stored pieces similar to a query.
pub trait RetrievalIndex: Send + Sync {
    fn similar(&self, query: &str, k: usize) -> Result<Vec<RetrievedExample>, CollaboratorError>;
}

/// Turns a prompt into a model completion.
pub trait CompletionClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, CollaboratorError>;
}

/// Render a feature map as `key: value` lines in key order.
pub fn features_to_text(features: &FeatureMap) -> String {
    features
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{key}: {s}"),
            other => format!("{key}: {other}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decodes the file and summarizes it with `improv_music::summarize`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScoreFeatureExtractor;

impl ScoreFeatureExtractor {
    pub fn summary(&self, path: &Path) -> Result<FeatureSummary, CollaboratorError> {
        let decoded = read_midi_detailed(path)?;
        Ok(summarize(&decoded.score).with_tempo_us(decoded.tempo_us))
    }
}

impl FeatureExtractor for ScoreFeatureExtractor {
    fn extract(&self, path: &Path) -> Result<FeatureMap, CollaboratorError> {
        let summary = self.summary(path)?;
        let mut map = summary.to_feature_map();
        map.insert(
            "query_text".into(),
            serde_json::Value::String(summary.to_query_text()),
        );
        Ok(map)
    }

    fn query_text(&self, features: &FeatureMap) -> String {
        match features.get("query_text") {
            Some(serde_json::Value::String(text)) => text.clone(),
            _ => features_to_text(features),
        }
    }
}

/// One stored piece in a `FeatureIndex`.
#[derive(Clone, Debug, PartialEq)]
struct IndexEntry {
    id: String,
    summary: FeatureSummary,
}

/// In-memory index ranking pieces by distance between feature summaries.
///
/// Queries are the text produced by `FeatureSummary::to_query_text`; the
/// numeric lines are parsed back out and compared on tempo, note density,
/// pitch range, velocity range and average duration, each normalised by a
/// typical spread so no single feature dominates.
#[derive(Clone, Debug, Default)]
pub struct FeatureIndex {
    entries: Vec<IndexEntry>,
}

impl FeatureIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, summary: FeatureSummary) {
        self.entries.push(IndexEntry {
            id: id.into(),
            summary,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index every `.mid`/`.midi` file directly inside `dir`. Files that
    /// fail to decode are skipped with a warning.
    pub fn from_dir(dir: &Path) -> Result<Self, CollaboratorError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("mid") || e.eq_ignore_ascii_case("midi"))
            })
            .collect();
        paths.sort();

        let extractor = ScoreFeatureExtractor;
        let mut index = Self::new();
        for path in paths {
            match extractor.summary(&path) {
                Ok(summary) => index.insert(path.display().to_string(), summary),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable MIDI file"),
            }
        }
        debug!(dir = %dir.display(), entries = index.len(), "built feature index");
        Ok(index)
    }
}

impl RetrievalIndex for FeatureIndex {
    fn similar(&self, query: &str, k: usize) -> Result<Vec<RetrievedExample>, CollaboratorError> {
        let probe = QueryPoint::parse(query);
        let mut ranked: Vec<(f64, &IndexEntry)> = self
            .entries
            .iter()
            .map(|e| (probe.distance(&QueryPoint::from_summary(&e.summary)), e))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(_, e)| RetrievedExample {
                id: e.id.clone(),
                content: e.summary.to_query_text(),
                features: e.summary.to_feature_map(),
            })
            .collect())
    }
}

/// Numeric coordinates compared by `FeatureIndex`. Missing values are
/// ignored in the distance.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct QueryPoint {
    tempo: Option<f64>,
    density: Option<f64>,
    pitch: Option<(f64, f64)>,
    velocity: Option<(f64, f64)>,
    duration: Option<f64>,
}

impl QueryPoint {
    fn from_summary(s: &FeatureSummary) -> Self {
        let span = |r: Option<improv_music::features::Span>| {
            r.map(|r| (f64::from(r.min), f64::from(r.max)))
        };
        QueryPoint {
            tempo: Some(s.tempo_bpm),
            density: Some(s.note_density),
            pitch: span(s.pitch_range),
            velocity: span(s.velocity_range),
            duration: Some(s.average_duration),
        }
    }

    fn parse(text: &str) -> Self {
        let mut point = QueryPoint::default();
        for line in text.lines() {
            let Some((label, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let first_number = || {
                value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<f64>().ok())
            };
            let range = || {
                let (lo, hi) = value.split_once('-')?;
                Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
            };
            match label.trim() {
                "Tempo" => point.tempo = first_number(),
                "Average Note Density" => point.density = first_number(),
                "Pitch Range" => point.pitch = range(),
                "Velocity Range" => point.velocity = range(),
                "Average Note Duration" => point.duration = first_number(),
                _ => {}
            }
        }
        point
    }

    fn distance(&self, other: &QueryPoint) -> f64 {
        fn term(a: Option<f64>, b: Option<f64>, scale: f64) -> f64 {
            match (a, b) {
                (Some(a), Some(b)) => ((a - b) / scale).powi(2),
                _ => 0.0,
            }
        }
        fn pair(a: Option<(f64, f64)>, b: Option<(f64, f64)>, scale: f64) -> f64 {
            match (a, b) {
                (Some(a), Some(b)) => ((a.0 - b.0) / scale).powi(2) + ((a.1 - b.1) / scale).powi(2),
                _ => 0.0,
            }
        }
        (term(self.tempo, other.tempo, 20.0)
            + term(self.density, other.density, 2.0)
            + pair(self.pitch, other.pitch, 12.0)
            + pair(self.velocity, other.velocity, 20.0)
            + term(self.duration, other.duration, 0.5))
        .sqrt()
    }
}
