// Note-count augmentation for short model outputs.
//
// Models routinely stop well short of the note count the prompt asks for.
// Rather than re-prompting, the augmenter extends the score by repeating each
// track's own material:
//
// - The time cursor starts at the track's latest note end (`lastEnd`).
// - The original notes are replayed in their original order, each new note
//   starting exactly where the previous appended note ends, so the seam and
//   every later boundary are gap-free.
// - Each appended note is perturbed with probability
//   `AugmentConfig::perturb_probability`: pitch shifted within
//   ±`pitch_shift` and clamped to `pitch_bounds`, duration scaled by a factor
//   in `duration_scale`, velocity shifted within ±`velocity_shift` and clamped
//   to `velocity_bounds`. Unperturbed copies keep the template's values.
// - Tracks are visited in order and filling stops as soon as the total note
//   count across all tracks reaches the minimum. Empty tracks are skipped.
//
// All randomness comes from the caller's `ImprovRng`, so a fixed seed gives
// identical output.
//
// `augment` works on a validated `Score` and cannot fail. `augment_value`
// works on the raw sanitized JSON: if the structure is malformed it returns
// the input unchanged together with a `MalformedScoreWarning`.

use crate::config::AugmentConfig;
use crate::error::MalformedScoreWarning;
use crate::score::{Note, Score};
use improv_prng::ImprovRng;
use serde_json::Value;
use tracing::{debug, warn};

/// Extend `score` until it holds at least `min_notes` notes.
///
/// Returns an unchanged copy if the minimum is already met or there is no
/// material to repeat.
pub fn augment(
    score: &Score,
    min_notes: usize,
    config: &AugmentConfig,
    rng: &mut ImprovRng,
) -> Score {
    let mut out = score.clone();
    let mut total = out.total_notes();
    if total >= min_notes {
        return out;
    }

    let original_total = total;
    for (ti, track) in out.tracks.iter_mut().enumerate() {
        if total >= min_notes {
            break;
        }
        let Some(mut cursor) = track.last_end() else {
            continue;
        };
        let pattern = track.notes.clone();
        let before = track.notes.len();

        'fill: loop {
            for template in &pattern {
                if total >= min_notes {
                    break 'fill;
                }
                let note = next_note(template, cursor, config, rng);
                cursor = note.end();
                track.notes.push(note);
                total += 1;
            }
        }
        debug!(
            track = ti,
            appended = track.notes.len() - before,
            "extended track by repeating its pattern"
        );
    }

    if total < min_notes {
        debug!(
            total,
            min_notes, "score has no notes to repeat, minimum not reached"
        );
    } else {
        debug!(
            from = original_total,
            to = total,
            "augmented score to meet minimum note count"
        );
    }
    out
}

/// A copy of `template` starting at `onset`, possibly perturbed.
fn next_note(template: &Note, onset: f64, config: &AugmentConfig, rng: &mut ImprovRng) -> Note {
    let mut note = Note { onset, ..*template };
    if !rng.random_bool(config.perturb_probability) {
        return note;
    }

    let pitch_delta = rng.range_i32_inclusive(-config.pitch_shift, config.pitch_shift);
    note.pitch = shift_clamped(note.pitch, pitch_delta, config.pitch_bounds);

    let (lo, hi) = config.duration_scale;
    note.duration *= rng.range_f64(lo, hi);

    let velocity_delta = rng.range_i32_inclusive(-config.velocity_shift, config.velocity_shift);
    note.velocity = shift_clamped(note.velocity, velocity_delta, config.velocity_bounds);

    note
}

fn shift_clamped(value: u8, delta: i32, (lo, hi): (u8, u8)) -> u8 {
    (i32::from(value) + delta).clamp(i32::from(lo), i32::from(hi)) as u8
}

/// Result of augmenting a raw Score-shaped value.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedValue {
    pub value: Value,
    /// Number of notes appended across all tracks.
    pub appended: usize,
    /// Set when the input could not be augmented; `value` is then the input.
    pub warning: Option<MalformedScoreWarning>,
}

/// Augment a sanitized JSON value in place of a typed Score.
///
/// Only the `notes` arrays of tracks are rewritten; any other keys the model
/// produced are preserved. A missing or mistyped `tracks` or `notes`, or a
/// note that fails validation, leaves the input unchanged and yields a
/// warning.
pub fn augment_value(
    value: &Value,
    min_notes: usize,
    config: &AugmentConfig,
    rng: &mut ImprovRng,
) -> AugmentedValue {
    let unchanged = |reason: String| {
        let warning = MalformedScoreWarning { reason };
        warn!(%warning, "returning score unaugmented");
        AugmentedValue {
            value: value.clone(),
            appended: 0,
            warning: Some(warning),
        }
    };

    if let Err(reason) = check_shape(value) {
        return unchanged(reason);
    }
    let score = match Score::from_value(value) {
        Ok(score) => score,
        Err(e) => return unchanged(e.to_string()),
    };

    let augmented = augment(&score, min_notes, config, rng);
    let appended = augmented.total_notes() - score.total_notes();
    let mut out = value.clone();
    if appended > 0 {
        if let Some(tracks) = out.get_mut("tracks").and_then(Value::as_array_mut) {
            let grown = augmented.tracks.iter().zip(&score.tracks);
            for (slot, (track, original)) in tracks.iter_mut().zip(grown) {
                if track.notes.len() == original.notes.len() {
                    continue;
                }
                if let Some(obj) = slot.as_object_mut() {
                    let notes = serde_json::to_value(&track.notes).unwrap_or_default();
                    obj.insert("notes".to_string(), notes);
                }
            }
        }
    }

    AugmentedValue {
        value: out,
        appended,
        warning: None,
    }
}

/// Check that `value` has a `tracks` array whose entries are objects with a
/// `notes` array.
fn check_shape(value: &Value) -> Result<(), String> {
    let tracks = match value.get("tracks") {
        Some(Value::Array(tracks)) => tracks,
        Some(_) => return Err("`tracks` is not an array".into()),
        None => return Err("missing `tracks`".into()),
    };
    for (ti, track) in tracks.iter().enumerate() {
        match track.get("notes") {
            Some(Value::Array(_)) => {}
            Some(_) => return Err(format!("`tracks[{ti}].notes` is not an array")),
            None if track.is_object() => {
                return Err(format!("missing `tracks[{ti}].notes`"));
            }
            None => return Err(format!("`tracks[{ti}]` is not an object")),
        }
    }
    Ok(())
}
