// Generation prompt for the completion model.
//
// The prompt shows the input piece's features and those of the retrieved
// reference pieces, then states the constraints the augmenter and encoder
// rely on and the exact JSON shape `improv_music::sanitize` expects back.

use crate::collaborators::RetrievedExample;
use improv_music::config::{
    AugmentConfig, DEFAULT_MIN_NOTES, DEFAULT_PITCH_BOUNDS, DEFAULT_VELOCITY_BOUNDS,
};
use serde::{Deserialize, Serialize};

/// Average note duration the model is asked to aim for, in seconds.
pub const TARGET_AVERAGE_DURATION: f64 = 1.2;

/// Prompt parameters; the defaults match the augmenter's bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    pub min_notes: usize,
    pub pitch_bounds: (u8, u8),
    pub velocity_bounds: (u8, u8),
    pub average_duration: f64,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            min_notes: DEFAULT_MIN_NOTES,
            pitch_bounds: DEFAULT_PITCH_BOUNDS,
            velocity_bounds: DEFAULT_VELOCITY_BOUNDS,
            average_duration: TARGET_AVERAGE_DURATION,
        }
    }
}

impl PromptTemplate {
    /// A template whose bounds agree with an augmenter configuration.
    pub fn for_augment(min_notes: usize, augment: &AugmentConfig) -> Self {
        Self {
            min_notes,
            pitch_bounds: augment.pitch_bounds,
            velocity_bounds: augment.velocity_bounds,
            ..Self::default()
        }
    }

    pub fn render(&self, input_features: &str, similar: &[RetrievedExample]) -> String {
        let (pitch_lo, pitch_hi) = self.pitch_bounds;
        let (vel_lo, vel_hi) = self.velocity_bounds;
        let min_notes = self.min_notes;
        let duration = self.average_duration;
        let input = input_features.trim();
        let similar = if similar.is_empty() {
            "(none)".to_string()
        } else {
            similar
                .iter()
                .enumerate()
                .map(|(i, example)| {
                    format!("[{}] {}\n{}", i + 1, example.id, example.content.trim())
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"Compose a new piece of MIDI music that reflects the features of the input piece below.

Input MIDI features:
{input}

Similar MIDI features:
{similar}

Using these features, produce JSON satisfying:
1. At least {min_notes} notes.
2. Pitch between {pitch_lo} and {pitch_hi}.
3. Average note duration close to {duration:.1} seconds.
4. Each note's time is the previous note's time plus its duration.
5. Varied velocity between {vel_lo} and {vel_hi}.

Respond with JSON in exactly this format:
{{
  "tracks": [
    {{
      "instrument": 0,
      "notes": [
        {{"pitch": <{pitch_lo}-{pitch_hi}>, "time": <cumulative seconds>, "duration": <about {duration:.1} seconds>, "velocity": <{vel_lo}-{vel_hi}>}},
        ... (at least {min_notes} notes)
      ]
    }}
  ],
  "time_signatures": ["4/4"],
  "key_signatures": []
}}

Respond only with the JSON above, with no other explanation or code."#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use improv_music::FeatureMap;

    #[test]
    fn default_prompt_states_constraints() {
        let prompt = PromptTemplate::default().render("Tempo: 90.00 BPM", &[]);
        assert!(prompt.contains("Tempo: 90.00 BPM"));
        assert!(prompt.contains("At least 100 notes."));
        assert!(prompt.contains("Pitch between 33 and 85."));
        assert!(prompt.contains("close to 1.2 seconds"));
        assert!(prompt.contains("Varied velocity between 32 and 127."));
        assert!(prompt.contains("\"time_signatures\": [\"4/4\"]"));
        assert!(prompt.contains("(none)"));
    }

    #[test]
    fn similar_examples_are_listed_in_order() {
        let example = |id: &str, content: &str| RetrievedExample {
            id: id.into(),
            content: content.into(),
            features: FeatureMap::new(),
        };
        let prompt = PromptTemplate::default().render(
            "input",
            &[example("one.mid", "Tempo: 100"), example("two.mid", "Tempo: 140")],
        );
        let first = prompt.find("[1] one.mid").unwrap();
        let second = prompt.find("[2] two.mid").unwrap();
        assert!(first < second);
        assert!(prompt.contains("Tempo: 140"));
        assert!(!prompt.contains("(none)"));
    }

    #[test]
    fn json_skeleton_is_laid_out_line_by_line() {
        let prompt = PromptTemplate::default().render("  Tempo: 90.00 BPM\n", &[]);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[2], "Input MIDI features:");
        assert_eq!(lines[3], "Tempo: 90.00 BPM");
        assert!(lines.contains(&"      \"instrument\": 0,"));
        assert!(lines.contains(&"        ... (at least 100 notes)"));
        assert!(prompt.ends_with("with no other explanation or code."));
    }

    #[test]
    fn bounds_follow_augment_config() {
        let augment = AugmentConfig {
            pitch_bounds: (40, 70),
            ..Default::default()
        };
        let prompt = PromptTemplate::for_augment(12, &augment).render("x", &[]);
        assert!(prompt.contains("At least 12 notes."));
        assert!(prompt.contains("Pitch between 40 and 70."));
        assert!(prompt.contains("<40-70>"));
    }
}
