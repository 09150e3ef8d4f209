// Improv music core: turns free-form language-model output into MIDI.
//
// The pipeline is sanitize → augment → encode. A model's completion is
// scanned for a JSON score, arithmetic the model left in numeric fields is
// evaluated, short pieces are extended to a minimum note count by repeating
// and lightly perturbing their own material, and the result is written as a
// Standard MIDI File. The decoder reads existing MIDI files back into the
// same Score model so their features can seed retrieval and prompting.
//
// Architecture:
// - score.rs: Score / Track / Note model and lenient JSON validation
// - expr.rs: Restricted arithmetic evaluator (no names, no calls)
// - sanitize.rs: JSON extraction from prose + arithmetic repair
// - augment.rs: Note-count augmentation with bounded perturbation
// - midi.rs: SMF Format 1 encoder, time/key signature helpers
// - decode.rs: SMF decoder with tempo map and FIFO note matching
// - features.rs: Summary statistics and retrieval query text
// - config.rs: Tempo, resolution and augmentation settings
// - error.rs: Error types for every stage
//
// Augmentation is deterministic given the caller's `ImprovRng` seed.

pub mod augment;
pub mod config;
pub mod decode;
pub mod error;
pub mod expr;
pub mod features;
pub mod midi;
pub mod sanitize;
pub mod score;

pub use augment::{AugmentedValue, augment, augment_value};
pub use config::{AugmentConfig, ConfigError, ImprovConfig, MidiConfig};
pub use decode::{DecodedMidi, decode, decode_detailed, read_midi, read_midi_detailed};
pub use error::{DecodeError, EncodeError, ExprError, MalformedScoreWarning, SanitizeError};
pub use features::{FeatureMap, FeatureSummary, summarize};
pub use midi::{encode, encode_to, write_midi};
pub use sanitize::sanitize;
pub use score::{Note, Score, Track};
