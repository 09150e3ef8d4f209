// Error taxonomy for the repair/encode/decode core.
//
// One enum per component so callers can match on exactly the failures a
// stage can produce:
// - `SanitizeError`: LLM text could not be turned into JSON. Both variants
//   carry the raw response so an orchestration layer can re-prompt.
// - `ExprError`: a single arithmetic expression failed to evaluate. The
//   sanitizer swallows these and leaves the original text in place.
// - `EncodeError`: a Score-shaped value could not be validated or written.
// - `DecodeError`: bytes are not a readable Standard MIDI File.
//
// `MalformedScoreWarning` is not an error: the augmenter returns
// it alongside its unchanged input and the pipeline keeps going.

use thiserror::Error;

/// Failure to extract or parse a JSON payload from model output.
#[derive(Debug, Clone, Error)]
pub enum SanitizeError {
    /// No fenced block and no `{...}` span anywhere in the text.
    #[error("no JSON payload found in model response ({} bytes)", .raw.len())]
    Extraction { raw: String },

    /// A candidate span was found but is not valid JSON even after repair.
    #[error("candidate payload is not valid JSON: {message}")]
    Parse {
        /// The repaired candidate text that failed to parse.
        text: String,
        /// The complete model response the candidate came from.
        raw: String,
        message: String,
    },
}

impl SanitizeError {
    /// The unmodified model response, for re-prompting.
    pub fn raw_response(&self) -> &str {
        match self {
            SanitizeError::Extraction { raw } | SanitizeError::Parse { raw, .. } => raw,
        }
    }
}

/// Failure to evaluate a restricted arithmetic expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("malformed number '{0}'")]
    BadNumber(String),
    #[error("unbalanced parentheses")]
    Unbalanced,
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

/// Failure to validate or serialize a Score.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A field exists but holds something that cannot become a MIDI value.
    #[error("invalid field '{field}' at {location}: {reason}")]
    InvalidField {
        /// Human-readable path such as `tracks[0].notes[3]`.
        location: String,
        field: &'static str,
        reason: String,
    },

    #[error("invalid time signature '{0}'")]
    InvalidTimeSignature(String),

    /// An event lands beyond the 28-bit delta-time range of the SMF format.
    #[error("event at tick {ticks} exceeds the MIDI delta-time range")]
    TimeOutOfRange { ticks: u64 },

    #[error("failed to write MIDI: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to read a Standard MIDI File.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to parse MIDI: {0}")]
    Parse(String),

    #[error("failed to read MIDI file: {0}")]
    Io(#[from] std::io::Error),
}

/// The augmenter was handed a structure it cannot extend.
///
/// Returned next to the unchanged input rather than as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("score is malformed, skipping augmentation: {reason}")]
pub struct MalformedScoreWarning {
    pub reason: String,
}
