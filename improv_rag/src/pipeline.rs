// Retrieval-augmented generation of MIDI improvisations.
//
// `ImprovPipeline::generate` runs one input file through:
//   1. feature extraction (FeatureExtractor)
//   2. query text formatting
//   3. top-k retrieval of similar pieces (RetrievalIndex)
//   4. prompt rendering (PromptTemplate)
//   5. completion (CompletionClient)
//   6. `render_response`: sanitize → augment → validate → encode
//
// Every step runs once; nothing retries. Sanitizer errors carry the raw
// completion so callers can log or store it. The augmenter is seeded from
// `PipelineConfig::seed` when set, so a fixed seed and a fixed completion
// always produce the same MIDI bytes.

use crate::collaborators::{
    CollaboratorError, CompletionClient, FeatureExtractor, RetrievalIndex, RetrievedExample,
};
use crate::prompt::PromptTemplate;
use improv_music::{
    ConfigError, EncodeError, ImprovConfig, MalformedScoreWarning, SanitizeError, Score,
    augment_value, encode, sanitize,
};
use improv_prng::ImprovRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of similar pieces retrieved per generation by default.
pub const DEFAULT_RETRIEVAL_K: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retrieval_k: usize,
    /// Augmenter seed. `None` seeds from the clock.
    pub seed: Option<u64>,
    #[serde(flatten)]
    pub music: ImprovConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retrieval_k: DEFAULT_RETRIEVAL_K,
            seed: None,
            music: ImprovConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_json::from_str(json).map_err(ConfigError::from)?;
        config.music.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path).map_err(ConfigError::from)?;
        Self::from_json(&json)
    }

    /// RNG for the `index`-th response rendered under this config.
    fn rng(&self, index: u64) -> ImprovRng {
        match self.seed {
            Some(seed) => ImprovRng::new(seed.wrapping_add(index)),
            None => ImprovRng::from_time(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("{stage} failed: {source}")]
    Collaborator {
        stage: &'static str,
        #[source]
        source: CollaboratorError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// The raw model completion, when the failure happened while parsing it.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            PipelineError::Sanitize(e) => Some(e.raw_response()),
            _ => None,
        }
    }
}

/// A completion rendered to MIDI.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedMidi {
    pub score: Score,
    pub midi: Vec<u8>,
    /// Notes added by the augmenter.
    pub appended: usize,
    /// Set when augmentation was skipped on a malformed structure.
    pub warning: Option<MalformedScoreWarning>,
}

impl RenderedMidi {
    /// Write the already-encoded bytes to `path`.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, &self.midi)?;
        debug!(path = %path.display(), bytes = self.midi.len(), "wrote MIDI file");
        Ok(())
    }
}

/// Everything produced by one `generate` call.
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
    pub query: String,
    pub similar: Vec<RetrievedExample>,
    pub prompt: String,
    pub response: String,
    pub rendered: RenderedMidi,
}

/// Sanitize, augment, validate and encode one completion.
pub fn render(
    text: &str,
    config: &ImprovConfig,
    rng: &mut ImprovRng,
) -> Result<RenderedMidi, PipelineError> {
    let value = sanitize(text)?;
    let augmented = augment_value(&value, config.min_notes, &config.augment, rng);
    let score = Score::from_value(&augmented.value)?;
    let midi = encode(&score, &config.midi)?;
    debug!(
        notes = score.total_notes(),
        appended = augmented.appended,
        bytes = midi.len(),
        "rendered response"
    );
    Ok(RenderedMidi {
        score,
        midi,
        appended: augmented.appended,
        warning: augmented.warning,
    })
}

pub struct ImprovPipeline<E, R, C> {
    extractor: E,
    index: R,
    client: C,
    template: PromptTemplate,
    config: PipelineConfig,
}

impl<E, R, C> ImprovPipeline<E, R, C>
where
    E: FeatureExtractor,
    R: RetrievalIndex,
    C: CompletionClient,
{
    pub fn new(extractor: E, index: R, client: C, config: PipelineConfig) -> Self {
        let template = PromptTemplate::for_augment(config.music.min_notes, &config.music.augment);
        Self {
            extractor,
            index,
            client,
            template,
            config,
        }
    }

    /// Generate a new piece in the style of the MIDI file at `input`.
    pub fn generate(&self, input: &Path) -> Result<Generation, PipelineError> {
        info!(input = %input.display(), "generating improvisation");

        let features = self
            .extractor
            .extract(input)
            .map_err(|source| PipelineError::Collaborator {
                stage: "feature extraction",
                source,
            })?;
        let query = self.extractor.query_text(&features);

        let similar = self
            .index
            .similar(&query, self.config.retrieval_k)
            .map_err(|source| PipelineError::Collaborator {
                stage: "retrieval",
                source,
            })?;
        debug!(hits = similar.len(), k = self.config.retrieval_k, "retrieved similar pieces");

        let prompt = self.template.render(&query, &similar);
        let response = self
            .client
            .complete(&prompt)
            .map_err(|source| PipelineError::Collaborator {
                stage: "completion",
                source,
            })?;
        debug!(chars = response.len(), "received completion");

        let rendered = self.render_response(&response)?;
        info!(
            notes = rendered.score.total_notes(),
            appended = rendered.appended,
            "generation complete"
        );
        Ok(Generation {
            query,
            similar,
            prompt,
            response,
            rendered,
        })
    }

    /// Render one completion with the pipeline's config and seed.
    pub fn render_response(&self, text: &str) -> Result<RenderedMidi, PipelineError> {
        render(text, &self.config.music, &mut self.config.rng(0))
    }

    /// Render several completions independently. The `i`-th response is
    /// seeded with `seed + i`, and one failure leaves the rest unaffected.
    pub fn render_batch<S: AsRef<str>>(
        &self,
        responses: &[S],
    ) -> Vec<Result<RenderedMidi, PipelineError>> {
        responses
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let result = render(text.as_ref(), &self.config.music, &mut self.config.rng(i as u64));
                if let Err(e) = &result {
                    warn!(index = i, error = %e, "response failed to render");
                }
                result
            })
            .collect()
    }
}
