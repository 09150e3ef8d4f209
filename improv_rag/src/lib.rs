// Improv RAG: retrieval-augmented generation around the music core.
//
// Ties `improv_music` to three external collaborators: a feature extractor
// for the input MIDI file, a retrieval index of similar pieces, and a
// completion model. The pipeline builds a prompt from the input's features
// and the retrieved examples, asks the model for a JSON score, and renders
// the completion to MIDI through sanitize → augment → encode.
//
// Architecture:
// - collaborators.rs: FeatureExtractor / RetrievalIndex / CompletionClient
//   traits, ScoreFeatureExtractor, in-memory FeatureIndex
// - prompt.rs: PromptTemplate (constraints + expected JSON shape)
// - pipeline.rs: ImprovPipeline, PipelineConfig, PipelineError, render
//
// The `improv` binary (main.rs) exposes repair/decode/features/prompt as
// subcommands.

pub mod collaborators;
pub mod pipeline;
pub mod prompt;

pub use collaborators::{
    CollaboratorError, CompletionClient, FeatureExtractor, FeatureIndex, RetrievalIndex,
    RetrievedExample, ScoreFeatureExtractor,
};
pub use pipeline::{
    DEFAULT_RETRIEVAL_K, Generation, ImprovPipeline, PipelineConfig, PipelineError, RenderedMidi,
    render,
};
pub use prompt::PromptTemplate;
