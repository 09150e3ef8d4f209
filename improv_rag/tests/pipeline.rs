// End-to-end pipeline test with in-memory collaborators.
//
// The extractor, index and model are fakes that record what they were asked,
// so the test can check the data flowing between stages as well as the final
// MIDI. No network or model is involved.

use std::path::Path;
use std::sync::Mutex;

use improv_music::{FeatureMap, MidiConfig, Note, Score, Track, decode, write_midi};
use improv_rag::{
    CollaboratorError, CompletionClient, FeatureExtractor, FeatureIndex, ImprovPipeline,
    PipelineConfig, PipelineError, RetrievalIndex, RetrievedExample, ScoreFeatureExtractor,
};
use serde_json::json;

const RESPONSE: &str = r#"Sure! Here's a melody.

```json
{
  "tracks": [{"instrument": 0, "notes": [
    {"pitch": 60, "time": 0, "duration": 1.2, "velocity": 70},
    {"pitch": 64, "time": 1.2, "duration": 1.2, "velocity": 80},
    {"pitch": 67, "time": 1.2 + 1.2, "duration": 1.2, "velocity": 90}
  ]}],
  "time_signatures": ["4/4"],
  "key_signatures": ["C"]
}
```"#;

struct FixedExtractor;

impl FeatureExtractor for FixedExtractor {
    fn extract(&self, path: &Path) -> Result<FeatureMap, CollaboratorError> {
        let mut map = FeatureMap::new();
        map.insert("file".into(), json!(path.display().to_string()));
        map.insert("tempo_bpm".into(), json!(96));
        Ok(map)
    }
}

#[derive(Default)]
struct RecordingIndex {
    queries: Mutex<Vec<(String, usize)>>,
}

impl RetrievalIndex for RecordingIndex {
    fn similar(&self, query: &str, k: usize) -> Result<Vec<RetrievedExample>, CollaboratorError> {
        self.queries.lock().unwrap().push((query.to_string(), k));
        Ok((0..k)
            .map(|i| RetrievedExample {
                id: format!("ref{i}.mid"),
                content: format!("Tempo: {} BPM", 90 + i),
                features: FeatureMap::new(),
            })
            .collect())
    }
}

struct CannedModel {
    response: Result<String, String>,
    prompts: Mutex<Vec<String>>,
}

impl CannedModel {
    fn answering(text: &str) -> Self {
        CannedModel {
            response: Ok(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl CompletionClient for CannedModel {
    fn complete(&self, prompt: &str) -> Result<String, CollaboratorError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.response.clone().map_err(Into::into)
    }
}

fn seeded(min_notes: usize) -> PipelineConfig {
    let mut config = PipelineConfig {
        seed: Some(2024),
        ..Default::default()
    };
    config.music.min_notes = min_notes;
    config
}

#[test]
fn generate_runs_every_stage() {
    let pipeline = ImprovPipeline::new(
        FixedExtractor,
        RecordingIndex::default(),
        CannedModel::answering(RESPONSE),
        seeded(12),
    );
    let generation = pipeline.generate(Path::new("input.mid")).unwrap();

    assert_eq!(generation.query, "file: input.mid\ntempo_bpm: 96");
    assert_eq!(generation.similar.len(), 3);
    assert!(generation.prompt.contains("tempo_bpm: 96"));
    assert!(generation.prompt.contains("[3] ref2.mid"));
    assert!(generation.prompt.contains("At least 12 notes."));
    assert_eq!(generation.response, RESPONSE);

    let rendered = &generation.rendered;
    assert_eq!(rendered.score.total_notes(), 12);
    assert_eq!(rendered.appended, 9);
    assert!(rendered.warning.is_none());
    assert_eq!(rendered.score.key_signature(), Some("C"));

    // The repaired third onset and the seam both survive encoding.
    let notes = &rendered.score.tracks[0].notes;
    assert!((notes[2].onset - 2.4).abs() < 1e-9);
    assert!((notes[3].onset - 3.6).abs() < 1e-9);
    let decoded = decode(&rendered.midi).unwrap();
    assert_eq!(decoded.total_notes(), 12);
    assert_eq!(decoded.key_signatures, vec!["C".to_string()]);
}

#[test]
fn fixed_seed_is_reproducible() {
    let make = || {
        ImprovPipeline::new(
            FixedExtractor,
            RecordingIndex::default(),
            CannedModel::answering(RESPONSE),
            seeded(40),
        )
    };
    let a = make().render_response(RESPONSE).unwrap();
    let b = make().render_response(RESPONSE).unwrap();
    assert_eq!(a.midi, b.midi);
    assert_eq!(a.score, b.score);
}

#[test]
fn retrieval_k_comes_from_config() {
    let index = RecordingIndex::default();
    let mut config = seeded(3);
    config.retrieval_k = 5;
    let pipeline = ImprovPipeline::new(
        FixedExtractor,
        index,
        CannedModel::answering(RESPONSE),
        config,
    );
    let generation = pipeline.generate(Path::new("x.mid")).unwrap();
    assert_eq!(generation.similar.len(), 5);
}

#[test]
fn model_failure_is_a_collaborator_error() {
    let model = CannedModel {
        response: Err("connection refused".into()),
        prompts: Mutex::new(Vec::new()),
    };
    let pipeline = ImprovPipeline::new(
        FixedExtractor,
        RecordingIndex::default(),
        model,
        seeded(3),
    );
    match pipeline.generate(Path::new("x.mid")) {
        Err(PipelineError::Collaborator { stage, source }) => {
            assert_eq!(stage, "completion");
            assert_eq!(source.to_string(), "connection refused");
        }
        other => panic!("expected a collaborator error, got {other:?}"),
    }
}

#[test]
fn unparseable_completion_carries_raw_text() {
    let pipeline = ImprovPipeline::new(
        FixedExtractor,
        RecordingIndex::default(),
        CannedModel::answering("Sorry, I can only describe music in words."),
        seeded(3),
    );
    let err = pipeline.generate(Path::new("x.mid")).unwrap_err();
    assert_eq!(
        err.raw_response(),
        Some("Sorry, I can only describe music in words.")
    );
}

#[test]
fn batch_failures_are_isolated() {
    let pipeline = ImprovPipeline::new(
        FixedExtractor,
        RecordingIndex::default(),
        CannedModel::answering(RESPONSE),
        seeded(6),
    );
    let results = pipeline.render_batch(&[RESPONSE, "no json here", RESPONSE]);
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(PipelineError::Sanitize(_))));
    let third = results[2].as_ref().unwrap();
    assert_eq!(third.score.total_notes(), 6);
}

#[test]
fn real_extractor_and_index_over_a_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("corpus");
    std::fs::create_dir(&corpus).unwrap();

    let piece = |base: u8, duration: f64| Score {
        tracks: vec![Track::new(
            0,
            (0..6)
                .map(|i| Note::new(base + i, f64::from(i) * duration, duration, 80))
                .collect(),
        )],
        time_signatures: vec!["4/4".into()],
        key_signatures: vec![],
    };
    let config = MidiConfig::default();
    write_midi(&piece(40, 1.0), &config, &corpus.join("low.mid")).unwrap();
    write_midi(&piece(70, 0.25), &config, &corpus.join("high.mid")).unwrap();
    let input = dir.path().join("input.mid");
    write_midi(&piece(68, 0.25), &config, &input).unwrap();

    let index = FeatureIndex::from_dir(&corpus).unwrap();
    let pipeline = ImprovPipeline::new(
        ScoreFeatureExtractor,
        index,
        CannedModel::answering(RESPONSE),
        PipelineConfig {
            retrieval_k: 1,
            ..seeded(3)
        },
    );
    let generation = pipeline.generate(&input).unwrap();
    assert!(generation.query.starts_with("Tempo: 120.00 BPM"));
    assert_eq!(generation.similar.len(), 1);
    assert!(generation.similar[0].id.ends_with("high.mid"));
    assert!(generation.prompt.contains("Pitch Range: 68-73"));
}
