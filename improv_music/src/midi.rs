// MIDI output from validated scores.
//
// Converts a Score into a Standard MIDI File (SMF Format 1) using `midly`:
// track 0 carries tempo, time signature and (optionally) key signature; each
// Score track becomes one further MIDI track with its program change and
// notes. Times in seconds map to ticks with `MidiConfig::seconds_to_ticks`
// (960 ticks per second at the default 120 BPM / 480 TPQ).
//
// Note timing is cursor-based. Notes are stably sorted by onset; for each
// note the note-on delta is the distance from `last_event_tick` (clamped at
// zero), the note-off delta is the note's length in ticks, and the cursor
// then moves to `onset + length`. The length runs from the rounded onset to
// the rounded end (at least one tick), so back-to-back notes share a tick
// boundary and rounding never accumulates. When notes overlap in time the
// note-on is emitted at the cursor instead of at its onset, so later events
// drift late relative to their nominal position. Non-overlapping input stays
// within rounding of its nominal ticks.
//
// All events go out on channel 0. Note-on velocity is at least 1, since a
// velocity-0 note-on reads back as a note-off.

use crate::config::MidiConfig;
use crate::error::EncodeError;
use crate::score::{Note, Score, Track as ScoreTrack};
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Largest delta-time representable in an SMF variable-length quantity.
const MAX_DELTA_TICKS: u64 = (1 << 28) - 1;

/// MIDI clocks per metronome click written into the time signature.
const CLOCKS_PER_CLICK: u8 = 24;

/// Notated 32nd notes per MIDI quarter note.
const THIRTY_SECONDS_PER_QUARTER: u8 = 8;

/// Major keys indexed by `sharps + 7` (negative = flats).
const MAJOR_KEYS: [&str; 15] = [
    "Cb", "Gb", "Db", "Ab", "Eb", "Bb", "F", "C", "G", "D", "A", "E", "B", "F#", "C#",
];

/// Minor keys indexed by `sharps + 7`.
const MINOR_KEYS: [&str; 15] = [
    "Abm", "Ebm", "Bbm", "Fm", "Cm", "Gm", "Dm", "Am", "Em", "Bm", "F#m", "C#m", "G#m", "D#m",
    "A#m",
];

/// Encode a Score into SMF bytes.
pub fn encode(score: &Score, config: &MidiConfig) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    encode_to(score, config, &mut buf)?;
    Ok(buf)
}

/// Encode a Score and write it to any byte sink.
pub fn encode_to<W: io::Write>(
    score: &Score,
    config: &MidiConfig,
    writer: W,
) -> Result<(), EncodeError> {
    let smf = score_to_smf(score, config)?;
    smf.write_std(writer)?;
    Ok(())
}

/// Encode a Score and write it to a file.
pub fn write_midi(score: &Score, config: &MidiConfig, path: &Path) -> Result<(), EncodeError> {
    let buf = encode(score, config)?;
    std::fs::write(path, &buf)?;
    debug!(path = %path.display(), bytes = buf.len(), "wrote MIDI file");
    Ok(())
}

/// Convert a Score to an in-memory SMF borrowing the Score's track names.
fn score_to_smf<'a>(score: &'a Score, config: &MidiConfig) -> Result<Smf<'a>, EncodeError> {
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(config.ticks_per_quarter)),
    ));

    smf.tracks.push(conductor_track(score, config)?);
    for track in &score.tracks {
        smf.tracks.push(note_track(track, config)?);
    }
    Ok(smf)
}

/// Track 0: tempo, time signature, optional key signature.
fn conductor_track(score: &Score, config: &MidiConfig) -> Result<Track<'static>, EncodeError> {
    let mut track: Track<'static> = Vec::new();

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(config.tempo_us))),
    });

    let (numerator, denominator_power) = parse_time_signature(score.time_signature())?;
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::TimeSignature(
            numerator,
            denominator_power,
            CLOCKS_PER_CLICK,
            THIRTY_SECONDS_PER_QUARTER,
        )),
    });

    if let Some(name) = score.key_signature() {
        match key_signature_from_name(name) {
            Some((sharps, minor)) => track.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::KeySignature(sharps, minor)),
            }),
            None => warn!(key = name, "unrecognised key signature, omitting it"),
        }
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    Ok(track)
}

/// One Score track: optional name, program change, then the notes.
fn note_track<'a>(source: &'a ScoreTrack, config: &MidiConfig) -> Result<Track<'a>, EncodeError> {
    let channel = u4::new(0);
    let mut track: Track<'a> = Vec::with_capacity(source.notes.len() * 2 + 3);

    if let Some(name) = &source.name {
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(name.as_bytes())),
        });
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Midi {
            channel,
            message: MidiMessage::ProgramChange {
                program: u7::new(source.program.min(127)),
            },
        },
    });

    // Stable sort: notes sharing an onset keep their original order.
    let mut notes: Vec<&Note> = source.notes.iter().collect();
    notes.sort_by(|a, b| a.onset.total_cmp(&b.onset));

    let mut last_event_tick: u64 = 0;
    for note in notes {
        let onset_ticks = config.seconds_to_ticks(note.onset);
        let duration_ticks = config
            .seconds_to_ticks(note.end())
            .saturating_sub(onset_ticks)
            .max(1);
        let key = u7::new(note.pitch.min(127));

        track.push(TrackEvent {
            delta: delta(onset_ticks.saturating_sub(last_event_tick))?,
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn {
                    key,
                    vel: u7::new(note.velocity.clamp(1, 127)),
                },
            },
        });
        track.push(TrackEvent {
            delta: delta(duration_ticks)?,
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOff {
                    key,
                    vel: u7::new(0),
                },
            },
        });

        last_event_tick = onset_ticks + duration_ticks;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    Ok(track)
}

fn delta(ticks: u64) -> Result<u28, EncodeError> {
    if ticks > MAX_DELTA_TICKS {
        return Err(EncodeError::TimeOutOfRange { ticks });
    }
    Ok(u28::new(ticks as u32))
}

/// Parse `"N/D"` into the SMF `(numerator, log2(denominator))` pair.
///
/// The denominator must be a power of two.
pub fn parse_time_signature(text: &str) -> Result<(u8, u8), EncodeError> {
    let invalid = || EncodeError::InvalidTimeSignature(text.to_string());
    let (num, den) = text.split_once('/').ok_or_else(invalid)?;
    let numerator: u8 = num.trim().parse().map_err(|_| invalid())?;
    let denominator: u8 = den.trim().parse().map_err(|_| invalid())?;
    if numerator == 0 || denominator == 0 || !denominator.is_power_of_two() {
        return Err(invalid());
    }
    Ok((numerator, denominator.trailing_zeros() as u8))
}

/// Map a key name (`"Bb"`, `"F#m"`, `"A minor"`, `"C major"`) to SMF
/// `(sharps, minor)`. Negative `sharps` counts flats.
pub fn key_signature_from_name(name: &str) -> Option<(i8, bool)> {
    let name = name.trim();
    let lower = name.to_ascii_lowercase();
    let (tonic, minor) = if let Some(t) = strip_suffix_ci(name, &lower, &[" minor", " min"]) {
        (t, true)
    } else if let Some(t) = strip_suffix_ci(name, &lower, &[" major", " maj"]) {
        (t, false)
    } else if let Some(t) = name.strip_suffix('m') {
        (t, true)
    } else {
        (name, false)
    };
    let tonic = tonic.trim().replace('♯', "#").replace('♭', "b");
    let mut chars = tonic.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let tonic = format!("{letter}{}", chars.as_str());

    let table = if minor { &MINOR_KEYS } else { &MAJOR_KEYS };
    let wanted = if minor { format!("{tonic}m") } else { tonic };
    table
        .iter()
        .position(|k| *k == wanted)
        .map(|i| (i as i8 - 7, minor))
}

/// The canonical name for an SMF key signature, e.g. `(-2, false)` → `"Bb"`.
pub fn key_signature_name(sharps: i8, minor: bool) -> Option<&'static str> {
    let index = usize::try_from(i16::from(sharps) + 7).ok()?;
    let table = if minor { &MINOR_KEYS } else { &MAJOR_KEYS };
    table.get(index).copied()
}

/// Strip the first matching case-insensitive suffix. `lower` is `name`
/// lowercased (ASCII), so byte offsets agree.
fn strip_suffix_ci<'a>(name: &'a str, lower: &str, suffixes: &[&str]) -> Option<&'a str> {
    suffixes
        .iter()
        .find(|s| lower.ends_with(*s))
        .map(|s| &name[..name.len() - s.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_track(notes: Vec<Note>) -> Score {
        Score {
            tracks: vec![ScoreTrack::new(0, notes)],
            time_signatures: vec!["4/4".into()],
            key_signatures: vec![],
        }
    }

    fn note_events(track: &Track<'_>) -> Vec<(u32, &'static str, u8, u8)> {
        track
            .iter()
            .filter_map(|e| match e.kind {
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOn { key, vel },
                    ..
                } => Some((e.delta.as_int(), "on", key.as_int(), vel.as_int())),
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOff { key, vel },
                    ..
                } => Some((e.delta.as_int(), "off", key.as_int(), vel.as_int())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn header_is_format_1_with_conductor_track() {
        let score = one_track(vec![Note::new(60, 0.0, 1.0, 64)]);
        let bytes = encode(&score, &MidiConfig::default()).unwrap();
        assert_eq!(&bytes[0..4], b"MThd");
        // Format 1
        assert_eq!(&bytes[8..10], &[0x00, 0x01]);
        // 2 tracks: conductor + one part
        assert_eq!(&bytes[10..12], &[0x00, 0x02]);
        // 480 ticks per quarter
        assert_eq!(&bytes[12..14], &480u16.to_be_bytes());
    }

    #[test]
    fn conductor_track_meta_events() {
        let mut score = one_track(vec![]);
        score.time_signatures = vec!["6/8".into(), "4/4".into()];
        score.key_signatures = vec!["Bb".into()];
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        let kinds: Vec<_> = smf.tracks[0].iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TrackEventKind::Meta(MetaMessage::Tempo(u24::new(500_000))),
                TrackEventKind::Meta(MetaMessage::TimeSignature(6, 3, 24, 8)),
                TrackEventKind::Meta(MetaMessage::KeySignature(-2, false)),
                TrackEventKind::Meta(MetaMessage::EndOfTrack),
            ]
        );
    }

    #[test]
    fn missing_time_signature_defaults_to_4_4() {
        let mut score = one_track(vec![]);
        score.time_signatures.clear();
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        assert_eq!(
            smf.tracks[0][1].kind,
            TrackEventKind::Meta(MetaMessage::TimeSignature(4, 2, 24, 8))
        );
    }

    #[test]
    fn unknown_key_is_omitted() {
        let mut score = one_track(vec![]);
        score.key_signatures = vec!["H major".into()];
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        assert_eq!(smf.tracks[0].len(), 3);
    }

    #[test]
    fn program_change_then_sequential_notes() {
        let mut score = one_track(vec![
            Note::new(64, 1.0, 0.5, 80),
            Note::new(60, 0.0, 0.5, 64),
        ]);
        score.tracks[0].program = 40;
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        let track = &smf.tracks[1];
        assert_eq!(
            track[0].kind,
            TrackEventKind::Midi {
                channel: u4::new(0),
                message: MidiMessage::ProgramChange {
                    program: u7::new(40)
                },
            }
        );
        // Sorted by onset; gap of 0.5 s (480 ticks) before the second note.
        assert_eq!(
            note_events(track),
            vec![
                (0, "on", 60, 64),
                (480, "off", 60, 0),
                (480, "on", 64, 80),
                (480, "off", 64, 0),
            ]
        );
    }

    #[test]
    fn overlapping_onset_clamps_delta_to_zero() {
        let score = one_track(vec![
            Note::new(60, 0.0, 1.0, 64),
            Note::new(67, 0.5, 1.0, 64),
        ]);
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        assert_eq!(
            note_events(&smf.tracks[1]),
            vec![
                (0, "on", 60, 64),
                (960, "off", 60, 0),
                (0, "on", 67, 64),
                (960, "off", 67, 0),
            ]
        );
    }

    #[test]
    fn back_to_back_notes_land_on_their_rounded_onsets() {
        // Lengths of 1.6 ticks and so on: rounding onset and length
        // separately would gain a tick on many of these notes.
        let lengths = [0.001_666, 0.312_71, 0.299_63, 0.187_3, 0.250_52];
        let mut notes = Vec::new();
        let mut onset = 0.0;
        for i in 0..60 {
            let duration = lengths[i % lengths.len()];
            notes.push(Note::new(60 + (i % 12) as u8, onset, duration, 64));
            onset += duration;
        }
        let config = MidiConfig::default();
        let score = one_track(notes.clone());
        let smf = score_to_smf(&score, &config).unwrap();
        let mut tick = 0u64;
        let mut onsets = Vec::new();
        for (delta, kind, _, _) in note_events(&smf.tracks[1]) {
            tick += u64::from(delta);
            if kind == "on" {
                onsets.push(tick);
            }
        }
        let expected: Vec<u64> = notes.iter().map(|n| config.seconds_to_ticks(n.onset)).collect();
        assert_eq!(onsets, expected);
    }

    #[test]
    fn silent_note_is_written_with_velocity_one() {
        let score = one_track(vec![Note::new(60, 0.0, 1.0, 0), Note::new(62, 1.0, 1.0, 64)]);
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        let events = note_events(&smf.tracks[1]);
        assert_eq!(events[0], (0, "on", 60, 1));
        assert_eq!(events[2], (0, "on", 62, 64));
    }

    #[test]
    fn sub_tick_note_lasts_one_tick() {
        let score = one_track(vec![Note::new(60, 0.0, 0.0004, 64)]);
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        assert_eq!(
            note_events(&smf.tracks[1]),
            vec![(0, "on", 60, 64), (1, "off", 60, 0)]
        );
    }

    #[test]
    fn equal_onsets_keep_input_order() {
        let score = one_track(vec![
            Note::new(67, 0.0, 1.0, 64),
            Note::new(60, 0.0, 1.0, 64),
        ]);
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        let keys: Vec<u8> = note_events(&smf.tracks[1])
            .into_iter()
            .filter(|e| e.1 == "on")
            .map(|e| e.2)
            .collect();
        assert_eq!(keys, vec![67, 60]);
    }

    #[test]
    fn named_track_emits_track_name() {
        let mut score = one_track(vec![]);
        score.tracks[0].name = Some("Lead".into());
        let smf = score_to_smf(&score, &MidiConfig::default()).unwrap();
        assert_eq!(
            smf.tracks[1][0].kind,
            TrackEventKind::Meta(MetaMessage::TrackName(b"Lead"))
        );
    }

    #[test]
    fn output_parses_back_with_midly() {
        let score = one_track(vec![Note::new(60, 0.0, 1.0, 64)]);
        let bytes = encode(&score, &MidiConfig::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 2);
        assert_eq!(smf.header.timing, Timing::Metrical(u15::new(480)));
    }

    #[test]
    fn far_future_note_is_out_of_range() {
        // 2^28 ticks at 960 ticks/s is roughly 280,000 seconds.
        let score = one_track(vec![Note::new(60, 300_000.0, 1.0, 64)]);
        assert!(matches!(
            encode(&score, &MidiConfig::default()),
            Err(EncodeError::TimeOutOfRange { .. })
        ));
    }

    #[test]
    fn invalid_time_signature_is_an_error() {
        for bad in ["4", "4/3", "0/4", "x/4", "4/0", ""] {
            let mut score = one_track(vec![]);
            score.time_signatures = vec![bad.into()];
            assert!(
                matches!(
                    encode(&score, &MidiConfig::default()),
                    Err(EncodeError::InvalidTimeSignature(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn time_signature_parsing() {
        assert_eq!(parse_time_signature("4/4").unwrap(), (4, 2));
        assert_eq!(parse_time_signature("3/4").unwrap(), (3, 2));
        assert_eq!(parse_time_signature("6/8").unwrap(), (6, 3));
        assert_eq!(parse_time_signature(" 7 / 16 ").unwrap(), (7, 4));
        assert_eq!(parse_time_signature("2/2").unwrap(), (2, 1));
    }

    #[test]
    fn key_names() {
        assert_eq!(key_signature_from_name("C"), Some((0, false)));
        assert_eq!(key_signature_from_name("Am"), Some((0, true)));
        assert_eq!(key_signature_from_name("F#m"), Some((3, true)));
        assert_eq!(key_signature_from_name("Eb"), Some((-3, false)));
        assert_eq!(key_signature_from_name("D major"), Some((2, false)));
        assert_eq!(key_signature_from_name("g minor"), Some((-2, true)));
        assert_eq!(key_signature_from_name("B♭"), Some((-2, false)));
        assert_eq!(key_signature_from_name("H"), None);
        assert_eq!(key_signature_from_name(""), None);
        assert_eq!(key_signature_name(-2, false), Some("Bb"));
        assert_eq!(key_signature_name(3, true), Some("F#m"));
        assert_eq!(key_signature_name(9, false), None);
        for sharps in -7..=7 {
            for minor in [false, true] {
                let name = key_signature_name(sharps, minor).unwrap();
                assert_eq!(key_signature_from_name(name), Some((sharps, minor)));
            }
        }
    }
}
