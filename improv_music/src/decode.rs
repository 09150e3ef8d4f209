// Standard MIDI File → Score.
//
// Replays each track's events with `midly`, pairing note-on/note-off events
// per pitch into `Note`s. Absolute ticks convert to seconds through a tempo
// map merged from every track (Format 1 files keep tempo in track 0 while
// notes live elsewhere), defaulting to 120 BPM before the first tempo event.
// SMPTE timecode files use a fixed `fps * subframes` ticks per second.
//
// Same-pitch notes are matched first-in-first-out. Note-ons still open at
// the end of a track are dropped with a warning, as are pairs that open and
// close on the same tick; stray note-offs are ignored. Tracks with no channel events at all (conductor tracks) do not
// become Score tracks, but their time/key signatures are still collected.

use crate::config::DEFAULT_TEMPO_US;
use crate::error::DecodeError;
use crate::midi::key_signature_name;
use crate::score::{Note, Score, Track as ScoreTrack};
use midly::{Fps, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, warn};

/// A decoded file plus the header facts a Score has no room for.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMidi {
    pub score: Score,
    /// Tempo in effect at tick 0 (µs per quarter), 120 BPM if none is set.
    pub tempo_us: u32,
    /// Metrical resolution, `None` for SMPTE timecode files.
    pub ticks_per_quarter: Option<u16>,
}

/// Read and decode a MIDI file from disk.
pub fn read_midi(path: &Path) -> Result<Score, DecodeError> {
    Ok(read_midi_detailed(path)?.score)
}

/// Read a MIDI file, keeping tempo and resolution alongside the Score.
pub fn read_midi_detailed(path: &Path) -> Result<DecodedMidi, DecodeError> {
    let bytes = std::fs::read(path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "read MIDI file");
    decode_detailed(&bytes)
}

/// Decode SMF bytes into a Score.
pub fn decode(bytes: &[u8]) -> Result<Score, DecodeError> {
    Ok(decode_detailed(bytes)?.score)
}

/// Decode SMF bytes, keeping tempo and resolution alongside the Score.
pub fn decode_detailed(bytes: &[u8]) -> Result<DecodedMidi, DecodeError> {
    let smf = Smf::parse(bytes).map_err(|e| DecodeError::Parse(e.to_string()))?;
    let clock = TickClock::new(&smf);

    let mut score = Score::default();
    for (index, events) in smf.tracks.iter().enumerate() {
        collect_signatures(events, &mut score);
        if let Some(track) = replay_track(index, events, &clock) {
            score.tracks.push(track);
        }
    }

    debug!(
        tracks = score.tracks.len(),
        notes = score.total_notes(),
        "decoded MIDI"
    );
    Ok(DecodedMidi {
        score,
        tempo_us: clock.first_tempo(),
        ticks_per_quarter: match smf.header.timing {
            Timing::Metrical(tpq) => Some(tpq.as_int()),
            Timing::Timecode(..) => None,
        },
    })
}

/// An open note-on waiting for its note-off.
struct Pending {
    tick: u64,
    velocity: u8,
    seq: usize,
}

fn replay_track(index: usize, events: &[TrackEvent<'_>], clock: &TickClock) -> Option<ScoreTrack> {
    let mut has_channel_events = false;
    let mut name = None;
    let mut program = 0u8;
    let mut open: HashMap<u8, VecDeque<Pending>> = HashMap::new();
    let mut notes: Vec<(usize, Note)> = Vec::new();
    let mut seq = 0usize;
    let mut tick = 0u64;
    let mut zero_length = 0usize;

    for event in events {
        tick += u64::from(event.delta.as_int());
        match event.kind {
            TrackEventKind::Meta(MetaMessage::TrackName(bytes)) => {
                name = Some(String::from_utf8_lossy(bytes).into_owned());
            }
            TrackEventKind::Midi { message, .. } => {
                has_channel_events = true;
                match message {
                    MidiMessage::ProgramChange { program: p } => program = p.as_int(),
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        open.entry(key.as_int()).or_default().push_back(Pending {
                            tick,
                            velocity: vel.as_int(),
                            seq,
                        });
                        seq += 1;
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        let pitch = key.as_int();
                        if let Some(on) = open.get_mut(&pitch).and_then(VecDeque::pop_front) {
                            if on.tick == tick {
                                zero_length += 1;
                                continue;
                            }
                            let onset = clock.seconds(on.tick);
                            let duration = clock.seconds(tick) - onset;
                            notes.push((on.seq, Note::new(pitch, onset, duration, on.velocity)));
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    if !has_channel_events {
        return None;
    }

    let dangling: usize = open.values().map(VecDeque::len).sum();
    if dangling > 0 {
        warn!(track = index, dangling, "dropping note-ons with no matching note-off");
    }
    if zero_length > 0 {
        warn!(track = index, zero_length, "dropping zero-length notes");
    }

    // Onset order, ties broken by note-on order.
    notes.sort_by(|a, b| a.1.onset.total_cmp(&b.1.onset).then(a.0.cmp(&b.0)));
    Some(ScoreTrack {
        name,
        program,
        notes: notes.into_iter().map(|(_, note)| note).collect(),
    })
}

fn collect_signatures(events: &[TrackEvent<'_>], score: &mut Score) {
    for event in events {
        match event.kind {
            TrackEventKind::Meta(MetaMessage::TimeSignature(num, den_pow, _, _)) => {
                let denominator = 1u32.checked_shl(u32::from(den_pow)).unwrap_or(0);
                score.time_signatures.push(format!("{num}/{denominator}"));
            }
            TrackEventKind::Meta(MetaMessage::KeySignature(sharps, minor)) => {
                match key_signature_name(sharps, minor) {
                    Some(name) => score.key_signatures.push(name.to_string()),
                    None => warn!(sharps, minor, "ignoring out-of-range key signature"),
                }
            }
            _ => {}
        }
    }
}

/// Converts absolute ticks to seconds.
enum TickClock {
    Metrical {
        ticks_per_quarter: f64,
        /// `(tick, seconds at tick, µs per quarter from tick on)`, by tick.
        segments: Vec<(u64, f64, u32)>,
    },
    Timecode {
        ticks_per_second: f64,
        first_tempo: u32,
    },
}

impl TickClock {
    fn new(smf: &Smf<'_>) -> Self {
        let mut changes: Vec<(u64, u32)> = Vec::new();
        for events in &smf.tracks {
            let mut tick = 0u64;
            for event in events {
                tick += u64::from(event.delta.as_int());
                if let TrackEventKind::Meta(MetaMessage::Tempo(us)) = event.kind {
                    changes.push((tick, us.as_int()));
                }
            }
        }
        // Stable: same-tick changes keep track order, and the later one wins.
        changes.sort_by_key(|&(tick, _)| tick);

        match smf.header.timing {
            Timing::Metrical(tpq) => {
                let ticks_per_quarter = f64::from(tpq.as_int().max(1));
                let mut segments = vec![(0u64, 0.0f64, DEFAULT_TEMPO_US)];
                for (tick, tempo) in changes {
                    let &(last_tick, last_secs, last_tempo) =
                        segments.last().unwrap_or(&(0, 0.0, DEFAULT_TEMPO_US));
                    let secs = last_secs
                        + (tick - last_tick) as f64 * f64::from(last_tempo)
                            / (ticks_per_quarter * 1_000_000.0);
                    if tick == last_tick {
                        segments.pop();
                    }
                    segments.push((tick, secs, tempo));
                }
                TickClock::Metrical {
                    ticks_per_quarter,
                    segments,
                }
            }
            Timing::Timecode(fps, subframes) => {
                let frames = match fps {
                    Fps::Fps24 => 24.0,
                    Fps::Fps25 => 25.0,
                    Fps::Fps29 => 29.97,
                    Fps::Fps30 => 30.0,
                };
                TickClock::Timecode {
                    ticks_per_second: (frames * f64::from(subframes)).max(1.0),
                    first_tempo: changes.first().map_or(DEFAULT_TEMPO_US, |c| c.1),
                }
            }
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        match self {
            TickClock::Metrical {
                ticks_per_quarter,
                segments,
            } => {
                let at = segments.partition_point(|s| s.0 <= tick).saturating_sub(1);
                let (seg_tick, seg_secs, tempo) = segments[at];
                seg_secs
                    + (tick - seg_tick) as f64 * f64::from(tempo)
                        / (ticks_per_quarter * 1_000_000.0)
            }
            TickClock::Timecode {
                ticks_per_second, ..
            } => tick as f64 / ticks_per_second,
        }
    }

    /// A tempo at tick 0 replaces the default segment.
    fn first_tempo(&self) -> u32 {
        match self {
            TickClock::Metrical { segments, .. } => {
                segments.first().map_or(DEFAULT_TEMPO_US, |s| s.2)
            }
            TickClock::Timecode { first_tempo, .. } => *first_tempo,
        }
    }
}
