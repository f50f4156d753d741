//! Non-blocking, tick-accurate player for an in-memory MIDI event array.
//!
//! Scheduling uses an absolute accumulating deadline: after each processed event the next
//! deadline advances by that event's delta converted to microseconds, never by `now + delta`.
//! However irregularly the control loop polls, the total run time of a sequence is exactly the
//! sum of its deltas.

use embassy_time::{Duration, Instant};
use tinyvec::ArrayVec;

pub mod smf;

/// Capacity of the owned event buffer; events past this are not retained.
pub const MAX_EVENTS: usize = 1024;

/// Tempo used when a standard MIDI file is loaded (its tempo meta events are not interpreted).
pub const DEFAULT_FILE_TEMPO_BPM: u16 = 120;

/// CC 123, the all-notes-off sweep emitted when playback stops.
const ALL_NOTES_OFF: (u8, u8, u8) = (0xB0, 123, 0);

/// One scheduled MIDI message. `delta_ticks` is the gap between this event and the one before
/// it, in ticks of the sequence's quarter-note resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MidiEvent {
    /// Ticks since the previous event.
    pub delta_ticks: u32,
    /// Status byte, `0x80..=0xEF`.
    pub status: u8,
    /// First data byte.
    pub data1: u8,
    /// Second data byte; zero for single-data-byte messages.
    pub data2: u8,
}

impl MidiEvent {
    /// Constructs an event from raw bytes.
    pub const fn new(delta_ticks: u32, status: u8, data1: u8, data2: u8) -> Self {
        Self {
            delta_ticks,
            status,
            data1,
            data2,
        }
    }

    /// A full-velocity Note On after `delta_ticks`.
    pub const fn note_on(delta_ticks: u32, note: u8) -> Self {
        Self::new(delta_ticks, 0x90, note, 127)
    }

    /// A Note Off after `delta_ticks`.
    pub const fn note_off(delta_ticks: u32, note: u8) -> Self {
        Self::new(delta_ticks, 0x80, note, 0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Transport {
    Stopped,
    Playing,
    Paused,
}

/// The sequencer engine. Owns the loaded sequence and its playback parameters.
///
/// Tempo scale, velocity scaling and transpose are applied at dispatch time, not load time, so
/// they can be changed mid-playback.
pub struct Sequencer {
    events: ArrayVec<[MidiEvent; MAX_EVENTS]>,
    cursor: usize,
    transport: Transport,
    next_event_at: Instant,
    pending_sweep: bool,
    ticks_per_quarter: u16,
    tempo_bpm: u16,
    us_per_tick: u64,
    tempo_scale: f32,
    velocity_scale: f32,
    transpose: i8,
    max_velocity: u8,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// Constructs an empty, stopped sequencer.
    pub fn new() -> Self {
        Self {
            events: ArrayVec::new(),
            cursor: 0,
            transport: Transport::Stopped,
            next_event_at: Instant::from_ticks(0),
            pending_sweep: false,
            ticks_per_quarter: 480,
            tempo_bpm: DEFAULT_FILE_TEMPO_BPM,
            us_per_tick: us_per_tick(DEFAULT_FILE_TEMPO_BPM, 480),
            tempo_scale: 1.0,
            velocity_scale: 1.0,
            transpose: 0,
            max_velocity: 127,
        }
    }

    /// Installs a new sequence, stopping any current playback. Does not auto-start.
    ///
    /// `max_velocity` caps every Note On proportionally (127 = no scaling). Events beyond
    /// [`MAX_EVENTS`] are dropped.
    pub fn load(
        &mut self,
        events: &[MidiEvent],
        ticks_per_quarter: u16,
        tempo_bpm: u16,
        transpose: i8,
        max_velocity: u8,
    ) {
        let was_active = self.transport != Transport::Stopped;
        self.stop();
        // the stop-sweep only matters when a sequence was actually cut short
        self.pending_sweep = was_active;
        self.events.clear();
        self.events
            .extend(events.iter().copied().take(MAX_EVENTS));
        if events.len() > MAX_EVENTS {
            warn!(
                "sequencer: sequence truncated to {} of {} events",
                MAX_EVENTS,
                events.len()
            );
        }
        self.ticks_per_quarter = ticks_per_quarter.max(1);
        self.tempo_bpm = tempo_bpm.max(1);
        self.us_per_tick = us_per_tick(self.tempo_bpm, self.ticks_per_quarter);
        self.transpose = transpose;
        self.max_velocity = max_velocity.clamp(1, 127);
    }

    /// Parses a standard-MIDI-file subset, loads its first track with the default tempo and no
    /// transpose, and starts playback. On error the current sequence keeps playing.
    pub fn load_smf(&mut self, data: &[u8], now: Instant) -> Result<usize, smf::SmfError> {
        let track = smf::parse(data)?;
        self.load(
            track.events.as_slice(),
            track.ticks_per_quarter,
            DEFAULT_FILE_TEMPO_BPM,
            0,
            127,
        );
        self.play(now);
        Ok(self.events.len())
    }

    /// Starts playback from the beginning.
    pub fn play(&mut self, now: Instant) {
        if self.events.is_empty() {
            return;
        }
        self.cursor = 0;
        self.next_event_at = now;
        self.transport = Transport::Playing;
        info!(
            "sequencer: playing {} events at {} us/tick",
            self.events.len(),
            self.us_per_tick
        );
    }

    /// Stops playback and rewinds. An all-notes-off sweep is emitted on the next tick.
    pub fn stop(&mut self) {
        self.transport = Transport::Stopped;
        self.cursor = 0;
        self.pending_sweep = true;
    }

    /// Freezes playback without losing the cursor.
    pub fn pause(&mut self) {
        if self.transport == Transport::Playing {
            self.transport = Transport::Paused;
        }
    }

    /// Resumes paused playback, re-anchoring the next deadline to `now` so the pause gap does
    /// not flush as an instantaneous backlog.
    pub fn resume(&mut self, now: Instant) {
        if self.transport == Transport::Paused {
            self.transport = Transport::Playing;
            self.next_event_at = now;
        }
    }

    /// True while actively playing (not paused, not stopped).
    pub fn is_playing(&self) -> bool {
        self.transport == Transport::Playing
    }

    /// True while paused mid-sequence.
    pub fn is_paused(&self) -> bool {
        self.transport == Transport::Paused
    }

    /// Number of loaded events.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Changes the base tempo; takes effect from the next event onward.
    pub fn set_tempo(&mut self, tempo_bpm: u16) {
        self.tempo_bpm = tempo_bpm.max(1);
        self.us_per_tick = us_per_tick(self.tempo_bpm, self.ticks_per_quarter);
    }

    /// Live tempo multiplier, clamped to `0.1..=4.0`.
    pub fn set_tempo_scale(&mut self, scale: f32) {
        self.tempo_scale = scale.clamp(0.1, 4.0);
    }

    /// Live velocity multiplier, clamped to `0.0..=2.0`; applied after the max-velocity cap.
    pub fn set_velocity_scale(&mut self, scale: f32) {
        self.velocity_scale = scale.clamp(0.0, 2.0);
    }

    /// Live transpose in semitones, clamped to one octave either way. Notes shifted outside
    /// the MIDI range are dropped, not wrapped.
    pub fn set_transpose(&mut self, semitones: i8) {
        self.transpose = semitones.clamp(-12, 12);
    }

    /// Emits every event whose deadline has passed. Call once per control-loop pass.
    pub fn tick(&mut self, now: Instant, sink: &mut impl FnMut(u8, u8, u8)) {
        if self.pending_sweep {
            self.pending_sweep = false;
            sink(ALL_NOTES_OFF.0, ALL_NOTES_OFF.1, ALL_NOTES_OFF.2);
        }
        if self.transport != Transport::Playing {
            return;
        }

        while self.cursor < self.events.len() && now >= self.next_event_at {
            let event = self.events[self.cursor];
            self.emit(event, sink);
            self.cursor += 1;
            if self.cursor < self.events.len() {
                let delta = self.events[self.cursor].delta_ticks;
                self.next_event_at += self.step(delta);
            }
        }

        if self.cursor == self.events.len() {
            info!("sequencer: sequence finished");
            self.stop();
            self.pending_sweep = false;
            sink(ALL_NOTES_OFF.0, ALL_NOTES_OFF.1, ALL_NOTES_OFF.2);
        }
    }

    /// Wall-clock length of `delta` ticks under the current tempo and tempo scale.
    fn step(&self, delta: u32) -> Duration {
        let us = (delta as u64 * self.us_per_tick) as f32 / self.tempo_scale;
        Duration::from_micros(us as u64)
    }

    /// Applies transpose and the velocity pipeline to note events; everything else passes
    /// through untouched.
    fn emit(&self, event: MidiEvent, sink: &mut impl FnMut(u8, u8, u8)) {
        match event.status & 0xF0 {
            0x90 => {
                let Some(note) = self.transposed(event.data1) else {
                    return;
                };
                sink(event.status, note, self.scaled_velocity(event.data2));
            }
            0x80 => {
                let Some(note) = self.transposed(event.data1) else {
                    return;
                };
                sink(event.status, note, event.data2);
            }
            _ => sink(event.status, event.data1, event.data2),
        }
    }

    fn transposed(&self, note: u8) -> Option<u8> {
        let shifted = note as i16 + self.transpose as i16;
        (0..=127).contains(&shifted).then_some(shifted as u8)
    }

    /// Velocity pipeline: the sequence's max-velocity cap first, then the live scale factor,
    /// then the final clamp to 127.
    fn scaled_velocity(&self, velocity: u8) -> u8 {
        let capped = velocity as u32 * self.max_velocity as u32 / 127;
        let scaled = (capped as f32 * self.velocity_scale) as u32;
        scaled.min(127) as u8
    }
}

/// MIDI timing: microseconds per quarter note is `60_000_000 / bpm`, divided by the tick
/// resolution.
fn us_per_tick(tempo_bpm: u16, ticks_per_quarter: u16) -> u64 {
    (60_000_000 / tempo_bpm as u64) / ticks_per_quarter as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(us: u64) -> Instant {
        Instant::from_micros(us)
    }

    const MS: u64 = 1000;

    /// Four quarter notes at 120 BPM, 480 ticks per quarter: 500 ms apart.
    fn quarter_notes() -> [MidiEvent; 4] {
        [
            MidiEvent::note_on(0, 69),
            MidiEvent::note_on(480, 71),
            MidiEvent::note_on(480, 72),
            MidiEvent::note_on(480, 74),
        ]
    }

    struct Sink {
        messages: [(u8, u8, u8); 64],
        count: usize,
    }

    impl Sink {
        fn new() -> Self {
            Self {
                messages: [(0, 0, 0); 64],
                count: 0,
            }
        }

        fn collect(&mut self) -> impl FnMut(u8, u8, u8) + '_ {
            |status, d1, d2| {
                self.messages[self.count] = (status, d1, d2);
                self.count += 1;
            }
        }

        fn notes_on(&self) -> usize {
            self.messages[..self.count]
                .iter()
                .filter(|(status, _, _)| status & 0xF0 == 0x90)
                .count()
        }
    }

    #[test]
    fn load_does_not_autostart() {
        let mut seq = Sequencer::new();
        seq.load(&quarter_notes(), 480, 120, 0, 127);
        assert!(!seq.is_playing());
        assert_eq!(4, seq.event_count());
    }

    #[test]
    fn deadlines_accumulate_without_drift() {
        let mut seq = Sequencer::new();
        seq.load(&quarter_notes(), 480, 120, 0, 127);
        seq.play(at(0));

        // 480 ticks at 120 BPM/480 tpq = 480 * 1041 us = 499.680 ms per quarter
        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());
        assert_eq!(1, sink.notes_on(), "first event fires at play time");

        // called late: the second event is due, the third (999.360 ms) is not
        seq.tick(at(600 * MS), &mut sink.collect());
        assert_eq!(2, sink.notes_on(), "lateness must not drag deadlines along");

        seq.tick(at(1_498 * MS), &mut sink.collect());
        assert_eq!(3, sink.notes_on(), "third deadline is absolute, not now-relative");

        // last deadline is exactly 3 * 499.680 ms after play
        seq.tick(at(1_499_039), &mut sink.collect());
        assert_eq!(3, sink.notes_on());
        seq.tick(at(1_499_040), &mut sink.collect());
        assert_eq!(4, sink.notes_on());
    }

    #[test]
    fn finishing_emits_the_all_notes_off_sweep_and_stops() {
        let mut seq = Sequencer::new();
        seq.load(&[MidiEvent::note_on(0, 69)], 480, 120, 0, 127);
        seq.play(at(0));

        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());

        assert!(!seq.is_playing());
        assert_eq!((0x90, 69, 127), sink.messages[0]);
        assert_eq!((0xB0, 123, 0), sink.messages[1], "sweep follows the last event");
    }

    #[test]
    fn stop_sweeps_on_the_next_tick() {
        let mut seq = Sequencer::new();
        seq.load(&quarter_notes(), 480, 120, 0, 127);
        seq.play(at(0));
        seq.stop();

        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());
        assert_eq!(1, sink.count);
        assert_eq!((0xB0, 123, 0), sink.messages[0]);
    }

    #[test]
    fn pause_freezes_and_resume_reanchors() {
        let mut seq = Sequencer::new();
        seq.load(&quarter_notes(), 480, 120, 0, 127);
        seq.play(at(0));

        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());
        seq.pause();
        assert!(seq.is_paused());

        // a long pause; nothing may play, and nothing may pile up
        seq.tick(at(5_000 * MS), &mut sink.collect());
        assert_eq!(1, sink.notes_on());

        seq.resume(at(5_000 * MS));
        seq.tick(at(5_000 * MS), &mut sink.collect());
        assert_eq!(
            2,
            sink.notes_on(),
            "resume re-anchors: only the next event fires, no backlog flush"
        );
        seq.tick(at(5_001 * MS), &mut sink.collect());
        assert_eq!(2, sink.notes_on());
    }

    #[test]
    fn velocity_pipeline_caps_then_scales_then_clamps() {
        let mut seq = Sequencer::new();
        seq.load(&[MidiEvent::note_on(0, 69)], 480, 120, 0, 64);
        seq.set_velocity_scale(1.5);
        seq.play(at(0));

        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());
        // 127 * 64/127 = 64, then * 1.5 = 96
        assert_eq!((0x90, 69, 96), sink.messages[0]);
    }

    #[test]
    fn velocity_clamp_tops_out_at_127() {
        let mut seq = Sequencer::new();
        seq.load(&[MidiEvent::note_on(0, 69)], 480, 120, 0, 127);
        seq.set_velocity_scale(2.0);
        seq.play(at(0));

        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());
        assert_eq!((0x90, 69, 127), sink.messages[0]);
    }

    #[test]
    fn transpose_shifts_and_drops_out_of_range() {
        let mut seq = Sequencer::new();
        let events = [MidiEvent::note_on(0, 120), MidiEvent::note_on(0, 60)];
        seq.load(&events, 480, 120, 12, 127);
        seq.play(at(0));

        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());
        let notes: [(u8, u8, u8); 64] = sink.messages;
        assert_eq!(
            (0x90, 72, 127),
            notes[0],
            "note 120 transposed past 127 is dropped, not wrapped"
        );
    }

    #[test]
    fn tempo_scale_applies_at_dispatch_time() {
        let mut seq = Sequencer::new();
        seq.load(&quarter_notes(), 480, 120, 0, 127);
        seq.play(at(0));

        let mut sink = Sink::new();
        seq.tick(at(0), &mut sink.collect());
        seq.set_tempo_scale(2.0); // double speed from here on

        // the second deadline was already fixed at 499.680 ms when the first event was
        // processed; the scale kicks in for the gap computed after it
        seq.tick(at(500 * MS), &mut sink.collect());
        assert_eq!(2, sink.notes_on());
        seq.tick(at(749 * MS), &mut sink.collect());
        assert_eq!(2, sink.notes_on());
        seq.tick(at(750 * MS), &mut sink.collect());
        assert_eq!(3, sink.notes_on(), "gap after the scale change is halved");
    }

    #[test]
    fn loading_replaces_the_active_sequence() {
        let mut seq = Sequencer::new();
        seq.load(&quarter_notes(), 480, 120, 0, 127);
        seq.play(at(0));
        assert!(seq.is_playing());

        seq.load(&[MidiEvent::note_on(0, 70)], 480, 120, 0, 127);
        assert!(!seq.is_playing(), "load implicitly stops the previous sequence");
        assert_eq!(1, seq.event_count());
    }

    #[test]
    fn empty_sequencer_refuses_to_play() {
        let mut seq = Sequencer::new();
        seq.play(at(0));
        assert!(!seq.is_playing());
    }
}
