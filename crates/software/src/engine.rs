//! The cooperative control loop's state: one of every subsystem, multiplexed behind a single
//! `&mut self`.
//!
//! All mutation of core state flows through this one object — receivers push bytes and frames
//! in, the periodic state machines advance in [`tick`][Carillon::tick], and everything
//! converges on the dispatch funnel into the actuation layer. A multi-tasking runtime keeps
//! the no-concurrent-mutation invariant by serializing every entry point into the one task
//! that owns the `Carillon`.

use crate::clock::{ClockChimes, ClockSettings, Quarter, WallTime};
use crate::datagram::{DatagramError, DatagramReceiver};
use crate::dispatch;
use crate::repeater::NoteRepeater;
use crate::sequencer::{smf::SmfError, Sequencer};
use crate::serial_midi::SerialMidiParser;
use crate::striker::{BankError, Calibration, ChimeBank, DutyOutput, CHANNEL_COUNT};
use embassy_time::{Duration, Instant};

/// The whole instrument: actuation bank, receivers, sequencer, repeater, and clock scheduler.
pub struct Carillon<O: DutyOutput> {
    chimes: ChimeBank<O>,
    serial: SerialMidiParser,
    datagram: DatagramReceiver,
    sequencer: Sequencer,
    repeater: NoteRepeater,
    clock: ClockChimes,
}

impl<O: DutyOutput> Carillon<O> {
    /// Builds the instrument from its physical outputs and configuration tables.
    pub fn new(
        outputs: [O; CHANNEL_COUNT],
        calibrations: [Calibration; CHANNEL_COUNT],
        note_to_channel: [u8; CHANNEL_COUNT],
        power_budget: usize,
        clock_settings: ClockSettings,
    ) -> Result<Self, BankError> {
        Ok(Self {
            chimes: ChimeBank::new(outputs, calibrations, note_to_channel, power_budget)?,
            serial: SerialMidiParser::new(),
            datagram: DatagramReceiver::new(),
            sequencer: Sequencer::new(),
            repeater: NoteRepeater::new(),
            clock: ClockChimes::new(clock_settings),
        })
    }

    /// Feeds one byte from the serial MIDI input; completed messages dispatch immediately.
    pub fn feed_serial(&mut self, byte: u8, now: Instant) {
        if let Some((status, data1, data2)) = self.serial.feed(byte, now) {
            dispatch::handle_message(&mut self.chimes, status, data1, data2, now);
        }
    }

    /// Handles one MUDP datagram; valid batches dispatch immediately, invalid ones are dropped
    /// whole and counted.
    pub fn handle_datagram(&mut self, frame: &[u8], now: Instant) -> Result<u8, DatagramError> {
        let Self {
            chimes, datagram, ..
        } = self;
        datagram.handle_packet(frame, &mut |status, data1, data2| {
            dispatch::handle_message(chimes, status, data1, data2, now);
        })
    }

    /// Dispatches an already-parsed MIDI message (the control surface's note commands).
    pub fn handle_message(&mut self, status: u8, data1: u8, data2: u8, now: Instant) {
        dispatch::handle_message(&mut self.chimes, status, data1, data2, now);
    }

    /// Advances every periodic state machine, in the fixed loop order: sequencer, repeater,
    /// clock scheduler, actuation.
    pub fn tick(&mut self, now: Instant, wall: Option<WallTime>) {
        let Self {
            chimes,
            sequencer,
            repeater,
            clock,
            ..
        } = self;
        sequencer.tick(now, &mut |status, data1, data2| {
            dispatch::handle_message(chimes, status, data1, data2, now);
        });
        repeater.tick(now, chimes);
        clock.tick(now, wall, sequencer, repeater);
        chimes.tick(now);
    }

    /// Parses and starts playing a standard-MIDI-file subset. On error nothing changes.
    pub fn play_smf(&mut self, data: &[u8], now: Instant) -> Result<usize, SmfError> {
        self.sequencer.load_smf(data, now)
    }

    /// Stops sequencer playback and releases every striker at once.
    pub fn stop_playback(&mut self) {
        self.sequencer.stop();
        self.chimes.all_off();
    }

    /// Panic path: stops the sequencer and the repeater and forces every channel off.
    pub fn panic_stop(&mut self) {
        warn!("engine: panic stop");
        self.sequencer.stop();
        self.repeater.stop_all();
        self.chimes.all_off();
    }

    /// Manually fires a chime melody (control-surface test operation).
    pub fn trigger_chime(&mut self, quarter: Quarter, wall: Option<WallTime>, now: Instant) {
        let Self {
            sequencer,
            repeater,
            clock,
            ..
        } = self;
        clock.trigger(quarter, wall, sequencer, repeater, now);
    }

    /// Starts or retunes a repeating strike (device note domain).
    pub fn start_repeat(
        &mut self,
        note: u8,
        velocity: u8,
        period: Duration,
        repeat_count: u16,
        now: Instant,
    ) -> bool {
        self.repeater.start(note, velocity, period, repeat_count, now)
    }

    /// Stops one repeating note.
    pub fn stop_repeat(&mut self, note: u8) -> bool {
        self.repeater.stop(note)
    }

    /// Stops every repeating note.
    pub fn stop_all_repeats(&mut self) {
        self.repeater.stop_all();
    }

    /// The actuation bank, for diagnostics.
    pub fn chimes(&self) -> &ChimeBank<O> {
        &self.chimes
    }

    /// The sequencer, for transport queries.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Mutable sequencer access for transport and live-parameter commands.
    pub fn sequencer_mut(&mut self) -> &mut Sequencer {
        &mut self.sequencer
    }

    /// The repeater, for diagnostics.
    pub fn repeater(&self) -> &NoteRepeater {
        &self.repeater
    }

    /// The clock scheduler, for settings queries.
    pub fn clock(&self) -> &ClockChimes {
        &self.clock
    }

    /// Mutable clock access for the settings commands.
    pub fn clock_mut(&mut self) -> &mut ClockChimes {
        &mut self.clock
    }

    /// The datagram receiver's diagnostic counters.
    pub fn datagram(&self) -> &DatagramReceiver {
        &self.datagram
    }
}
