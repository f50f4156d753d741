//! Tower-clock chime scheduler: quarter-hour melodies and hour strikes, with quiet and
//! silence windows, modeled on a mechanical striking clock.
//!
//! Driven once per control-loop pass against externally synchronized local time. Melodies play
//! through the [`Sequencer`]; hour strikes count through the [`NoteRepeater`] and are deferred
//! until the melody has finished — melody first, then the count, never overlapping.

use crate::repeater::NoteRepeater;
use crate::sequencer::Sequencer;
use embassy_time::{Duration, Instant};

pub mod tunes;
pub use tunes::{Quarter, Tune};

/// Externally synchronized local time of day.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WallTime {
    /// Hour, 0–23.
    pub hour: u8,
    /// Minute, 0–59.
    pub minute: u8,
}

/// A local-hour window. `start < end` is a plain range, `start > end` wraps past midnight,
/// `start == end` (or any bound of 24 and above) disables the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HourWindow {
    /// First hour inside the window.
    pub start: u8,
    /// First hour outside the window again.
    pub end: u8,
}

impl HourWindow {
    /// Whether `hour` falls inside the window.
    pub fn contains(&self, hour: u8) -> bool {
        if self.start >= 24 || self.end >= 24 {
            return false;
        }
        if self.start < self.end {
            (self.start..self.end).contains(&hour)
        } else if self.start > self.end {
            hour >= self.start || hour < self.end
        } else {
            false
        }
    }
}

/// The clock scheduler's configuration. Persisted by the external settings store; mutated only
/// through the setters on [`ClockChimes`], which clamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockSettings {
    /// Master enable for time-driven chiming.
    pub enabled: bool,
    /// Melody selection.
    pub tune: Tune,
    /// Whether the hour is struck after the hour melody.
    pub hour_strike_enabled: bool,
    /// Up to three device notes struck together on the hour.
    pub hour_notes: [Option<u8>; 3],
    /// Melody tempo in beats per minute.
    pub tune_tempo_bpm: u16,
    /// Melody velocity, 1–127.
    pub tune_velocity: u8,
    /// Gap between hour strikes.
    pub strike_interval: Duration,
    /// Hour-strike velocity, 1–127.
    pub hour_velocity: u8,
    /// Velocity multiplier numerator (out of 127) inside the quiet window.
    pub quiet_scale: u8,
    /// Hours during which chimes are attenuated.
    pub quiet_hours: HourWindow,
    /// Hours during which chimes are suppressed entirely. Overrides the quiet window.
    pub silence_hours: HourWindow,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tune: Tune::Westminster,
            hour_strike_enabled: true,
            hour_notes: [Some(2), Some(9), None],
            tune_tempo_bpm: 120,
            tune_velocity: 127,
            strike_interval: Duration::from_millis(2000),
            hour_velocity: 127,
            quiet_scale: 64,
            quiet_hours: HourWindow { start: 20, end: 7 },
            silence_hours: HourWindow { start: 22, end: 7 },
        }
    }
}

/// The clock chime scheduler.
pub struct ClockChimes {
    settings: ClockSettings,
    last_minute: Option<u8>,
    chime_in_progress: bool,
    pending_strike: Option<u8>,
}

/// Strike count used by the manual hour trigger.
const TEST_STRIKE_COUNT: u8 = 3;

impl Default for ClockChimes {
    fn default() -> Self {
        Self::new(ClockSettings::default())
    }
}

impl ClockChimes {
    /// Constructs a scheduler from (externally loaded) settings.
    pub fn new(settings: ClockSettings) -> Self {
        Self {
            settings,
            last_minute: None,
            chime_in_progress: false,
            pending_strike: None,
        }
    }

    /// Advances the scheduler. Call once per control-loop pass.
    ///
    /// `wall` is the current local time, or `None` while the clock has not been synchronized
    /// yet (nothing chimes without it, but a finishing melody still releases its pending hour
    /// strike).
    pub fn tick(
        &mut self,
        now: Instant,
        wall: Option<WallTime>,
        sequencer: &mut Sequencer,
        repeater: &mut NoteRepeater,
    ) {
        // a chime in progress only needs its completion watched, enabled or not
        if self.chime_in_progress {
            if !sequencer.is_playing() {
                self.chime_in_progress = false;
                debug!("clock: melody finished");
                if let Some(count) = self.pending_strike.take() {
                    let hour = wall.map_or(0, |w| w.hour);
                    self.strike_hour(count, hour, repeater, now);
                }
            }
            return;
        }

        if !self.settings.enabled {
            return;
        }
        let Some(wall) = wall else {
            return;
        };

        // silence suppresses everything, unconditionally, overriding quiet mode
        if self.settings.silence_hours.contains(wall.hour) {
            self.last_minute = Some(wall.minute);
            return;
        }

        let minute_changed = self.last_minute != Some(wall.minute);
        self.last_minute = Some(wall.minute);
        if !minute_changed {
            return;
        }

        let quarter = match wall.minute {
            15 => Quarter::Quarter,
            30 => Quarter::Half,
            45 => Quarter::ThreeQuarter,
            0 => Quarter::Hour,
            _ => return,
        };

        info!("clock: {} chime at {}:{}", quarter, wall.hour, wall.minute);
        self.play_melody(quarter, wall.hour, sequencer, now);

        if quarter == Quarter::Hour && self.settings.hour_strike_enabled {
            let count = match wall.hour % 12 {
                0 => 12,
                hour => hour,
            };
            if self.chime_in_progress {
                // deferred until the melody completes
                self.pending_strike = Some(count);
            } else {
                // no melody configured: strike right away
                self.strike_hour(count, wall.hour, repeater, now);
            }
        }
    }

    /// Manually fires a chime, for testing from the control surface. An hour chime also runs a
    /// short test strike afterwards if hour striking is enabled.
    pub fn trigger(
        &mut self,
        quarter: Quarter,
        wall: Option<WallTime>,
        sequencer: &mut Sequencer,
        repeater: &mut NoteRepeater,
        now: Instant,
    ) {
        let hour = wall.map_or(0, |w| w.hour);
        info!("clock: manual {} chime", quarter);
        self.play_melody(quarter, hour, sequencer, now);
        if quarter == Quarter::Hour && self.settings.hour_strike_enabled {
            if self.chime_in_progress {
                self.pending_strike = Some(TEST_STRIKE_COUNT);
            } else {
                self.strike_hour(TEST_STRIKE_COUNT, hour, repeater, now);
            }
        }
    }

    /// The current settings.
    pub fn settings(&self) -> &ClockSettings {
        &self.settings
    }

    /// Enables or disables time-driven chiming.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.settings.enabled = enabled;
    }

    /// Selects the melody.
    pub fn set_tune(&mut self, tune: Tune) {
        self.settings.tune = tune;
    }

    /// Enables or disables the hour strike.
    pub fn set_hour_strike_enabled(&mut self, enabled: bool) {
        self.settings.hour_strike_enabled = enabled;
    }

    /// Sets one of the three hour-strike voices to a device note, or silences it.
    pub fn set_hour_note(&mut self, index: usize, note: Option<u8>) {
        if let Some(slot) = self.settings.hour_notes.get_mut(index) {
            *slot = note.filter(|&n| (n as usize) < crate::striker::CHANNEL_COUNT);
        }
    }

    /// Sets the melody tempo.
    pub fn set_tune_tempo(&mut self, bpm: u16) {
        self.settings.tune_tempo_bpm = bpm.clamp(20, 360);
    }

    /// Sets the melody velocity.
    pub fn set_tune_velocity(&mut self, velocity: u8) {
        self.settings.tune_velocity = velocity.clamp(1, 127);
    }

    /// Sets the gap between hour strikes.
    pub fn set_strike_interval(&mut self, interval: Duration) {
        self.settings.strike_interval = interval;
    }

    /// Sets the hour-strike velocity.
    pub fn set_hour_velocity(&mut self, velocity: u8) {
        self.settings.hour_velocity = velocity.clamp(1, 127);
    }

    /// Sets the quiet-window attenuation, 0–127.
    pub fn set_quiet_scale(&mut self, scale: u8) {
        self.settings.quiet_scale = scale.min(127);
    }

    /// Sets the quiet (attenuated) window.
    pub fn set_quiet_hours(&mut self, window: HourWindow) {
        self.settings.quiet_hours = window;
    }

    /// Sets the silence (fully suppressed) window.
    pub fn set_silence_hours(&mut self, window: HourWindow) {
        self.settings.silence_hours = window;
    }

    fn play_melody(&mut self, quarter: Quarter, hour: u8, sequencer: &mut Sequencer, now: Instant) {
        let Some(melody) = tunes::sequence(self.settings.tune, quarter) else {
            return;
        };
        let velocity = self.scaled_velocity(self.settings.tune_velocity, hour);
        sequencer.load(
            melody,
            tunes::TICKS_PER_QUARTER,
            self.settings.tune_tempo_bpm,
            0,
            velocity,
        );
        sequencer.play(now);
        self.chime_in_progress = true;
    }

    fn strike_hour(&self, count: u8, hour: u8, repeater: &mut NoteRepeater, now: Instant) {
        let velocity = self.scaled_velocity(self.settings.hour_velocity, hour);
        info!("clock: striking {} at velocity {}", count, velocity);
        for note in self.settings.hour_notes.iter().flatten() {
            repeater.start(
                *note,
                velocity,
                self.settings.strike_interval,
                count as u16,
                now,
            );
        }
    }

    /// Attenuates a velocity by `quiet_scale / 127` when the hour is inside the quiet window.
    fn scaled_velocity(&self, base: u8, hour: u8) -> u8 {
        if self.settings.quiet_hours.contains(hour) {
            (base as u16 * self.settings.quiet_scale as u16 / 127) as u8
        } else {
            base
        }
    }
}
