//! Physical actuation layer: the striker channels, their strike state machines, and the
//! power-budget admission control that protects the shared supply.

use embassy_time::{Duration, Instant};

mod calibration;
pub use calibration::*;

/// Number of physical striker channels on the instrument.
pub const CHANNEL_COUNT: usize = 21;

/// Strikers that may be energized at once before the shared supply sags.
pub const DEFAULT_POWER_BUDGET: usize = 6;

/// Device-note → physical-channel wiring with every note on its same-numbered channel.
///
/// The real instrument's table lives in the board configuration; musical ordering and cable
/// ordering are revised independently, so the two never have to agree.
pub const DEFAULT_NOTE_TO_CHANNEL: [u8; CHANNEL_COUNT] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
];

/// One duty-cycle output that a striker coil hangs off.
///
/// The firmware provides the closed set of backends (shared-timer PWM pair, dedicated PWM
/// channel, software bitstream); everything above this trait is backend-agnostic.
pub trait DutyOutput {
    /// Sets the output duty in percent; 0 releases the coil, 100 energizes it fully.
    fn set_duty_percent(&mut self, percent: u8);
}

/// Phase of a channel's strike state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StrikePhase {
    /// Coil released.
    Idle,
    /// Coil energized, waiting out the hold duration.
    Kicking,
}

#[derive(Clone, Copy)]
struct Strike {
    phase: StrikePhase,
    started_at: Instant,
    duty: u8,
    hold: Duration,
}

impl Strike {
    const IDLE: Self = Self {
        phase: StrikePhase::Idle,
        started_at: Instant::from_ticks(0),
        duty: 0,
        hold: Duration::from_ticks(0),
    };
}

struct Channel<O> {
    out: O,
    calibration: Calibration,
    strike: Strike,
}

/// The bank of striker channels. Owns the outputs, the calibration table, and the device-note
/// wiring; every note source ends up here.
///
/// At most one strike is ever active per channel: striking a channel that is already kicking
/// restarts its timer rather than stacking a second pulse.
pub struct ChimeBank<O: DutyOutput> {
    channels: [Channel<O>; CHANNEL_COUNT],
    note_to_channel: [u8; CHANNEL_COUNT],
    budget: usize,
}

impl<O: DutyOutput> ChimeBank<O> {
    /// Builds a bank from its outputs and configuration tables, rejecting invalid calibration
    /// entries and wiring targets up front.
    pub fn new(
        outputs: [O; CHANNEL_COUNT],
        calibrations: [Calibration; CHANNEL_COUNT],
        note_to_channel: [u8; CHANNEL_COUNT],
        budget: usize,
    ) -> Result<Self, BankError> {
        for (index, entry) in calibrations.iter().enumerate() {
            entry.check().map_err(|kind| BankError::Calibration {
                channel: index as u8,
                kind,
            })?;
        }
        if let Some(&channel) = note_to_channel
            .iter()
            .find(|&&channel| channel as usize >= CHANNEL_COUNT)
        {
            return Err(BankError::WiringOutOfRange { channel });
        }

        let mut calibrations = calibrations.into_iter();
        Ok(Self {
            channels: outputs.map(|out| Channel {
                out,
                // the iterator is exactly CHANNEL_COUNT long, like the outputs
                calibration: calibrations.next().unwrap_or(DEFAULT_CALIBRATION),
                strike: Strike::IDLE,
            }),
            note_to_channel,
            budget,
        })
    }

    /// Strikes a physical channel with an explicit duty and hold, bypassing calibration.
    ///
    /// Duty is clamped to 100%. If the channel is idle, admission control runs first so the
    /// strike never pushes the bank over its power budget; a channel that is already kicking
    /// just restarts.
    pub fn strike_raw(&mut self, channel: usize, duty_percent: u8, hold: Duration, now: Instant) {
        if channel >= CHANNEL_COUNT {
            return;
        }
        if self.channels[channel].strike.phase == StrikePhase::Idle {
            self.admit(channel);
        }
        let duty = duty_percent.min(100);
        let ch = &mut self.channels[channel];
        ch.out.set_duty_percent(duty);
        ch.strike = Strike {
            phase: StrikePhase::Kicking,
            started_at: now,
            duty,
            hold,
        };
    }

    /// Strikes a device note at a MIDI velocity, resolving the wiring table and the channel's
    /// calibration. Out-of-range notes are dropped; velocity is clamped to `[1, 127]`.
    pub fn strike_note(&mut self, device_note: u8, velocity: u8, now: Instant) {
        let Some(&channel) = self.note_to_channel.get(device_note as usize) else {
            debug!("striker: note {} has no channel", device_note);
            return;
        };
        let calibration = self.channels[channel as usize].calibration;
        let duty = calibration.duty_for_velocity(velocity.clamp(1, 127));
        let hold = calibration.hold_for_duty(duty);
        self.strike_raw(channel as usize, duty, hold, now);
    }

    /// Releases a device note. The strikers have no dampers, so this is accepted and does
    /// nothing; the strike ends when its hold elapses.
    pub fn release_note(&mut self, _device_note: u8) {}

    /// Returns expired strikes to idle. Call once per control-loop pass.
    pub fn tick(&mut self, now: Instant) {
        for ch in &mut self.channels {
            if ch.strike.phase == StrikePhase::Kicking
                && now.duration_since(ch.strike.started_at) >= ch.strike.hold
            {
                ch.out.set_duty_percent(0);
                ch.strike = Strike::IDLE;
            }
        }
    }

    /// Unconditionally releases every channel. Panic/reset path.
    pub fn all_off(&mut self) {
        for ch in &mut self.channels {
            ch.out.set_duty_percent(0);
            ch.strike = Strike::IDLE;
        }
        info!("striker: all channels off");
    }

    /// Number of channels currently kicking.
    pub fn active_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|ch| ch.strike.phase == StrikePhase::Kicking)
            .count()
    }

    /// Strike phase of a channel, for diagnostics.
    pub fn phase(&self, channel: usize) -> Option<StrikePhase> {
        self.channels.get(channel).map(|ch| ch.strike.phase)
    }

    /// Current duty of a channel, for diagnostics.
    pub fn duty(&self, channel: usize) -> Option<u8> {
        self.channels.get(channel).map(|ch| ch.strike.duty)
    }

    /// The configured power budget.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Makes room for a strike on `incoming` (an idle channel) by evicting the oldest kicking
    /// strikes until the bank is back under budget. Ties on the start timestamp break toward
    /// the lowest channel index, which is the table scan order. Eviction is destructive: the
    /// evicted strike simply ends early.
    fn admit(&mut self, incoming: usize) {
        while self.active_count() >= self.budget.max(1) {
            let oldest = self
                .channels
                .iter()
                .enumerate()
                .filter(|(index, ch)| {
                    *index != incoming && ch.strike.phase == StrikePhase::Kicking
                })
                .min_by_key(|(index, ch)| (ch.strike.started_at, *index))
                .map(|(index, _)| index);
            let Some(index) = oldest else {
                return;
            };
            debug!("striker: power budget evicting channel {}", index);
            let ch = &mut self.channels[index];
            ch.out.set_duty_percent(0);
            ch.strike = Strike::IDLE;
        }
    }
}

/// Reasons a [`ChimeBank`] refuses its configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BankError {
    /// A calibration entry failed validation.
    Calibration {
        /// Channel whose entry is invalid.
        channel: u8,
        /// What was wrong with it.
        kind: CalibrationError,
    },
    /// The wiring table points at a channel index that does not exist.
    WiringOutOfRange {
        /// The offending channel index.
        channel: u8,
    },
}


#[cfg(test)]
mod tests {
    use super::testing::{at, bank, bank_with_budget, FakeCoil};
    use super::*;

    #[test]
    fn strike_energizes_and_expires() {
        let mut bank = bank();
        bank.strike_note(4, 127, at(0));

        assert_eq!(Some(StrikePhase::Kicking), bank.phase(4));
        assert_eq!(Some(100), bank.duty(4), "full velocity should use max duty");

        // max duty pairs with the shortest hold (18 ms with the default calibration)
        bank.tick(at(17));
        assert_eq!(Some(StrikePhase::Kicking), bank.phase(4));
        bank.tick(at(18));
        assert_eq!(Some(StrikePhase::Idle), bank.phase(4));
        assert_eq!(Some(0), bank.duty(4));
    }

    #[test]
    fn restriking_restarts_rather_than_stacks() {
        let mut bank = bank();
        bank.strike_note(4, 127, at(0));
        bank.strike_note(4, 127, at(10));

        assert_eq!(1, bank.active_count());
        bank.tick(at(18));
        assert_eq!(
            Some(StrikePhase::Kicking),
            bank.phase(4),
            "restart at t=10 should hold past the original expiry"
        );
        bank.tick(at(28));
        assert_eq!(Some(StrikePhase::Idle), bank.phase(4));
    }

    #[test]
    fn admission_never_exceeds_the_budget() {
        let mut bank = bank_with_budget(6);
        for note in 0..10 {
            bank.strike_note(note, 127, at(note as u64));
            assert!(bank.active_count() <= 6);
        }
        assert_eq!(6, bank.active_count());
    }

    #[test]
    fn admission_evicts_the_oldest_strike() {
        let mut bank = bank_with_budget(2);
        bank.strike_note(0, 127, at(0));
        bank.strike_note(1, 127, at(5));
        bank.strike_note(2, 127, at(10));

        assert_eq!(Some(StrikePhase::Idle), bank.phase(0), "oldest evicted");
        assert_eq!(Some(StrikePhase::Kicking), bank.phase(1));
        assert_eq!(Some(StrikePhase::Kicking), bank.phase(2));
        assert_eq!(Some(0), bank.duty(0), "eviction releases the coil");
    }

    #[test]
    fn eviction_ties_break_toward_the_lowest_channel() {
        let mut bank = bank_with_budget(2);
        bank.strike_note(7, 127, at(0));
        bank.strike_note(3, 127, at(0));
        bank.strike_note(9, 127, at(1));

        assert_eq!(
            Some(StrikePhase::Idle),
            bank.phase(3),
            "equal timestamps should evict the lower channel index"
        );
        assert_eq!(Some(StrikePhase::Kicking), bank.phase(7));
    }

    #[test]
    fn restrike_of_a_kicking_channel_skips_admission() {
        let mut bank = bank_with_budget(2);
        bank.strike_note(0, 127, at(0));
        bank.strike_note(1, 127, at(1));
        bank.strike_note(1, 127, at(2));

        assert_eq!(Some(StrikePhase::Kicking), bank.phase(0), "no eviction needed");
        assert_eq!(2, bank.active_count());
    }

    #[test]
    fn all_off_clears_everything() {
        let mut bank = bank();
        for note in 0..6 {
            bank.strike_note(note, 100, at(0));
        }
        bank.all_off();
        assert_eq!(0, bank.active_count());
    }

    #[test]
    fn out_of_range_notes_and_channels_are_dropped() {
        let mut bank = bank();
        bank.strike_note(21, 127, at(0));
        bank.strike_raw(99, 100, Duration::from_millis(10), at(0));
        assert_eq!(0, bank.active_count());
    }

    #[test]
    fn raw_duty_is_clamped() {
        let mut bank = bank();
        bank.strike_raw(0, 250, Duration::from_millis(10), at(0));
        assert_eq!(Some(100), bank.duty(0));
    }

    #[test]
    fn zero_min_duty_is_rejected_at_construction() {
        let mut calibrations = DEFAULT_CALIBRATIONS;
        calibrations[3] = Calibration::new(0, 100, 10, 90);
        let result = ChimeBank::new(
            core::array::from_fn(|_| FakeCoil::default()),
            calibrations,
            DEFAULT_NOTE_TO_CHANNEL,
            DEFAULT_POWER_BUDGET,
        );
        assert_eq!(
            Some(BankError::Calibration {
                channel: 3,
                kind: CalibrationError::ZeroMinimumDuty
            }),
            result.err(),
            "Expected left but got right"
        );
    }

    #[test]
    fn bad_wiring_is_rejected_at_construction() {
        let mut wiring = DEFAULT_NOTE_TO_CHANNEL;
        wiring[20] = 21;
        let result = ChimeBank::new(
            core::array::from_fn(|_| FakeCoil::default()),
            DEFAULT_CALIBRATIONS,
            wiring,
            DEFAULT_POWER_BUDGET,
        );
        assert!(matches!(
            result.err(),
            Some(BankError::WiringOutOfRange { channel: 21 })
        ));
    }
}
