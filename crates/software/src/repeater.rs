//! Periodic note repeater: a fixed table of independently scheduled repeating strikes.
//!
//! Works in device note numbers and strikes the bank directly, bypassing the tuning
//! translation — its callers (the clock scheduler's hour strike, the control surface) already
//! speak the instrument's own note space.

use crate::striker::{ChimeBank, DutyOutput};
use embassy_time::{Duration, Instant};

/// Number of simultaneously repeating notes.
pub const REPEAT_SLOTS: usize = 20;

#[derive(Clone, Copy)]
struct RepeatSlot {
    note: u8,
    velocity: u8,
    period: Duration,
    /// Strikes left; zero means repeat forever.
    remaining: u16,
    next_strike_at: Instant,
    active: bool,
}

impl RepeatSlot {
    const FREE: Self = Self {
        note: 0,
        velocity: 0,
        period: Duration::from_ticks(0),
        remaining: 0,
        next_strike_at: Instant::from_ticks(0),
        active: false,
    };
}

/// The repeater engine: twenty slots, each an independent periodic strike schedule.
pub struct NoteRepeater {
    slots: [RepeatSlot; REPEAT_SLOTS],
}

impl Default for NoteRepeater {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteRepeater {
    /// Constructs a repeater with every slot free.
    pub fn new() -> Self {
        Self {
            slots: [RepeatSlot::FREE; REPEAT_SLOTS],
        }
    }

    /// Starts (or retunes) a repeating strike. The first hit lands on the next tick.
    ///
    /// A note that is already repeating is updated in place rather than claiming a second
    /// slot. `repeat_count` of zero repeats until stopped. Returns `false` when the table is
    /// full and the request was dropped.
    pub fn start(
        &mut self,
        note: u8,
        velocity: u8,
        period: Duration,
        repeat_count: u16,
        now: Instant,
    ) -> bool {
        let velocity = velocity.clamp(1, 127);

        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.active && slot.note == note)
        {
            slot.velocity = velocity;
            slot.period = period;
            slot.remaining = repeat_count;
            slot.next_strike_at = now;
            return true;
        }

        if let Some(slot) = self.slots.iter_mut().find(|slot| !slot.active) {
            *slot = RepeatSlot {
                note,
                velocity,
                period,
                remaining: repeat_count,
                next_strike_at: now,
                active: true,
            };
            true
        } else {
            warn!("repeater: no free slot for note {}", note);
            false
        }
    }

    /// Strikes every due slot. A repeat is a discrete hit — the strike is released
    /// synchronously, since the instrument has no sustain.
    pub fn tick<O: DutyOutput>(&mut self, now: Instant, bank: &mut ChimeBank<O>) {
        for slot in self.slots.iter_mut().filter(|slot| slot.active) {
            if now < slot.next_strike_at {
                continue;
            }
            bank.strike_note(slot.note, slot.velocity, now);
            bank.release_note(slot.note);
            slot.next_strike_at = now + slot.period;
            if slot.remaining > 0 {
                slot.remaining -= 1;
                if slot.remaining == 0 {
                    slot.active = false;
                    debug!("repeater: note {} finished", slot.note);
                }
            }
        }
    }

    /// Stops a repeating note. Returns whether it was repeating.
    pub fn stop(&mut self, note: u8) -> bool {
        match self
            .slots
            .iter_mut()
            .find(|slot| slot.active && slot.note == note)
        {
            Some(slot) => {
                slot.active = false;
                true
            }
            None => false,
        }
    }

    /// Stops every repeating note.
    pub fn stop_all(&mut self) {
        for slot in &mut self.slots {
            slot.active = false;
        }
    }

    /// Number of occupied slots.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::striker::testing::{at, bank};
    use crate::striker::StrikePhase;

    const PERIOD: Duration = Duration::from_millis(500);

    #[test]
    fn first_strike_is_immediate() {
        let mut repeater = NoteRepeater::new();
        let mut bank = bank();
        assert!(repeater.start(3, 100, PERIOD, 0, at(0)));

        repeater.tick(at(0), &mut bank);
        assert_eq!(Some(StrikePhase::Kicking), bank.phase(3));
    }

    #[test]
    fn strikes_repeat_on_the_period() {
        let mut repeater = NoteRepeater::new();
        let mut bank = bank();
        repeater.start(3, 100, PERIOD, 0, at(0));

        repeater.tick(at(0), &mut bank);
        bank.all_off();
        repeater.tick(at(499), &mut bank);
        assert_eq!(0, bank.active_count(), "not due yet");
        repeater.tick(at(500), &mut bank);
        assert_eq!(Some(StrikePhase::Kicking), bank.phase(3));
    }

    #[test]
    fn restarting_a_note_updates_its_slot_in_place() {
        let mut repeater = NoteRepeater::new();
        repeater.start(3, 100, PERIOD, 5, at(0));
        repeater.start(3, 80, Duration::from_millis(250), 2, at(1));

        assert_eq!(1, repeater.active_count(), "one slot, updated, not two");
    }

    #[test]
    fn count_runs_down_and_frees_the_slot() {
        let mut repeater = NoteRepeater::new();
        let mut bank = bank();
        repeater.start(3, 100, PERIOD, 2, at(0));

        repeater.tick(at(0), &mut bank);
        assert_eq!(1, repeater.active_count());
        repeater.tick(at(500), &mut bank);
        assert_eq!(0, repeater.active_count(), "second strike was the last");
        repeater.tick(at(1000), &mut bank);
        bank.all_off();
        repeater.tick(at(1500), &mut bank);
        assert_eq!(0, bank.active_count(), "no further strikes");
    }

    #[test]
    fn zero_count_repeats_until_stopped() {
        let mut repeater = NoteRepeater::new();
        let mut bank = bank();
        repeater.start(3, 100, PERIOD, 0, at(0));

        for i in 0..10 {
            repeater.tick(at(i * 500), &mut bank);
            assert_eq!(1, repeater.active_count());
        }
        assert!(repeater.stop(3));
        assert_eq!(0, repeater.active_count());
    }

    #[test]
    fn stop_reports_unknown_notes() {
        let mut repeater = NoteRepeater::new();
        assert!(!repeater.stop(9));
    }

    #[test]
    fn full_table_refuses_new_notes() {
        let mut repeater = NoteRepeater::new();
        for note in 0..REPEAT_SLOTS as u8 {
            assert!(repeater.start(note, 100, PERIOD, 0, at(0)));
        }
        assert!(
            !repeater.start(20, 100, PERIOD, 0, at(0)),
            "twenty-first note must be dropped"
        );
        // but an existing note can still be retuned
        assert!(repeater.start(5, 50, PERIOD, 0, at(0)));
    }

    #[test]
    fn stop_all_clears_the_table() {
        let mut repeater = NoteRepeater::new();
        for note in 0..5 {
            repeater.start(note, 100, PERIOD, 0, at(0));
        }
        repeater.stop_all();
        assert_eq!(0, repeater.active_count());
    }
}
