//! Routes decoded MIDI messages onto the actuation layer.
//!
//! This is the single funnel every note source converges on: the serial and datagram receivers,
//! the sequencer, and (indirectly) the clock scheduler all end up calling
//! [`handle_message`]. Dispatch is stateless; it translates, clamps, and forwards.

use crate::striker::{ChimeBank, DutyOutput, CHANNEL_COUNT};
use embassy_time::Instant;
use wmidi::{ControlFunction, MidiMessage, Note};

/// The MIDI note that sounds device note [`DEVICE_REFERENCE_NOTE`]: concert A, 440 Hz.
pub const MIDI_REFERENCE_NOTE: Note = Note::A4;

/// The device note tuned to [`MIDI_REFERENCE_NOTE`]. Device notes run 0 to 20 in ascending
/// musical order; the wiring table in the actuation layer maps them onto physical channels.
pub const DEVICE_REFERENCE_NOTE: u8 = 1;

/// Translates a MIDI note into a device note by its fixed offset from the reference pitch.
/// Returns `None` for notes the instrument cannot sound.
///
/// This is the tuning half of the two-stage translation; the wiring half
/// (device note → channel) belongs to the bank and is revised independently.
pub fn device_note(note: Note) -> Option<u8> {
    let offset = note as i16 - MIDI_REFERENCE_NOTE as i16;
    let device = DEVICE_REFERENCE_NOTE as i16 + offset;
    (0..CHANNEL_COUNT as i16)
        .contains(&device)
        .then_some(device as u8)
}

/// Dispatches one channel message onto the bank.
///
/// Note On with velocity 0 is treated as Note Off, per MIDI convention. Controller 123
/// ("All Notes Off") releases everything. Every other message type is accepted as a no-op so
/// that future features can claim them without today's senders being rejected.
pub fn handle_message<O: DutyOutput>(
    bank: &mut ChimeBank<O>,
    status: u8,
    data1: u8,
    data2: u8,
    now: Instant,
) {
    let bytes = [status, data1, data2];
    let Ok(message) = MidiMessage::from_bytes(&bytes) else {
        return;
    };

    match message {
        MidiMessage::NoteOn(_channel, note, velocity) => {
            let velocity = u8::from(velocity);
            let Some(device) = device_note(note) else {
                debug!("dispatch: note {} out of range", note as u8);
                return;
            };
            if velocity == 0 {
                bank.release_note(device);
            } else {
                bank.strike_note(device, velocity, now);
            }
        }
        MidiMessage::NoteOff(_channel, note, _velocity) => {
            if let Some(device) = device_note(note) {
                bank.release_note(device);
            }
        }
        MidiMessage::ControlChange(_channel, function, _value)
            if function == ControlFunction::ALL_NOTES_OFF =>
        {
            info!("dispatch: all notes off");
            bank.all_off();
        }
        // aftertouch, other controllers, program change, pitch bend: accepted, no effect
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::striker::testing::{at, bank};
    use crate::striker::StrikePhase;

    fn note(number: u8) -> Note {
        Note::from(wmidi::U7::from_u8_lossy(number))
    }

    #[test]
    fn reference_pitch_lands_on_device_note_one() {
        assert_eq!(Some(1), device_note(Note::A4));
        assert_eq!(Some(0), device_note(note(68)));
        assert_eq!(Some(20), device_note(note(88)));
    }

    #[test]
    fn out_of_range_notes_translate_to_none() {
        assert_eq!(None, device_note(note(67)));
        assert_eq!(None, device_note(note(89)));
        assert_eq!(None, device_note(Note::C0));
    }

    #[test]
    fn note_on_strikes_the_translated_channel() {
        let mut bank = bank();
        handle_message(&mut bank, 0x90, 69, 100, at(0));
        assert_eq!(Some(StrikePhase::Kicking), bank.phase(1));
    }

    #[test]
    fn note_on_with_zero_velocity_is_a_note_off() {
        let mut bank = bank();
        handle_message(&mut bank, 0x90, 69, 0, at(0));
        assert_eq!(0, bank.active_count());
    }

    #[test]
    fn unplayable_notes_are_silently_dropped() {
        let mut bank = bank();
        handle_message(&mut bank, 0x90, 30, 100, at(0));
        handle_message(&mut bank, 0x90, 120, 100, at(0));
        assert_eq!(0, bank.active_count());
    }

    #[test]
    fn all_notes_off_controller_clears_the_bank() {
        let mut bank = bank();
        handle_message(&mut bank, 0x90, 69, 100, at(0));
        handle_message(&mut bank, 0x90, 72, 100, at(0));
        handle_message(&mut bank, 0xB0, 123, 0, at(0));
        assert_eq!(0, bank.active_count());
    }

    #[test]
    fn unhandled_message_types_are_accepted_no_ops() {
        let mut bank = bank();
        handle_message(&mut bank, 0xA0, 69, 40, at(0)); // poly pressure
        handle_message(&mut bank, 0xB0, 7, 100, at(0)); // other controller
        handle_message(&mut bank, 0xC0, 5, 0, at(0)); // program change
        handle_message(&mut bank, 0xE0, 0, 64, at(0)); // pitch bend
        assert_eq!(0, bank.active_count());
    }
}
