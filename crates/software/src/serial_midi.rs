//! Byte-stream parser for the wired (DIN/UART) MIDI input.
//!
//! Implements running status: after the last data byte of a message the parser re-arms at the
//! first data-byte state of the same message family, so a stream of notes never has to repeat
//! the status byte. System bytes reset the parser outright, and a silence of
//! [`RESYNC_TIMEOUT`] bounds how long a corrupted partial message can linger.

use embassy_time::{Duration, Instant};

/// Silence after which the parser resynchronizes to idle.
pub const RESYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// The seven channel-message families, i.e. the high status nibbles `0x8`–`0xE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Family {
    NoteOff,
    NoteOn,
    PolyPressure,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
}

impl Family {
    fn from_status(byte: u8) -> Option<Self> {
        match byte >> 4 {
            0x8 => Some(Self::NoteOff),
            0x9 => Some(Self::NoteOn),
            0xA => Some(Self::PolyPressure),
            0xB => Some(Self::ControlChange),
            0xC => Some(Self::ProgramChange),
            0xD => Some(Self::ChannelPressure),
            0xE => Some(Self::PitchBend),
            _ => None,
        }
    }

    fn status_nibble(self) -> u8 {
        match self {
            Self::NoteOff => 0x80,
            Self::NoteOn => 0x90,
            Self::PolyPressure => 0xA0,
            Self::ControlChange => 0xB0,
            Self::ProgramChange => 0xC0,
            Self::ChannelPressure => 0xD0,
            Self::PitchBend => 0xE0,
        }
    }

    /// Program Change and Channel Pressure carry one data byte, the rest carry two.
    fn two_data_bytes(self) -> bool {
        !matches!(self, Self::ProgramChange | Self::ChannelPressure)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitFirst(Family),
    AwaitSecond(Family),
}

/// The serial receiver's parser state machine. Feed it bytes as they arrive; completed
/// messages come back as `(status, data1, data2)` triples ready for dispatch.
pub struct SerialMidiParser {
    state: State,
    channel: u8,
    data1: u8,
    last_byte_at: Instant,
}

impl Default for SerialMidiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialMidiParser {
    /// Constructs an idle parser.
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            channel: 0,
            data1: 0,
            last_byte_at: Instant::from_ticks(0),
        }
    }

    /// Drops any partial message and returns to idle.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.data1 = 0;
    }

    /// Consumes one byte from the wire. Returns a completed message, if this byte finished one.
    ///
    /// `now` is the arrival time of the byte; a gap longer than [`RESYNC_TIMEOUT`] since the
    /// previous byte resets the parser before this byte is interpreted.
    pub fn feed(&mut self, byte: u8, now: Instant) -> Option<(u8, u8, u8)> {
        if now.duration_since(self.last_byte_at) > RESYNC_TIMEOUT {
            self.reset();
        }
        self.last_byte_at = now;

        if byte & 0x80 != 0 {
            // no system-message or system-running-status handling: 0xF0-0xFF resets outright
            let Some(family) = Family::from_status(byte) else {
                self.reset();
                return None;
            };
            self.channel = byte & 0x0F;
            self.state = State::AwaitFirst(family);
            return None;
        }

        match self.state {
            // data byte with no status in effect: ignore
            State::Idle => None,
            State::AwaitFirst(family) => {
                if family.two_data_bytes() {
                    self.data1 = byte;
                    self.state = State::AwaitSecond(family);
                    None
                } else {
                    // single-data families complete here and stay armed for running status
                    Some((family.status_nibble() | self.channel, byte, 0))
                }
            }
            State::AwaitSecond(family) => {
                self.state = State::AwaitFirst(family);
                Some((family.status_nibble() | self.channel, self.data1, byte))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    /// Feeds a byte sequence at one-millisecond spacing and collects completed messages.
    fn feed_all(parser: &mut SerialMidiParser, bytes: &[u8], start_ms: u64) -> [Option<(u8, u8, u8)>; 16] {
        let mut out = [None; 16];
        let mut produced = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            if let Some(message) = parser.feed(byte, at(start_ms + i as u64)) {
                out[produced] = Some(message);
                produced += 1;
            }
        }
        out
    }

    #[test]
    fn parses_a_plain_note_on() {
        let mut parser = SerialMidiParser::new();
        let messages = feed_all(&mut parser, &[0x92, 69, 100], 0);
        assert_eq!(Some((0x92, 69, 100)), messages[0], "Expected left but got right");
        assert_eq!(None, messages[1]);
    }

    #[test]
    fn running_status_reuses_the_status_byte() {
        let mut parser = SerialMidiParser::new();
        let messages = feed_all(&mut parser, &[0x90, 60, 100, 62, 101, 64, 102], 0);
        assert_eq!(Some((0x90, 60, 100)), messages[0]);
        assert_eq!(Some((0x90, 62, 101)), messages[1]);
        assert_eq!(Some((0x90, 64, 102)), messages[2]);
        assert_eq!(None, messages[3]);
    }

    #[test]
    fn single_data_families_run_on_too() {
        let mut parser = SerialMidiParser::new();
        let messages = feed_all(&mut parser, &[0xC3, 5, 6], 0);
        assert_eq!(Some((0xC3, 5, 0)), messages[0]);
        assert_eq!(Some((0xC3, 6, 0)), messages[1]);
    }

    #[test]
    fn pitch_bend_carries_two_data_bytes() {
        let mut parser = SerialMidiParser::new();
        let messages = feed_all(&mut parser, &[0xE0, 0x00, 0x40], 0);
        assert_eq!(Some((0xE0, 0x00, 0x40)), messages[0]);
    }

    #[test]
    fn system_bytes_reset_mid_message() {
        let mut parser = SerialMidiParser::new();
        let messages = feed_all(&mut parser, &[0x90, 60, 0xF8, 100], 0);
        assert_eq!(
            None, messages[0],
            "the data byte after the reset should not complete anything"
        );
    }

    #[test]
    fn data_bytes_without_status_are_ignored() {
        let mut parser = SerialMidiParser::new();
        let messages = feed_all(&mut parser, &[60, 100, 42], 0);
        assert_eq!(None, messages[0]);
    }

    #[test]
    fn silence_resynchronizes_the_parser() {
        let mut parser = SerialMidiParser::new();
        assert_eq!(None, parser.feed(0x90, at(0)));
        assert_eq!(None, parser.feed(60, at(1)));
        // 150 ms of line silence: the half-received note must not complete
        assert_eq!(None, parser.feed(100, at(151)));
        // a fresh, fully-formed message parses normally afterwards
        assert_eq!(None, parser.feed(0x90, at(152)));
        assert_eq!(None, parser.feed(61, at(153)));
        assert_eq!(Some((0x90, 61, 99)), parser.feed(99, at(154)));
    }

    #[test]
    fn status_byte_interrupting_a_message_wins() {
        let mut parser = SerialMidiParser::new();
        let messages = feed_all(&mut parser, &[0x90, 60, 0x80, 60, 0], 0);
        assert_eq!(
            Some((0x80, 60, 0)),
            messages[0],
            "the new status byte should discard the partial note on"
        );
    }
}
