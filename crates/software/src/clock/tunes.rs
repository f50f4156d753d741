//! Pre-composed chime melodies for the quarter hours.
//!
//! Four traditional change-ringing tunes plus a single-bell test pattern. Every table is
//! expressed at [`TICKS_PER_QUARTER`] resolution; the quarter-hour melody is the first phrase,
//! each later quarter appends one more phrase, and the hour plays all four.

use crate::sequencer::MidiEvent;
use num_derive::{FromPrimitive, ToPrimitive};

/// Tick resolution of every built-in tune table.
pub const TICKS_PER_QUARTER: u16 = 480;

const QUARTER_NOTE: u32 = 480;
const HALF_NOTE: u32 = 960;

// MIDI pitches of the bells the tunes ring
const C5: u8 = 72;
const F5: u8 = 77;
const G5: u8 = 79;
const A5: u8 = 81;
const B5: u8 = 83;
const C6: u8 = 84;
const D6: u8 = 86;
const DS6: u8 = 87;
const E6: u8 = 88;

/// The selectable tunes. The discriminants are the wire/settings encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tune {
    /// No melody; hour strikes may still be configured.
    Disabled = 0,
    /// The Westminster quarters, as rung by Big Ben.
    Westminster = 1,
    /// The Whittington chimes.
    Whittington = 2,
    /// St. Michael's chimes.
    StMichael = 3,
    /// The Winchester chimes.
    Winchester = 4,
    /// Westminster rhythm on a single bell, for hardware bring-up.
    Test = 5,
}

impl Tune {
    /// Human-readable tune name for the control surface.
    pub fn name(self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::Westminster => "Westminster",
            Self::Whittington => "Whittington",
            Self::StMichael => "St. Michael's",
            Self::Winchester => "Winchester",
            Self::Test => "Test Tune",
        }
    }
}

/// Which quarter-hour melody to ring. The discriminants are the wire/settings encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Quarter {
    /// First quarter (xx:15).
    Quarter = 1,
    /// Half hour (xx:30).
    Half = 2,
    /// Third quarter (xx:45).
    ThreeQuarter = 3,
    /// Top of the hour (xx:00).
    Hour = 4,
}

const fn on(delta: u32, note: u8) -> MidiEvent {
    MidiEvent::new(delta, 0x90, note, 127)
}

const fn off(delta: u32, note: u8) -> MidiEvent {
    MidiEvent::new(delta, 0x80, note, 0)
}

/// One four-bell phrase: three quarter notes and a held final bell. `rest` is the gap before
/// the phrase (zero for the first phrase of a melody, a quarter note between phrases).
const fn phrase(rest: u32, a: u8, b: u8, c: u8, d: u8) -> [MidiEvent; 8] {
    [
        on(rest, a),
        off(QUARTER_NOTE, a),
        on(0, b),
        off(QUARTER_NOTE, b),
        on(0, c),
        off(QUARTER_NOTE, c),
        on(0, d),
        off(HALF_NOTE, d),
    ]
}

/// Concatenates phrases into one melody table. `OUT` must equal `phrases.len() * 8`.
const fn rounds<const OUT: usize>(phrases: &[[MidiEvent; 8]]) -> [MidiEvent; OUT] {
    let mut out = [MidiEvent::new(0, 0, 0, 0); OUT];
    let mut i = 0;
    while i < phrases.len() {
        let mut j = 0;
        while j < 8 {
            out[i * 8 + j] = phrases[i][j];
            j += 1;
        }
        i += 1;
    }
    out
}

const WESTMINSTER: [[MidiEvent; 8]; 4] = [
    phrase(0, A5, F5, G5, C5),
    phrase(QUARTER_NOTE, C5, G5, A5, F5),
    phrase(QUARTER_NOTE, A5, G5, F5, C5),
    phrase(QUARTER_NOTE, C5, G5, A5, F5),
];

const WHITTINGTON: [[MidiEvent; 8]; 4] = [
    phrase(0, C6, D6, DS6, C6),
    phrase(QUARTER_NOTE, DS6, E6, G5, C6),
    phrase(QUARTER_NOTE, DS6, D6, C6, G5),
    phrase(QUARTER_NOTE, G5, C6, D6, DS6),
];

const ST_MICHAEL: [[MidiEvent; 8]; 4] = [
    phrase(0, G5, DS6, D6, C6),
    phrase(QUARTER_NOTE, C6, D6, DS6, G5),
    phrase(QUARTER_NOTE, DS6, C6, D6, G5),
    phrase(QUARTER_NOTE, G5, C6, DS6, C6),
];

const WINCHESTER: [[MidiEvent; 8]; 4] = [
    phrase(0, C6, DS6, G5, C6),
    phrase(QUARTER_NOTE, D6, E6, A5, D6),
    phrase(QUARTER_NOTE, DS6, G5, B5, DS6),
    phrase(QUARTER_NOTE, C6, DS6, G5, C6),
];

static WESTMINSTER_QUARTER: [MidiEvent; 8] = rounds(&[WESTMINSTER[0]]);
static WESTMINSTER_HALF: [MidiEvent; 16] = rounds(&[WESTMINSTER[0], WESTMINSTER[1]]);
static WESTMINSTER_THREE_QUARTER: [MidiEvent; 24] =
    rounds(&[WESTMINSTER[0], WESTMINSTER[1], WESTMINSTER[2]]);
static WESTMINSTER_HOUR: [MidiEvent; 32] = rounds(&WESTMINSTER);

static WHITTINGTON_QUARTER: [MidiEvent; 8] = rounds(&[WHITTINGTON[0]]);
static WHITTINGTON_HALF: [MidiEvent; 16] = rounds(&[WHITTINGTON[0], WHITTINGTON[1]]);
static WHITTINGTON_THREE_QUARTER: [MidiEvent; 24] =
    rounds(&[WHITTINGTON[0], WHITTINGTON[1], WHITTINGTON[2]]);
static WHITTINGTON_HOUR: [MidiEvent; 32] = rounds(&WHITTINGTON);

static ST_MICHAEL_QUARTER: [MidiEvent; 8] = rounds(&[ST_MICHAEL[0]]);
static ST_MICHAEL_HALF: [MidiEvent; 16] = rounds(&[ST_MICHAEL[0], ST_MICHAEL[1]]);
static ST_MICHAEL_THREE_QUARTER: [MidiEvent; 24] =
    rounds(&[ST_MICHAEL[0], ST_MICHAEL[1], ST_MICHAEL[2]]);
static ST_MICHAEL_HOUR: [MidiEvent; 32] = rounds(&ST_MICHAEL);

static WINCHESTER_QUARTER: [MidiEvent; 8] = rounds(&[WINCHESTER[0]]);
static WINCHESTER_HALF: [MidiEvent; 16] = rounds(&[WINCHESTER[0], WINCHESTER[1]]);
static WINCHESTER_THREE_QUARTER: [MidiEvent; 24] =
    rounds(&[WINCHESTER[0], WINCHESTER[1], WINCHESTER[2]]);
static WINCHESTER_HOUR: [MidiEvent; 32] = rounds(&WINCHESTER);

// Westminster rhythm on one bell: one hit per phrase, the last held a half note.
static TEST_QUARTER: [MidiEvent; 2] = [on(0, E6), off(HALF_NOTE, E6)];
static TEST_HALF: [MidiEvent; 4] = [on(0, E6), off(QUARTER_NOTE, E6), on(0, E6), off(HALF_NOTE, E6)];
static TEST_THREE_QUARTER: [MidiEvent; 6] = [
    on(0, E6),
    off(QUARTER_NOTE, E6),
    on(0, E6),
    off(QUARTER_NOTE, E6),
    on(0, E6),
    off(HALF_NOTE, E6),
];
static TEST_HOUR: [MidiEvent; 8] = [
    on(0, E6),
    off(QUARTER_NOTE, E6),
    on(0, E6),
    off(QUARTER_NOTE, E6),
    on(0, E6),
    off(QUARTER_NOTE, E6),
    on(0, E6),
    off(HALF_NOTE, E6),
];

/// Looks up the melody for a tune and quarter. `None` when the tune is disabled.
pub fn sequence(tune: Tune, quarter: Quarter) -> Option<&'static [MidiEvent]> {
    let melody: &'static [MidiEvent] = match (tune, quarter) {
        (Tune::Disabled, _) => return None,
        (Tune::Westminster, Quarter::Quarter) => &WESTMINSTER_QUARTER,
        (Tune::Westminster, Quarter::Half) => &WESTMINSTER_HALF,
        (Tune::Westminster, Quarter::ThreeQuarter) => &WESTMINSTER_THREE_QUARTER,
        (Tune::Westminster, Quarter::Hour) => &WESTMINSTER_HOUR,
        (Tune::Whittington, Quarter::Quarter) => &WHITTINGTON_QUARTER,
        (Tune::Whittington, Quarter::Half) => &WHITTINGTON_HALF,
        (Tune::Whittington, Quarter::ThreeQuarter) => &WHITTINGTON_THREE_QUARTER,
        (Tune::Whittington, Quarter::Hour) => &WHITTINGTON_HOUR,
        (Tune::StMichael, Quarter::Quarter) => &ST_MICHAEL_QUARTER,
        (Tune::StMichael, Quarter::Half) => &ST_MICHAEL_HALF,
        (Tune::StMichael, Quarter::ThreeQuarter) => &ST_MICHAEL_THREE_QUARTER,
        (Tune::StMichael, Quarter::Hour) => &ST_MICHAEL_HOUR,
        (Tune::Winchester, Quarter::Quarter) => &WINCHESTER_QUARTER,
        (Tune::Winchester, Quarter::Half) => &WINCHESTER_HALF,
        (Tune::Winchester, Quarter::ThreeQuarter) => &WINCHESTER_THREE_QUARTER,
        (Tune::Winchester, Quarter::Hour) => &WINCHESTER_HOUR,
        (Tune::Test, Quarter::Quarter) => &TEST_QUARTER,
        (Tune::Test, Quarter::Half) => &TEST_HALF,
        (Tune::Test, Quarter::ThreeQuarter) => &TEST_THREE_QUARTER,
        (Tune::Test, Quarter::Hour) => &TEST_HOUR,
    };
    Some(melody)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn each_quarter_adds_a_phrase() {
        assert_eq!(8, sequence(Tune::Westminster, Quarter::Quarter).unwrap().len());
        assert_eq!(16, sequence(Tune::Westminster, Quarter::Half).unwrap().len());
        assert_eq!(
            24,
            sequence(Tune::Westminster, Quarter::ThreeQuarter).unwrap().len()
        );
        assert_eq!(32, sequence(Tune::Westminster, Quarter::Hour).unwrap().len());
    }

    #[test]
    fn disabled_tune_has_no_melody() {
        assert!(sequence(Tune::Disabled, Quarter::Hour).is_none());
    }

    #[test]
    fn melodies_are_balanced_note_pairs() {
        for tune in [Tune::Westminster, Tune::Whittington, Tune::StMichael, Tune::Winchester, Tune::Test] {
            for quarter in [Quarter::Quarter, Quarter::Half, Quarter::ThreeQuarter, Quarter::Hour] {
                let melody = sequence(tune, quarter).unwrap();
                let ons = melody.iter().filter(|e| e.status == 0x90).count();
                let offs = melody.iter().filter(|e| e.status == 0x80).count();
                assert_eq!(ons, offs, "{tune:?} {quarter:?} must release every bell");
                assert!(melody.iter().all(|e| e.status != 0));
            }
        }
    }

    #[test]
    fn westminster_opens_with_its_signature_bells() {
        let melody = sequence(Tune::Westminster, Quarter::Quarter).unwrap();
        let bells: [u8; 4] = [melody[0].data1, melody[2].data1, melody[4].data1, melody[6].data1];
        assert_eq!([A5, F5, G5, C5], bells);
    }

    #[test]
    fn settings_bytes_decode_to_tunes() {
        assert_eq!(Some(Tune::Westminster), Tune::from_u8(1));
        assert_eq!(Some(Tune::Test), Tune::from_u8(5));
        assert_eq!(None, Tune::from_u8(6));
        assert_eq!(Some(Quarter::Hour), Quarter::from_u8(4));
        assert_eq!(None, Quarter::from_u8(0));
    }
}
