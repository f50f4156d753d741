//! Minimal Standard-MIDI-File subset loader.
//!
//! Exactly enough of the container to play uploaded single-melody files on the instrument:
//! format 0 or 1, metrical (non-SMPTE) division, first track only. Meta and sysex events are
//! skipped by their declared length, never interpreted; running status inside the track is
//! honored; only Note On/Off events survive into the staging buffer, with the deltas of
//! skipped events folded into the next retained one so rests keep their length.

use super::{MidiEvent, MAX_EVENTS};
use tinyvec::ArrayVec;

/// Reasons a file is rejected. The sequencer is left untouched on any of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SmfError {
    /// Shorter than a header chunk.
    TooShort,
    /// Missing the `MThd` tag or its fixed six-byte payload.
    BadHeader,
    /// Multi-track formats other than 0/1 are not supported.
    UnsupportedFormat(u16),
    /// SMPTE time divisions are not supported.
    SmpteDivision,
    /// No `MTrk` chunk found.
    MissingTrack,
    /// A chunk length points past the end of the file.
    TruncatedChunk,
    /// The track data ends inside an event.
    TruncatedEvent,
    /// A data byte arrived with no status in effect.
    MissingStatus,
    /// A delta or length field ran past the four-byte variable-length limit.
    VlqTooLong,
    /// A system byte that the subset cannot skip (not meta, not sysex).
    UnexpectedByte(u8),
}

/// A parsed first track, ready for [`Sequencer::load`][super::Sequencer::load].
pub struct SmfTrack {
    /// The retained Note On/Off events.
    pub events: ArrayVec<[MidiEvent; MAX_EVENTS]>,
    /// Tick resolution from the header's division field.
    pub ticks_per_quarter: u16,
}

const HEADER_LEN: usize = 14;

/// Parses the header chunk and the first track of `data`.
pub fn parse(data: &[u8]) -> Result<SmfTrack, SmfError> {
    if data.len() < HEADER_LEN {
        return Err(SmfError::TooShort);
    }
    if &data[..4] != b"MThd" || read_u32(data, 4)? != 6 {
        return Err(SmfError::BadHeader);
    }
    let format = read_u16(data, 8)?;
    if format > 1 {
        return Err(SmfError::UnsupportedFormat(format));
    }
    if read_u16(data, 10)? == 0 {
        return Err(SmfError::MissingTrack);
    }
    let division = read_u16(data, 12)?;
    if division & 0x8000 != 0 {
        return Err(SmfError::SmpteDivision);
    }
    if division == 0 {
        return Err(SmfError::BadHeader);
    }

    // walk the chunks; anything before the first MTrk is skipped by length
    let mut offset = HEADER_LEN;
    loop {
        if data.len() < offset + 8 {
            return Err(SmfError::MissingTrack);
        }
        let tag = &data[offset..offset + 4];
        let length = read_u32(data, offset + 4)? as usize;
        let body = offset + 8;
        if data.len() < body + length {
            return Err(SmfError::TruncatedChunk);
        }
        if tag == b"MTrk" {
            let events = parse_track(&data[body..body + length])?;
            return Ok(SmfTrack {
                events,
                ticks_per_quarter: division,
            });
        }
        offset = body + length;
    }
}

/// Extracts Note On/Off events from one track chunk.
fn parse_track(track: &[u8]) -> Result<ArrayVec<[MidiEvent; MAX_EVENTS]>, SmfError> {
    let mut events = ArrayVec::new();
    let mut cursor = 0;
    let mut running_status: Option<u8> = None;
    // deltas of skipped events accumulate into the next retained one
    let mut pending_delta: u32 = 0;
    let mut dropped = 0u32;

    while cursor < track.len() {
        pending_delta = pending_delta.saturating_add(read_vlq(track, &mut cursor)?);
        let lead = *track.get(cursor).ok_or(SmfError::TruncatedEvent)?;

        match lead {
            0xFF => {
                cursor += 1;
                let kind = *track.get(cursor).ok_or(SmfError::TruncatedEvent)?;
                cursor += 1;
                let length = read_vlq(track, &mut cursor)? as usize;
                skip(track, &mut cursor, length)?;
                if kind == 0x2F {
                    break; // end of track
                }
            }
            0xF0 | 0xF7 => {
                cursor += 1;
                let length = read_vlq(track, &mut cursor)? as usize;
                skip(track, &mut cursor, length)?;
            }
            0xF1..=0xF6 | 0xF8..=0xFE => return Err(SmfError::UnexpectedByte(lead)),
            _ => {
                let status = if lead & 0x80 != 0 {
                    cursor += 1;
                    running_status = Some(lead);
                    lead
                } else {
                    running_status.ok_or(SmfError::MissingStatus)?
                };

                let data1 = *track.get(cursor).ok_or(SmfError::TruncatedEvent)?;
                cursor += 1;
                let data2 = if matches!(status & 0xF0, 0xC0 | 0xD0) {
                    0
                } else {
                    let byte = *track.get(cursor).ok_or(SmfError::TruncatedEvent)?;
                    cursor += 1;
                    byte
                };

                if matches!(status & 0xF0, 0x80 | 0x90) {
                    if events.len() < MAX_EVENTS {
                        events.push(MidiEvent::new(pending_delta, status, data1, data2));
                        pending_delta = 0;
                    } else {
                        dropped += 1;
                    }
                }
            }
        }
    }

    if dropped > 0 {
        warn!("smf: staging buffer full, dropped {} note events", dropped);
    }
    Ok(events)
}

/// Standard big-endian 7-bit variable-length quantity, at most four bytes.
fn read_vlq(data: &[u8], cursor: &mut usize) -> Result<u32, SmfError> {
    let mut value: u32 = 0;
    for i in 0.. {
        let byte = *data.get(*cursor).ok_or(SmfError::TruncatedEvent)?;
        *cursor += 1;
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        if i == 3 {
            return Err(SmfError::VlqTooLong);
        }
    }
    unreachable!()
}

fn skip(data: &[u8], cursor: &mut usize, length: usize) -> Result<(), SmfError> {
    if data.len() < *cursor + length {
        return Err(SmfError::TruncatedEvent);
    }
    *cursor += length;
    Ok(())
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, SmfError> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(SmfError::TooShort)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, SmfError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(SmfError::TooShort)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
