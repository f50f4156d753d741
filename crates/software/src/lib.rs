//! This crate contains the architecture-agnostic core of the Carillon controller, firmware for a
//! 21-striker electromechanical chime instrument. Concurrent note sources — a wired serial
//! [MIDI](https://midi.org/midi-1-0) byte stream, the batched MUDP-v1 datagram protocol, a
//! tick-scheduled [`sequencer`], a periodic note [`repeater`], and a tower-clock chime
//! scheduler — all funnel through one dispatch path into the actuation layer, which converts note
//! velocities into calibrated strike pulses while keeping the number of simultaneously energized
//! coils inside a shared power budget.
//!
//! Everything here is hardware-independent: physical outputs enter through the
//! [`DutyOutput`][striker::DutyOutput] trait and time enters as explicit
//! [`Instant`][embassy_time::Instant] parameters, so the whole instrument can be driven (and
//! tested) without a board attached.

#![deny(missing_docs)]
#![no_std]

#[macro_use]
mod fmt;

pub mod clock;
pub mod datagram;
pub mod dispatch;
pub mod engine;
pub mod repeater;
pub mod sequencer;
pub mod serial_midi;
pub mod striker;
