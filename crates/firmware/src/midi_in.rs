//! Inbound MIDI transports: the DIN serial input and the datagram hand-off.
//!
//! Both transports are producers only. Parsing and dispatch happen in the engine task, which
//! is the sole owner of core state — the channels here are the single-consumer command path
//! that keeps every entry point serialized.

use carillon_lib::datagram::MAX_DATAGRAM_LEN;
use defmt::{info, warn};
use embassy_stm32::usart::RingBufferedUartRx;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Timer;

/// MIDI wire speed, fixed by the MIDI 1.0 electrical spec.
pub const MIDI_BAUD: u32 = 31_250;

/// Raw bytes from the serial MIDI input, drained by the engine task.
pub static MIDI_BYTES: Channel<CriticalSectionRawMutex, u8, 64> = Channel::new();

/// One MUDP datagram, length-delimited.
pub struct DatagramFrame {
    /// Valid bytes in `bytes`.
    pub len: usize,
    /// The frame payload; anything past `len` is garbage.
    pub bytes: [u8; MAX_DATAGRAM_LEN],
}

/// Datagrams handed over by the network service (which owns sockets, Wi-Fi/Ethernet bring-up
/// and the rest of the transport plumbing), drained by the engine task.
pub static DATAGRAMS: Channel<CriticalSectionRawMutex, DatagramFrame, 2> = Channel::new();

/// Pumps the MIDI UART into [`MIDI_BYTES`].
#[embassy_executor::task]
pub async fn midi_uart_task(mut rx: RingBufferedUartRx<'static>) -> ! {
    info!("midi: listening at {} baud", MIDI_BAUD);
    let mut buf = [0u8; 32];
    loop {
        match rx.read(&mut buf).await {
            Ok(n) => {
                for &byte in &buf[..n] {
                    MIDI_BYTES.send(byte).await;
                }
            }
            Err(e) => {
                // overrun or framing noise; let the line settle and resynchronize
                warn!("midi: uart error {}", e);
                Timer::after_millis(10).await;
            }
        }
    }
}
