//! Board-specific striker hardware: the three output backends, the instrument's wiring and
//! calibration tables, and the bitstream modulator task.
//!
//! All of the hardware-specific numbers live here, where the cabling actually exists.

use carillon_lib::striker::{Calibration, DutyOutput, CHANNEL_COUNT};
use core::convert::Infallible;
use core::sync::atomic::{AtomicU8, Ordering};
use defmt::trace;
use embassy_stm32::gpio::Output;
use embassy_stm32::time::Hertz;
use embassy_time::{Duration, Ticker};
use embedded_hal::pwm::SetDutyCycle;
use measurements::Frequency;

/// A leaked hardware PWM channel, erased down to the one operation the bank needs.
pub type PwmDuty = &'static mut dyn SetDutyCycle<Error = Infallible>;

/// Striker coil switching frequency. Kept at or above 2 kHz so the coils don't whine audibly.
pub fn carrier() -> Frequency {
    Frequency::from_hertz(4_000.0)
}

/// The carrier in the HAL's unit type.
pub fn carrier_hz() -> Hertz {
    Hertz(carrier().as_hertz() as u32)
}

/// One bit of the sigma-delta stream per carrier period.
fn bit_period() -> Duration {
    Duration::from_micros((1_000_000.0 / carrier().as_hertz()) as u64)
}

/// One physical striker output. The backend is fixed at configuration time; which backend a
/// channel uses is purely a question of which peripheral its cable reached.
pub enum StrikerOut {
    /// A channel of an advanced-control timer; these are allocated in operator pairs, two
    /// strikers sharing one timer.
    AdvancedPair(PwmDuty),
    /// An independent channel of a general-purpose timer.
    TimerChannel(PwmDuty),
    /// A software sigma-delta bitstream on a plain GPIO, smoothed by the coil inductance.
    Bitstream(BitstreamDuty),
}

impl DutyOutput for StrikerOut {
    fn set_duty_percent(&mut self, percent: u8) {
        match self {
            Self::AdvancedPair(pwm) | Self::TimerChannel(pwm) => {
                let _ = pwm.set_duty_cycle_percent(percent.min(100));
            }
            Self::Bitstream(stream) => stream.set(percent),
        }
    }
}

/// Duty handle for a [`StrikerOut::Bitstream`] channel; the value is picked up by
/// [`bitstream_task`].
pub struct BitstreamDuty {
    target: &'static AtomicU8,
}

impl BitstreamDuty {
    /// Wraps the shared duty cell.
    pub fn new(target: &'static AtomicU8) -> Self {
        Self { target }
    }

    fn set(&self, percent: u8) {
        self.target.store(percent.min(100), Ordering::Relaxed);
    }
}

/// First-order sigma-delta modulator: every bit period the accumulator overflows into a high
/// bit exactly `duty` percent of the time.
#[embassy_executor::task]
pub async fn bitstream_task(mut pin: Output<'static>, target: &'static AtomicU8) -> ! {
    let mut ticker = Ticker::every(bit_period());
    let mut accumulator: u16 = 0;
    loop {
        ticker.next().await;
        accumulator += target.load(Ordering::Relaxed) as u16;
        if accumulator >= 100 {
            accumulator -= 100;
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

/// Logs the output map once at startup.
pub fn log_output_map(outputs: &[StrikerOut; CHANNEL_COUNT]) {
    for (channel, out) in outputs.iter().enumerate() {
        match out {
            StrikerOut::AdvancedPair(_) => trace!("channel {}: advanced-timer pair", channel),
            StrikerOut::TimerChannel(_) => trace!("channel {}: timer channel", channel),
            StrikerOut::Bitstream(_) => trace!("channel {}: bitstream", channel),
        }
    }
}

/// Device-note → physical-channel wiring of this instrument.
///
/// Musical order and cable order disagree on purpose: the loom was run for cable length, not
/// pitch. Device note 20 lands on the bitstream channel, which has no actuator wired to it
/// yet — that is a fact about the instrument, not an error, and the strike machinery runs on
/// it normally so cabling the last chime needs no firmware change.
pub static NOTE_TO_CHANNEL: [u8; CHANNEL_COUNT] = [
    0, 1, 2, 3, // lowest four chimes on TIM1
    8, 9, 10, 11, // next four ran with the TIM2 loom
    4, 5, 6, 7, // TIM8 pair block
    12, 13, 14, 15, // TIM3
    16, 17, 18, 19, // TIM4
    20, // unwired bitstream channel
];

/// Per-actuator calibration, measured on the assembled instrument. The heavier low chimes
/// need more minimum drive and a longer soft-strike dwell than the light top tubes.
pub static CALIBRATIONS: [Calibration; CHANNEL_COUNT] = [
    Calibration::new(35, 100, 22, 120),
    Calibration::new(35, 100, 22, 120),
    Calibration::new(32, 100, 22, 110),
    Calibration::new(32, 100, 20, 110),
    Calibration::new(30, 100, 20, 100),
    Calibration::new(30, 100, 20, 100),
    Calibration::new(30, 100, 20, 100),
    Calibration::new(28, 100, 20, 95),
    Calibration::new(28, 100, 18, 95),
    Calibration::new(28, 100, 18, 95),
    Calibration::new(25, 100, 18, 90),
    Calibration::new(25, 100, 18, 90),
    Calibration::new(25, 100, 18, 90),
    Calibration::new(25, 95, 18, 85),
    Calibration::new(22, 95, 16, 85),
    Calibration::new(22, 95, 16, 80),
    Calibration::new(22, 95, 16, 80),
    Calibration::new(20, 90, 15, 75),
    Calibration::new(20, 90, 15, 75),
    Calibration::new(20, 90, 15, 70),
    Calibration::new(20, 90, 15, 70),
];
