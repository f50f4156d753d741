//! Carillon is [Embassy](https://embassy.dev)-based firmware for a physical carillon of 21
//! electromechanical chime strikers, running on the [Nucleo-F767ZI development
//! board](https://www.st.com/en/evaluation-tools/nucleo-f767zi.html). Notes arrive over a DIN
//! serial MIDI input and over the MUDP-v1 datagram protocol, and are generated internally by
//! the sequencer, the note repeater, and the tower-clock chime scheduler; all of them funnel
//! into the calibrated actuation layer in [`carillon_lib`].
//!
//! Concurrency model: producer tasks only push bytes and frames into channels. One engine
//! task owns the entire instrument state and is the only thing that ever mutates it, so the
//! core algorithms (power-budget eviction, the repeater slot table, the sequencer cursor)
//! never see concurrent access.

#![no_std]
#![no_main]

mod board;
mod midi_in;

use crate::board::StrikerOut;
use crate::midi_in::{DATAGRAMS, MIDI_BYTES, MIDI_BAUD};
use carillon_lib::clock::{ClockSettings, WallTime};
use carillon_lib::engine::Carillon;
use carillon_lib::striker::DEFAULT_POWER_BUDGET;
use core::sync::atomic::AtomicU8;
use defmt::{info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_futures::select::{select3, Either3};
use embassy_stm32::gpio::{Level, Output, OutputType, Speed};
use embassy_stm32::rtc::{Rtc, RtcConfig};
use embassy_stm32::time::Hertz;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm, SimplePwmChannels};
use embassy_stm32::timer::GeneralInstance4Channel;
use embassy_stm32::usart::{self, UartRx};
use embassy_stm32::{bind_interrupts, peripherals, Config};
use embassy_time::{Duration, Instant, Ticker};
use static_cell::StaticCell;

use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(
    #[doc(hidden)]
    struct Irqs {
        USART6 => usart::InterruptHandler<peripherals::USART6>;
    }
);

/// Duty cell shared between the bank's bitstream output and the modulator task.
static BITSTREAM_DUTY: AtomicU8 = AtomicU8::new(0);

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Initializing Carillon");

    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        // hse: high-speed external clock
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Bypass,
        });

        // pll: phase-locked loop, crucial for dividing clock
        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL216,
            divp: Some(PllPDiv::DIV2), // 8mhz / 4 * 216 / 2 = 216Mhz
            divq: None,
            divr: None,
        });
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;
        config.rcc.sys = Sysclk::PLL1_P;

        // the RTC keeps local time for the clock chimes; LSI is good enough until the
        // external time source disciplines it
        config.rcc.ls = LsConfig::default_lsi();
    }
    let p = embassy_stm32::init(config);

    // Striker PWM, four channels per timer. TIM1/TIM8 are the advanced-control timers whose
    // channels ship in operator pairs; TIM2/3/4 provide the independent channels.
    let tim1 = SimplePwm::new(
        p.TIM1,
        Some(PwmPin::new_ch1(p.PE9, OutputType::PushPull)),
        Some(PwmPin::new_ch2(p.PE11, OutputType::PushPull)),
        Some(PwmPin::new_ch3(p.PE13, OutputType::PushPull)),
        Some(PwmPin::new_ch4(p.PE14, OutputType::PushPull)),
        board::carrier_hz(),
        Default::default(),
    );
    let tim8 = SimplePwm::new(
        p.TIM8,
        Some(PwmPin::new_ch1(p.PC6, OutputType::PushPull)),
        Some(PwmPin::new_ch2(p.PC7, OutputType::PushPull)),
        Some(PwmPin::new_ch3(p.PC8, OutputType::PushPull)),
        Some(PwmPin::new_ch4(p.PC9, OutputType::PushPull)),
        board::carrier_hz(),
        Default::default(),
    );
    let tim2 = SimplePwm::new(
        p.TIM2,
        Some(PwmPin::new_ch1(p.PA0, OutputType::PushPull)),
        Some(PwmPin::new_ch2(p.PA1, OutputType::PushPull)),
        Some(PwmPin::new_ch3(p.PA2, OutputType::PushPull)),
        Some(PwmPin::new_ch4(p.PA3, OutputType::PushPull)),
        board::carrier_hz(),
        Default::default(),
    );
    let tim3 = SimplePwm::new(
        p.TIM3,
        Some(PwmPin::new_ch1(p.PA6, OutputType::PushPull)),
        Some(PwmPin::new_ch2(p.PA7, OutputType::PushPull)),
        Some(PwmPin::new_ch3(p.PB0, OutputType::PushPull)),
        Some(PwmPin::new_ch4(p.PB1, OutputType::PushPull)),
        board::carrier_hz(),
        Default::default(),
    );
    let tim4 = SimplePwm::new(
        p.TIM4,
        Some(PwmPin::new_ch1(p.PD12, OutputType::PushPull)),
        Some(PwmPin::new_ch2(p.PD13, OutputType::PushPull)),
        Some(PwmPin::new_ch3(p.PD14, OutputType::PushPull)),
        Some(PwmPin::new_ch4(p.PD15, OutputType::PushPull)),
        board::carrier_hz(),
        Default::default(),
    );

    static TIM1_CHANNELS: StaticCell<SimplePwmChannels<'static, peripherals::TIM1>> =
        StaticCell::new();
    static TIM8_CHANNELS: StaticCell<SimplePwmChannels<'static, peripherals::TIM8>> =
        StaticCell::new();
    static TIM2_CHANNELS: StaticCell<SimplePwmChannels<'static, peripherals::TIM2>> =
        StaticCell::new();
    static TIM3_CHANNELS: StaticCell<SimplePwmChannels<'static, peripherals::TIM3>> =
        StaticCell::new();
    static TIM4_CHANNELS: StaticCell<SimplePwmChannels<'static, peripherals::TIM4>> =
        StaticCell::new();

    let [a0, a1, a2, a3] = leak_pwm(TIM1_CHANNELS.init(tim1.split()));
    let [b0, b1, b2, b3] = leak_pwm(TIM8_CHANNELS.init(tim8.split()));
    let [c0, c1, c2, c3] = leak_pwm(TIM2_CHANNELS.init(tim2.split()));
    let [d0, d1, d2, d3] = leak_pwm(TIM3_CHANNELS.init(tim3.split()));
    let [e0, e1, e2, e3] = leak_pwm(TIM4_CHANNELS.init(tim4.split()));

    // the 21st channel: software sigma-delta on a plain GPIO (no actuator wired yet)
    let bitstream_pin = Output::new(p.PG2, Level::Low, Speed::Low);
    unwrap!(spawner.spawn(board::bitstream_task(bitstream_pin, &BITSTREAM_DUTY)));

    let outputs = [
        StrikerOut::AdvancedPair(a0),
        StrikerOut::AdvancedPair(a1),
        StrikerOut::AdvancedPair(a2),
        StrikerOut::AdvancedPair(a3),
        StrikerOut::AdvancedPair(b0),
        StrikerOut::AdvancedPair(b1),
        StrikerOut::AdvancedPair(b2),
        StrikerOut::AdvancedPair(b3),
        StrikerOut::TimerChannel(c0),
        StrikerOut::TimerChannel(c1),
        StrikerOut::TimerChannel(c2),
        StrikerOut::TimerChannel(c3),
        StrikerOut::TimerChannel(d0),
        StrikerOut::TimerChannel(d1),
        StrikerOut::TimerChannel(d2),
        StrikerOut::TimerChannel(d3),
        StrikerOut::TimerChannel(e0),
        StrikerOut::TimerChannel(e1),
        StrikerOut::TimerChannel(e2),
        StrikerOut::TimerChannel(e3),
        StrikerOut::Bitstream(board::BitstreamDuty::new(&BITSTREAM_DUTY)),
    ];
    board::log_output_map(&outputs);

    // DIN MIDI input on USART6 (PG9; the PC7 alternate belongs to TIM8)
    let mut uart_config = usart::Config::default();
    uart_config.baudrate = MIDI_BAUD;
    let uart_rx = unwrap!(UartRx::new(
        p.USART6,
        Irqs,
        p.PG9,
        p.DMA2_CH1,
        uart_config
    ));
    static UART_RX_BUF: StaticCell<[u8; 256]> = StaticCell::new();
    let uart_rx = uart_rx.into_ring_buffered(UART_RX_BUF.init([0; 256]));
    unwrap!(spawner.spawn(midi_in::midi_uart_task(uart_rx)));

    // local time for the clock chimes; synchronized externally (debug probe or control
    // surface), free-running from power-on until then
    let rtc = Rtc::new(p.RTC, RtcConfig::default());

    // settings are loaded by the external settings store before the instrument goes live;
    // until a store is attached the shipped defaults apply
    static CARILLON: StaticCell<Carillon<StrikerOut>> = StaticCell::new();
    let carillon = CARILLON.init(unwrap!(Carillon::new(
        outputs,
        board::CALIBRATIONS,
        board::NOTE_TO_CHANNEL,
        DEFAULT_POWER_BUDGET,
        ClockSettings::default(),
    )));

    unwrap!(spawner.spawn(engine_task(carillon, rtc)));
    info!("Carillon ready");
}

/// Enables a timer's four channels at zero duty and erases them to bank outputs.
fn leak_pwm<T: GeneralInstance4Channel>(
    channels: &'static mut SimplePwmChannels<'static, T>,
) -> [board::PwmDuty; 4] {
    channels.ch1.enable();
    channels.ch2.enable();
    channels.ch3.enable();
    channels.ch4.enable();
    [
        &mut channels.ch1,
        &mut channels.ch2,
        &mut channels.ch3,
        &mut channels.ch4,
    ]
}

/// The single consumer of every input channel and the owner of all core state.
///
/// Runs the cooperative control loop: drain the receivers, then advance the sequencer, the
/// repeater, the clock scheduler, and the actuation layer on the millisecond tick.
#[embassy_executor::task]
async fn engine_task(carillon: &'static mut Carillon<StrikerOut>, rtc: Rtc) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(1));
    loop {
        match select3(MIDI_BYTES.receive(), DATAGRAMS.receive(), ticker.next()).await {
            Either3::First(byte) => carillon.feed_serial(byte, Instant::now()),
            Either3::Second(frame) => {
                if let Err(reason) =
                    carillon.handle_datagram(&frame.bytes[..frame.len], Instant::now())
                {
                    warn!("engine: datagram rejected: {}", reason);
                }
            }
            Either3::Third(()) => carillon.tick(Instant::now(), wall_time(&rtc)),
        }
    }
}

/// Local time from the RTC, or `None` until it has been set.
fn wall_time(rtc: &Rtc) -> Option<WallTime> {
    rtc.now().ok().map(|t| WallTime {
        hour: t.hour(),
        minute: t.minute(),
    })
}
