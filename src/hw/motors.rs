//! Bit-banged motor outputs on GPIO.
//!
//! Each channel's pulse runs with interrupts masked; the guard gap between
//! channels lets pending interrupts through. Pulses follow the frame's
//! [`PulseSchedule`](hoverfc::io::PulseSchedule) order.

use cortex_m::asm;
use embassy_stm32::gpio::{AnyPin, Level, Output, Speed};
use hoverfc::io::{ActuatorSink, OutputFrame, OutputProtocol};

use crate::board::SYSCLK_HZ;

const CYCLES_PER_US: u32 = SYSCLK_HZ / 1_000_000;

#[derive(Clone, Copy)]
struct BitTiming {
    one_high: u32,
    one_low: u32,
    zero_high: u32,
    zero_low: u32,
}

impl BitTiming {
    /// T1H = 3/4 and T0H = 3/8 of the bit period.
    const fn for_rate(kbit_per_s: u32) -> Self {
        let total = SYSCLK_HZ / (kbit_per_s * 1000);
        let one_high = total * 3 / 4;
        let zero_high = total * 3 / 8;
        Self {
            one_high,
            one_low: total - one_high,
            zero_high,
            zero_low: total - zero_high,
        }
    }
}

pub const MOTOR_PINS: usize = 4;

pub struct MotorOutputs {
    pins: [Output<'static, AnyPin>; MOTOR_PINS],
}

impl MotorOutputs {
    pub fn new(pins: [AnyPin; MOTOR_PINS]) -> Self {
        Self {
            pins: pins.map(|pin| Output::new(pin, Level::Low, Speed::VeryHigh)),
        }
    }

    fn send_dshot(pin: &mut Output<'static, AnyPin>, word: u16, t: BitTiming) {
        critical_section::with(|_cs| {
            for bit in (0..16).rev() {
                pin.set_high();
                if (word >> bit) & 1 != 0 {
                    asm::delay(t.one_high);
                    pin.set_low();
                    asm::delay(t.one_low);
                } else {
                    asm::delay(t.zero_high);
                    pin.set_low();
                    asm::delay(t.zero_low);
                }
            }
            pin.set_low();
        });
    }

    fn send_pwm(pin: &mut Output<'static, AnyPin>, width_us: u16) {
        critical_section::with(|_cs| {
            pin.set_high();
            asm::delay(width_us as u32 * CYCLES_PER_US);
            pin.set_low();
        });
    }
}

impl ActuatorSink for MotorOutputs {
    fn emit(&mut self, frame: &OutputFrame) {
        let timing = match frame.protocol {
            OutputProtocol::Dshot { rate } => Some(BitTiming::for_rate(rate.kbit_per_s())),
            OutputProtocol::Pwm { .. } => None,
        };
        let slots = frame.schedule.slots();
        let mut cursor_us = 0;
        for ((pin, &word), slot) in self.pins.iter_mut().zip(frame.words()).zip(slots) {
            if slot.offset_us > cursor_us {
                asm::delay((slot.offset_us - cursor_us) * CYCLES_PER_US);
            }
            match timing {
                Some(t) => Self::send_dshot(pin, word, t),
                None => Self::send_pwm(pin, word),
            }
            cursor_us = slot.end_us();
        }
    }
}

// DShot300 at 168 MHz: 560 cycles per bit, 420 high for a one, 210 for a zero.
const _: () = {
    let t = BitTiming::for_rate(300);
    assert!(t.one_high + t.one_low == 560);
    assert!(t.one_high == 420);
    assert!(t.zero_high == 210);
};

