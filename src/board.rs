//! STM32F405 clock tree: 8 MHz crystal, PLL to 168 MHz core and 48 MHz USB.

use embassy_stm32::rcc::{
    AHBPrescaler, APBPrescaler, Hse, HseMode, Pll, PllMul, PllPDiv, PllPreDiv, PllQDiv, PllSource, Sysclk,
};
use embassy_stm32::time::Hertz;
use embassy_stm32::{Config, Peripherals};

pub const HSE_HZ: u32 = 8_000_000;
/// HSE / 4 × 168 / 2. Motor bit timings are counted in these cycles.
pub const SYSCLK_HZ: u32 = 168_000_000;

pub struct Board {
    pub p: Peripherals,
}

impl Board {
    fn clocks() -> Config {
        let mut config = Config::default();
        let rcc = &mut config.rcc;
        rcc.hse = Some(Hse {
            freq: Hertz(HSE_HZ),
            mode: HseMode::Oscillator,
        });
        rcc.pll_src = PllSource::HSE;
        rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL168,
            divp: Some(PllPDiv::DIV2),
            // 336 MHz VCO / 7 = 48 MHz for USB FS.
            divq: Some(PllQDiv::DIV7),
            divr: None,
        });
        rcc.sys = Sysclk::PLL1_P;
        rcc.ahb_pre = AHBPrescaler::DIV1;
        // APB1 42 MHz, APB2 84 MHz.
        rcc.apb1_pre = APBPrescaler::DIV4;
        rcc.apb2_pre = APBPrescaler::DIV2;
        config
    }

    pub fn init() -> Self {
        Self {
            p: embassy_stm32::init(Self::clocks()),
        }
    }
}
