#![no_std]
#![no_main]

mod board;
mod hw;
mod tasks;
mod usb;

use embassy_executor::{SpawnError, Spawner};
use embassy_stm32::dma::NoDma;
use embassy_stm32::gpio::{Level, Output, Pin, Speed};
use embassy_stm32::spi::{Config as SpiConfig, Spi};
use embassy_stm32::time::Hertz as TimeHertz;
use embassy_stm32::usart::{Config as UsartConfig, Uart};
use embassy_stm32::{bind_interrupts, peripherals};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use hoverfc::io::RcFrame;
use hoverfc::telemetry::TelemetrySnapshot;
use hoverfc::{FlightConfig, FlightCore};
use {defmt_rtt as _, panic_probe as _};

use crate::board::Board;
use crate::hw::icm42688::Icm42688;
use crate::hw::motors::MotorOutputs;
use crate::hw::RcLink;
use crate::tasks::fast_loop::{fast_loop_task, Latest};

// Capacity 1: the control cycle only ever wants the newest value.
static RC_CHAN: Channel<CriticalSectionRawMutex, RcFrame, 1> = Channel::new();
static CONFIG_CHAN: Channel<CriticalSectionRawMutex, FlightConfig, 1> = Channel::new();

static ACTIVE_CONFIG: Latest<FlightConfig> = Latest::new();
static RADIO_TELEMETRY: Latest<TelemetrySnapshot> = Latest::new();
static CONSOLE_TELEMETRY: Latest<TelemetrySnapshot> = Latest::new();

bind_interrupts!(struct Irqs {
    UART4 => embassy_stm32::usart::InterruptHandler<peripherals::UART4>;
});

const IMU_INIT_ATTEMPTS: u32 = 5;

fn started(name: &str, res: Result<(), SpawnError>) {
    if res.is_err() {
        defmt::error!("failed to start {}", name);
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let board = Board::init();
    let p = board.p;
    defmt::info!("hoverfc starting");

    // USB CDC-ACM parameter console
    let (usb_dev, usb_serial) = usb::init(p.USB_OTG_FS, p.PA12, p.PA11);
    started("usb", spawner.spawn(usb::usb_task(usb_dev)));

    // SPI1 @ 10 MHz, ICM-42688 (SCK=PA5, MOSI=PA7, MISO=PA6, CS=PB12)
    let mut spi_config = SpiConfig::default();
    spi_config.frequency = TimeHertz(10_000_000);
    let spi = Spi::new(p.SPI1, p.PA5, p.PA7, p.PA6, NoDma, NoDma, spi_config);
    let cs_gyro = Output::new(p.PB12.degrade(), Level::High, Speed::VeryHigh);
    let mut imu = Icm42688::new(spi, cs_gyro);

    // Motors 1-4
    let motors = MotorOutputs::new([p.PB0.degrade(), p.PB1.degrade(), p.PA3.degrade(), p.PA2.degrade()]);

    let mut led = Output::new(p.PC13, Level::High, Speed::Low);

    Timer::after(Duration::from_millis(100)).await;
    let mut imu_ok = false;
    for attempt in 1..=IMU_INIT_ATTEMPTS {
        match imu.init().await {
            Ok(()) => {
                imu_ok = true;
                break;
            }
            Err(e) => defmt::warn!("imu init attempt {}: {}", attempt, e),
        }
        Timer::after(Duration::from_millis(50)).await;
    }
    if !imu_ok {
        // The core keeps running: every read faults and arming stays blocked.
        defmt::error!("imu did not come up");
    }

    // Gyro calibration happens inside the core once the cycle runs.
    let core = match FlightCore::new(FlightConfig::default(), imu, RcLink::new(RC_CHAN.receiver()), motors) {
        Ok(core) => core,
        Err(e) => {
            defmt::error!("default config rejected: {}", e);
            loop {
                led.toggle();
                Timer::after(Duration::from_millis(100)).await;
            }
        }
    };
    started(
        "fast loop",
        spawner.spawn(fast_loop_task(
            core,
            CONFIG_CHAN.receiver(),
            &ACTIVE_CONFIG,
            &RADIO_TELEMETRY,
            &CONSOLE_TELEMETRY,
        )),
    );

    // CRSF/ELRS UART4 @ 420000 (TX=PA0, RX=PA1)
    let mut crsf_config = UsartConfig::default();
    crsf_config.baudrate = 420_000;
    match Uart::new(p.UART4, p.PA1, p.PA0, Irqs, p.DMA1_CH4, p.DMA1_CH2, crsf_config) {
        Ok(uart) => {
            let (tx, rx) = uart.split();
            started("crsf", spawner.spawn(tasks::crsf_task::crsf_task(rx, RC_CHAN.sender())));
            started(
                "telemetry",
                spawner.spawn(tasks::telemetry_task::telemetry_task(tx, &RADIO_TELEMETRY)),
            );
        }
        Err(_) => defmt::error!("crsf uart config rejected, no receiver link"),
    }

    started(
        "usb link",
        spawner.spawn(tasks::link_task::link_task(
            usb_serial,
            CONFIG_CHAN.sender(),
            &ACTIVE_CONFIG,
            &CONSOLE_TELEMETRY,
        )),
    );

    // Heartbeat
    loop {
        led.toggle();
        Timer::after(Duration::from_millis(500)).await;
    }
}
