use embassy_executor::task;
use embassy_stm32::peripherals::SPI1;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker};
use hoverfc::telemetry::TelemetrySnapshot;
use hoverfc::{FlightConfig, FlightCore};

use crate::hw::icm42688::Icm42688;
use crate::hw::motors::MotorOutputs;
use crate::hw::RcLink;

pub type Core = FlightCore<Icm42688<'static, SPI1>, RcLink, MotorOutputs>;
pub type Latest<T> = Signal<CriticalSectionRawMutex, T>;

fn ticker_for(cfg: &FlightConfig) -> Ticker {
    Ticker::every(Duration::from_hz(cfg.loop_hz as u64))
}

/// The control cycle at the configured loop rate.
///
/// Config updates from the USB link are staged before the step so they take
/// effect at its start. The applied config and a telemetry snapshot are
/// published after every step.
#[task]
pub async fn fast_loop_task(
    mut core: Core,
    configs: Receiver<'static, CriticalSectionRawMutex, FlightConfig, 1>,
    active: &'static Latest<FlightConfig>,
    radio: &'static Latest<TelemetrySnapshot>,
    console: &'static Latest<TelemetrySnapshot>,
) {
    let mut generation = core.config_generation();
    let mut ticker = ticker_for(core.config());
    active.signal(*core.config());

    loop {
        ticker.next().await;

        if let Ok(cfg) = configs.try_receive() {
            // A rejection shows up as an event in the next report.
            let _ = core.request_config(cfg);
        }

        let report = core.step(Instant::now().as_micros());
        for event in &report.events {
            defmt::debug!("cycle {}: {}", report.cycle, event);
        }

        if core.config_generation() != generation {
            generation = core.config_generation();
            ticker = ticker_for(core.config());
            active.signal(*core.config());
        }

        let snapshot = core.snapshot(&report);
        radio.signal(snapshot);
        console.signal(snapshot);
    }
}
