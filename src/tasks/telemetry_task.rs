use embassy_executor::task;
use embassy_stm32::peripherals::{DMA1_CH4, UART4};
use embassy_stm32::usart::UartTx;
use embassy_time::{Duration, Ticker};

use super::fast_loop::Latest;
use hoverfc::protocol::crsf::CRSF_MAX_FRAME;
use hoverfc::telemetry::TelemetrySnapshot;

const TELEMETRY_HZ: u64 = 10;

/// CRSF downlink: attitude and flight mode frames at 10 Hz.
#[task]
pub async fn telemetry_task(
    mut crsf_tx: UartTx<'static, UART4, DMA1_CH4>,
    snapshots: &'static Latest<TelemetrySnapshot>,
) {
    let mut ticker = Ticker::every(Duration::from_hz(TELEMETRY_HZ));
    let mut latest = None;

    loop {
        ticker.next().await;
        if let Some(s) = snapshots.try_take() {
            latest = Some(s);
        }
        let Some(snapshot) = latest else {
            continue;
        };

        let mut buf = [0u8; 2 * CRSF_MAX_FRAME];
        let n = snapshot.write_crsf(&mut buf);
        if n > 0 && crsf_tx.write(&buf[..n]).await.is_err() {
            defmt::debug!("crsf telemetry write failed");
        }
    }
}
