use embassy_executor::task;
use embassy_futures::select::{select, Either};
use embassy_stm32::peripherals::{DMA1_CH2, UART4};
use embassy_stm32::usart::UartRx;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_time::{Duration, Timer};
use hoverfc::io::RcFrame;
use hoverfc::protocol::crsf::{CrsfFrame, CrsfParser};

/// Uplink quality (percent) below which the link is reported as weak.
const WEAK_LINK_LQ: u8 = 50;

/// CRSF receiver task: parses UART4 RX bursts and forwards every RC frame
/// to the control cycle.
#[task]
pub async fn crsf_task(
    mut rx: UartRx<'static, UART4, DMA1_CH2>,
    frames: Sender<'static, CriticalSectionRawMutex, RcFrame, 1>,
) {
    let mut parser = CrsfParser::new();
    let mut buf = [0u8; 64];
    let mut weak = false;
    let mut crc_errors = 0;

    loop {
        // Frames arrive every 2..20 ms; the timeout only keeps errors visible.
        let n = match select(rx.read_until_idle(&mut buf), Timer::after(Duration::from_millis(50))).await {
            Either::First(Ok(n)) => n,
            Either::First(Err(_)) => {
                defmt::debug!("crsf uart error");
                continue;
            }
            Either::Second(_) => continue,
        };

        for &b in &buf[..n] {
            match parser.push_byte(b) {
                Some(CrsfFrame::RcChannels(channels)) => {
                    // The control cycle drains this every period, so a full
                    // channel means it is not running; dropping is fine.
                    let _ = frames.try_send(RcFrame { channels });
                }
                Some(CrsfFrame::LinkStatistics(stats)) => {
                    let now_weak = stats.uplink_link_quality < WEAK_LINK_LQ;
                    if now_weak != weak {
                        weak = now_weak;
                        if weak {
                            defmt::warn!("crsf link weak: lq={}% rssi=-{}dBm", stats.uplink_link_quality, stats.uplink_rssi_1);
                        } else {
                            defmt::info!("crsf link good: lq={}%", stats.uplink_link_quality);
                        }
                    }
                }
                None => {}
            }
        }

        if parser.crc_errors() != crc_errors {
            crc_errors = parser.crc_errors();
            defmt::debug!("crsf crc errors: {}", crc_errors);
        }
    }
}
