use core::fmt::Write;

use embassy_executor::task;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_usb::driver::EndpointError;
use hoverfc::params::{ParamSession, Reply};
use hoverfc::telemetry::TelemetrySnapshot;
use hoverfc::FlightConfig;

use super::fast_loop::Latest;
use crate::hw::motors::MOTOR_PINS;
use crate::usb::UsbSerial;

const MAX_PACKET: usize = 64;
const MAX_LINE: usize = 96;

type ConsoleOut = heapless::String<4096>;

struct Link {
    configs: Sender<'static, CriticalSectionRawMutex, FlightConfig, 1>,
    active: &'static Latest<FlightConfig>,
    status: &'static Latest<TelemetrySnapshot>,
    active_cfg: FlightConfig,
    latest: Option<TelemetrySnapshot>,
    session: ParamSession,
}

impl Link {
    fn refresh(&mut self) {
        if let Some(cfg) = self.active.try_take() {
            self.active_cfg = cfg;
        }
        if let Some(s) = self.status.try_take() {
            self.latest = Some(s);
        }
    }

    async fn handle_line(&mut self, line: &str, out: &mut ConsoleOut) {
        self.refresh();
        let res = self
            .session
            .handle(line, &self.active_cfg, self.latest.as_ref(), out);
        match res {
            Ok(Reply::Done) => {}
            Ok(Reply::Apply(cfg)) => {
                if cfg.mixer.matrix.motor_count() > MOTOR_PINS {
                    out.clear();
                    let _ = write!(out, "error: board has {} motor outputs\r\n", MOTOR_PINS);
                    return;
                }
                defmt::info!("usb link: applying staged config");
                self.configs.send(cfg).await;
            }
            Err(e) => {
                let _ = write!(out, "error: {}\r\n", e);
            }
        }
    }
}

async fn write_all(serial: &mut UsbSerial<'static>, data: &[u8]) -> Result<(), EndpointError> {
    for chunk in data.chunks(MAX_PACKET) {
        serial.write_packet(chunk).await?;
    }
    // A full last packet needs a zero-length one to end the transfer.
    if !data.is_empty() && data.len() % MAX_PACKET == 0 {
        serial.write_packet(&[]).await?;
    }
    Ok(())
}

/// Parameter console on the USB CDC port, one command per line.
#[task]
pub async fn link_task(
    mut serial: UsbSerial<'static>,
    configs: Sender<'static, CriticalSectionRawMutex, FlightConfig, 1>,
    active: &'static Latest<FlightConfig>,
    status: &'static Latest<TelemetrySnapshot>,
) {
    let initial = FlightConfig::default();
    let mut link = Link {
        configs,
        active,
        status,
        active_cfg: initial,
        latest: None,
        session: ParamSession::new(&initial),
    };

    loop {
        serial.wait_connection().await;
        link.refresh();
        link.session.sync(&link.active_cfg);
        defmt::info!("usb link connected");
        let _ = serve(&mut serial, &mut link).await;
        defmt::info!("usb link disconnected");
    }
}

async fn serve(serial: &mut UsbSerial<'static>, link: &mut Link) -> Result<(), EndpointError> {
    let mut packet = [0u8; MAX_PACKET];
    let mut line: heapless::Vec<u8, MAX_LINE> = heapless::Vec::new();
    let mut overflow = false;
    let mut out = ConsoleOut::new();

    loop {
        let n = serial.read_packet(&mut packet).await?;
        for &b in &packet[..n] {
            if b != b'\r' && b != b'\n' {
                overflow |= line.push(b).is_err();
                continue;
            }
            if line.is_empty() {
                continue;
            }
            out.clear();
            match core::str::from_utf8(&line) {
                Ok(_) if overflow => {
                    let _ = out.push_str("error: line too long\r\n");
                }
                Ok(text) => link.handle_line(text, &mut out).await,
                Err(_) => {
                    let _ = out.push_str("error: not text\r\n");
                }
            }
            line.clear();
            overflow = false;
            write_all(serial, out.as_bytes()).await?;
        }
    }
}
