//! ICM-42688-P on SPI1, ±2000 dps / ±16 g, 1 kHz ODR.

use embassy_stm32::dma::NoDma;
use embassy_stm32::gpio::{AnyPin, Output};
use embassy_stm32::spi::{Error, Instance, Spi};
use embassy_time::{Duration, Timer};
use hoverfc::error::SensorFault;
use hoverfc::io::ImuDevice;
use hoverfc::ImuSample;

const REG_DEVICE_CONFIG: u8 = 0x11;
const REG_ACCEL_DATA_X1: u8 = 0x1F;
const REG_PWR_MGMT0: u8 = 0x4E;
const REG_GYRO_CONFIG0: u8 = 0x4F;
const REG_ACCEL_CONFIG0: u8 = 0x50;
const REG_WHO_AM_I: u8 = 0x75;

const WHO_AM_I: u8 = 0x47;
/// FS_SEL 0 (±2000 dps / ±16 g), ODR 1 kHz.
const FS_MAX_ODR_1K: u8 = 0x06;

const GYRO_LSB_PER_DPS: f32 = 16.4;
const ACCEL_LSB_PER_G: f32 = 2048.0;
/// Output registers hold this until the first conversion completes.
const DATA_INVALID: i16 = i16::MIN;

pub struct Icm42688<'d, T: Instance> {
    spi: Spi<'d, T, NoDma, NoDma>,
    cs: Output<'d, AnyPin>,
}

impl<'d, T: Instance> Icm42688<'d, T> {
    pub fn new(spi: Spi<'d, T, NoDma, NoDma>, cs: Output<'d, AnyPin>) -> Self {
        Self { spi, cs }
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), Error> {
        self.cs.set_low();
        let res = self.spi.blocking_write(&[reg & 0x7F, value]);
        self.cs.set_high();
        res
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, Error> {
        let tx = [reg | 0x80, 0x00];
        let mut rx = [0u8; 2];
        self.cs.set_low();
        let res = self.spi.blocking_transfer(&mut rx, &tx);
        self.cs.set_high();
        res?;
        Ok(rx[1])
    }

    /// Soft reset, identity check, full-scale and ODR setup, sensor start.
    pub async fn init(&mut self) -> Result<(), SensorFault> {
        self.write_reg(REG_DEVICE_CONFIG, 0x01).map_err(|_| SensorFault::Bus)?;
        Timer::after(Duration::from_millis(10)).await;

        let id = self.read_reg(REG_WHO_AM_I).map_err(|_| SensorFault::Bus)?;
        if id != WHO_AM_I {
            defmt::error!("icm42688: unexpected WHO_AM_I {=u8:#x}", id);
            return Err(SensorFault::Bus);
        }

        self.write_reg(REG_GYRO_CONFIG0, FS_MAX_ODR_1K).map_err(|_| SensorFault::Bus)?;
        self.write_reg(REG_ACCEL_CONFIG0, FS_MAX_ODR_1K).map_err(|_| SensorFault::Bus)?;
        // Gyro and accel in low noise mode.
        self.write_reg(REG_PWR_MGMT0, 0x0F).map_err(|_| SensorFault::Bus)?;
        Timer::after(Duration::from_millis(50)).await;
        Ok(())
    }

    /// Raw accel then gyro counts, one burst read.
    fn read_raw(&mut self) -> Result<([i16; 3], [i16; 3]), Error> {
        let mut tx = [0u8; 13];
        tx[0] = REG_ACCEL_DATA_X1 | 0x80;
        let mut rx = [0u8; 13];

        self.cs.set_low();
        let res = self.spi.blocking_transfer(&mut rx, &tx);
        self.cs.set_high();
        res?;

        let word = |i: usize| i16::from_be_bytes([rx[i], rx[i + 1]]);
        Ok(([word(1), word(3), word(5)], [word(7), word(9), word(11)]))
    }
}

impl<'d, T: Instance> ImuDevice for Icm42688<'d, T> {
    fn read(&mut self) -> Result<ImuSample, SensorFault> {
        let (accel, gyro) = self.read_raw().map_err(|_| SensorFault::Bus)?;
        if accel.contains(&DATA_INVALID) || gyro.contains(&DATA_INVALID) {
            return Err(SensorFault::Timeout);
        }
        // Board mounting matches the body frame: x forward, y left, z up.
        Ok(ImuSample::new(
            gyro.map(|v| v as f32 / GYRO_LSB_PER_DPS),
            accel.map(|v| v as f32 / ACCEL_LSB_PER_G),
        ))
    }
}
