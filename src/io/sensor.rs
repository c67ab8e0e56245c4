use micromath::F32Ext;

use crate::config::SensorConfig;
use crate::error::SensorFault;
use crate::state::ImuSample;

/// A 6-axis IMU that can be polled once per control cycle. Implementations
/// must bound the transfer time; a missing answer is `SensorFault::Timeout`.
pub trait ImuDevice {
    fn read(&mut self) -> Result<ImuSample, SensorFault>;
}

impl<T: ImuDevice + ?Sized> ImuDevice for &mut T {
    fn read(&mut self) -> Result<ImuSample, SensorFault> {
        (**self).read()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorStatus {
    Fresh,
    /// The last good sample reused; `cycles` consecutive faults so far.
    Held { cycles: u32 },
    /// Faults outlasted the hold window.
    Failed(SensorFault),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorReading {
    pub sample: Option<ImuSample>,
    pub status: SensorStatus,
}

impl SensorReading {
    pub fn is_fresh(&self) -> bool {
        self.status == SensorStatus::Fresh
    }
}

/// Wraps an [`ImuDevice`] with plausibility checks and a short hold-last
/// window for transient faults.
pub struct SensorInterface<I> {
    device: I,
    config: SensorConfig,
    last: Option<ImuSample>,
    consecutive_faults: u32,
    total_faults: u32,
}

impl<I: ImuDevice> SensorInterface<I> {
    pub fn new(device: I, config: &SensorConfig) -> Self {
        Self {
            device,
            config: *config,
            last: None,
            consecutive_faults: 0,
            total_faults: 0,
        }
    }

    pub fn reconfigure(&mut self, config: &SensorConfig) {
        self.config = *config;
    }

    pub fn device_mut(&mut self) -> &mut I {
        &mut self.device
    }

    pub fn total_faults(&self) -> u32 {
        self.total_faults
    }

    fn check(&self, sample: ImuSample) -> Result<ImuSample, SensorFault> {
        let gyro_ok = sample
            .gyro_dps
            .iter()
            .all(|v| v.is_finite() && v.abs() <= self.config.gyro_limit_dps);
        let accel_ok = sample
            .accel_g
            .iter()
            .all(|v| v.is_finite() && v.abs() <= self.config.accel_limit_g);
        if gyro_ok && accel_ok {
            Ok(sample)
        } else {
            Err(SensorFault::OutOfRange)
        }
    }

    pub fn read(&mut self) -> SensorReading {
        match self.device.read().and_then(|s| self.check(s)) {
            Ok(sample) => {
                if self.consecutive_faults > self.config.hold_cycles {
                    info!("IMU recovered after {} faults", self.consecutive_faults);
                }
                self.last = Some(sample);
                self.consecutive_faults = 0;
                SensorReading {
                    sample: Some(sample),
                    status: SensorStatus::Fresh,
                }
            }
            Err(fault) => {
                self.consecutive_faults = self.consecutive_faults.saturating_add(1);
                self.total_faults = self.total_faults.wrapping_add(1);
                match self.last {
                    Some(last) if self.consecutive_faults <= self.config.hold_cycles => {
                        debug!("IMU fault, holding last sample");
                        SensorReading {
                            sample: Some(last),
                            status: SensorStatus::Held {
                                cycles: self.consecutive_faults,
                            },
                        }
                    }
                    _ => {
                        if self.consecutive_faults == self.config.hold_cycles + 1 {
                            error!("IMU failed: {}", fault);
                        }
                        SensorReading {
                            sample: None,
                            status: SensorStatus::Failed(fault),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlightConfig;

    /// Replays a script of results, repeating the last one.
    struct Scripted<'a> {
        script: &'a [Result<ImuSample, SensorFault>],
        pos: usize,
    }

    impl ImuDevice for Scripted<'_> {
        fn read(&mut self) -> Result<ImuSample, SensorFault> {
            let r = self.script[self.pos.min(self.script.len() - 1)];
            self.pos += 1;
            r
        }
    }

    const LEVEL: ImuSample = ImuSample::new([0.0; 3], [0.0, 0.0, 1.0]);

    #[test]
    fn holds_then_fails_then_recovers() {
        let mut cfg = FlightConfig::default().sensor;
        cfg.hold_cycles = 2;
        let script = [
            Ok(LEVEL),
            Err(SensorFault::Bus),
            Err(SensorFault::Bus),
            Err(SensorFault::Timeout),
            Ok(LEVEL),
        ];
        let mut sensor = SensorInterface::new(Scripted { script: &script, pos: 0 }, &cfg);

        assert!(sensor.read().is_fresh());
        let r = sensor.read();
        assert_eq!(r.status, SensorStatus::Held { cycles: 1 });
        assert_eq!(r.sample, Some(LEVEL));
        assert_eq!(sensor.read().status, SensorStatus::Held { cycles: 2 });
        let r = sensor.read();
        assert_eq!(r.status, SensorStatus::Failed(SensorFault::Timeout));
        assert_eq!(r.sample, None);
        assert!(sensor.read().is_fresh());
        assert_eq!(sensor.total_faults(), 3);
    }

    #[test]
    fn implausible_values_are_faults() {
        let cfg = FlightConfig::default().sensor;
        let script = [
            Ok(ImuSample::new([cfg.gyro_limit_dps * 2.0, 0.0, 0.0], [0.0, 0.0, 1.0])),
            Ok(ImuSample::new([0.0; 3], [f32::NAN, 0.0, 1.0])),
        ];
        let mut sensor = SensorInterface::new(Scripted { script: &script, pos: 0 }, &cfg);
        // Nothing to hold yet: straight to failed.
        assert_eq!(sensor.read().status, SensorStatus::Failed(SensorFault::OutOfRange));
        assert_eq!(sensor.read().status, SensorStatus::Failed(SensorFault::OutOfRange));
    }
}
