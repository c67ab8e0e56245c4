//! The control cycle.
//!
//! [`FlightCore::step`] runs sensor read → receiver read → estimation →
//! safety check → control → mixing → output gate → output, once per period.
//! It owns every piece of mutable flight state; nothing else touches the
//! controller or the supervisor.

use crate::config::{ConfigStore, FlightConfig};
use crate::control::{Guidance, Mixer, Stabilizer, TorqueCommand};
use crate::error::{ConfigError, FlightError, SensorFault, SignalLoss};
use crate::estimation::AttitudeEstimator;
use crate::io::{ActuatorSink, FrameSource, ImuDevice, OutputDriver, ReceiverInterface, SensorInterface, SensorStatus};
use crate::safety::{DisarmReason, SafetyInputs, SafetySupervisor, Transition};
use crate::state::{ActuatorCommands, CommandChannels, FailsafeCause, SafetyState};
use crate::telemetry::{CycleReport, Events, TelemetrySnapshot};

/// Something worth telling the pilot about, reported once when it happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlightEvent {
    CalibrationComplete,
    EstimationDegraded,
    Armed,
    Disarmed(DisarmReason),
    Failsafe(FailsafeCause),
    SignalLost(SignalLoss),
    SignalRestored,
    SensorFailed(SensorFault),
    SensorRecovered,
    ActuatorSaturation,
    ConfigApplied,
    ConfigRejected(ConfigError),
    /// Time since the previous cycle started, when above 1.5 periods.
    CycleOverrun { interval_us: u32 },
}

impl FlightEvent {
    /// The error kind behind this event, if it reports one.
    pub fn error(&self) -> Option<FlightError> {
        match *self {
            FlightEvent::EstimationDegraded => Some(FlightError::EstimationDegraded),
            FlightEvent::SignalLost(loss) => Some(loss.into()),
            FlightEvent::SensorFailed(fault) => Some(fault.into()),
            FlightEvent::ActuatorSaturation => Some(FlightError::ActuatorSaturation),
            FlightEvent::ConfigRejected(e) => Some(e.into()),
            _ => None,
        }
    }

    /// Short name for the console status line.
    pub fn label(&self) -> &'static str {
        match self {
            FlightEvent::CalibrationComplete => "calibrated",
            FlightEvent::EstimationDegraded => "degraded",
            FlightEvent::Armed => "armed",
            FlightEvent::Disarmed(_) => "disarmed",
            FlightEvent::Failsafe(_) => "failsafe",
            FlightEvent::SignalLost(_) => "signal-lost",
            FlightEvent::SignalRestored => "signal-ok",
            FlightEvent::SensorFailed(_) => "sensor-failed",
            FlightEvent::SensorRecovered => "sensor-ok",
            FlightEvent::ActuatorSaturation => "saturation",
            FlightEvent::ConfigApplied => "config-applied",
            FlightEvent::ConfigRejected(_) => "config-rejected",
            FlightEvent::CycleOverrun { .. } => "overrun",
        }
    }
}

fn push_event(events: &mut Events, event: FlightEvent) {
    if events.push(event).is_err() {
        warn!("event queue full, dropped one");
    }
}

pub struct FlightCore<I, R, A> {
    store: ConfigStore,
    sensor: SensorInterface<I>,
    source: R,
    sink: A,
    receiver: ReceiverInterface,
    estimator: AttitudeEstimator,
    stabilizer: Stabilizer,
    mixer: Mixer,
    output: OutputDriver,
    supervisor: SafetySupervisor,
    cycle: u32,
    last_step_us: Option<u64>,
    signal_ok: bool,
    sensor_failed: bool,
    saturated: bool,
    overruns: u32,
    rejected: Option<ConfigError>,
    /// Most recent event and the cycle it happened in.
    last_event: Option<(u32, FlightEvent)>,
}

impl<I: ImuDevice, R: FrameSource, A: ActuatorSink> FlightCore<I, R, A> {
    pub fn new(config: FlightConfig, imu: I, source: R, sink: A) -> Result<Self, ConfigError> {
        let store = ConfigStore::new(config)?;
        let cfg = store.active();
        Ok(Self {
            sensor: SensorInterface::new(imu, &cfg.sensor),
            receiver: ReceiverInterface::new(cfg.channels, cfg.failsafe.signal_timeout_ms),
            estimator: AttitudeEstimator::new(&cfg.estimator, cfg.loop_hz),
            stabilizer: Stabilizer::new(&cfg.control, cfg.loop_hz),
            mixer: Self::mixer_for(cfg),
            output: OutputDriver::new(&cfg.output),
            store,
            source,
            sink,
            supervisor: SafetySupervisor::new(),
            cycle: 0,
            last_step_us: None,
            signal_ok: false,
            sensor_failed: false,
            saturated: false,
            overruns: 0,
            rejected: None,
            last_event: None,
        })
    }

    fn mixer_for(cfg: &FlightConfig) -> Mixer {
        Mixer::new(cfg.mixer.matrix, cfg.mixer.clip, cfg.output.min, cfg.output.max)
    }

    pub fn config(&self) -> &FlightConfig {
        self.store.active()
    }

    pub fn config_generation(&self) -> u32 {
        self.store.generation()
    }

    pub fn state(&self) -> SafetyState {
        self.supervisor.state()
    }

    pub fn estimator(&self) -> &AttitudeEstimator {
        &self.estimator
    }

    pub fn stabilizer(&self) -> &Stabilizer {
        &self.stabilizer
    }

    pub fn supervisor(&self) -> &SafetySupervisor {
        &self.supervisor
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    pub fn last_event(&self) -> Option<(u32, FlightEvent)> {
        self.last_event
    }

    /// Telemetry view of `report`, which must be the latest step's.
    pub fn snapshot(&self, report: &CycleReport) -> TelemetrySnapshot {
        TelemetrySnapshot::from_report(report, self.overruns, self.last_event)
    }

    pub fn imu_mut(&mut self) -> &mut I {
        self.sensor.device_mut()
    }

    pub fn source_mut(&mut self) -> &mut R {
        &mut self.source
    }

    pub fn sink_mut(&mut self) -> &mut A {
        &mut self.sink
    }

    /// Stage a replacement configuration; it becomes active at the start of
    /// the next step. Rejected configurations leave the current one active.
    pub fn request_config(&mut self, config: FlightConfig) -> Result<(), ConfigError> {
        self.store.stage(config).inspect_err(|&e| self.rejected = Some(e))
    }

    fn apply_staged(&mut self, events: &mut Events) {
        if let Some(e) = self.rejected.take() {
            push_event(events, FlightEvent::ConfigRejected(e));
        }
        let Some(cfg) = self.store.apply_staged() else {
            return;
        };
        let cfg = *cfg;
        self.sensor.reconfigure(&cfg.sensor);
        self.receiver
            .reconfigure(cfg.channels, cfg.failsafe.signal_timeout_ms);
        self.estimator.reconfigure(&cfg.estimator, cfg.loop_hz);
        self.stabilizer.reconfigure(&cfg.control, cfg.loop_hz);
        self.mixer = Self::mixer_for(&cfg);
        self.output = OutputDriver::new(&cfg.output);
        push_event(events, FlightEvent::ConfigApplied);
    }

    /// Run one control cycle at time `now_us` (monotonic).
    pub fn step(&mut self, now_us: u64) -> CycleReport {
        let mut events = Events::new();
        self.cycle = self.cycle.wrapping_add(1);

        self.apply_staged(&mut events);
        let cfg = *self.store.active();
        let period_us = cfg.period_us();

        let dt = match self.last_step_us {
            Some(last) => {
                let interval = now_us.saturating_sub(last);
                if interval > period_us as u64 * 3 / 2 {
                    self.overruns = self.overruns.wrapping_add(1);
                    let interval_us = interval.min(u32::MAX as u64) as u32;
                    debug!("cycle overrun: {} us", interval_us);
                    push_event(&mut events, FlightEvent::CycleOverrun { interval_us });
                }
                (interval as f32 * 1e-6).clamp(cfg.period_s() * 0.5, cfg.period_s() * 4.0)
            }
            None => cfg.period_s(),
        };
        self.last_step_us = Some(now_us);

        // Inputs
        let reading = self.sensor.read();
        match reading.status {
            SensorStatus::Failed(fault) if !self.sensor_failed => {
                self.sensor_failed = true;
                push_event(&mut events, FlightEvent::SensorFailed(fault));
            }
            SensorStatus::Fresh if self.sensor_failed => {
                self.sensor_failed = false;
                push_event(&mut events, FlightEvent::SensorRecovered);
            }
            _ => {}
        }

        let frame = self.source.poll();
        let commands = match self.receiver.read(now_us, frame) {
            Ok(c) => {
                if !self.signal_ok {
                    self.signal_ok = true;
                    if self.cycle > 1 {
                        info!("receiver link up");
                    }
                    push_event(&mut events, FlightEvent::SignalRestored);
                }
                Some(c)
            }
            Err(loss) => {
                if self.signal_ok {
                    self.signal_ok = false;
                    warn!("{}", loss);
                    push_event(&mut events, FlightEvent::SignalLost(loss));
                }
                None
            }
        };

        // Estimation
        if let Some(outcome) = self
            .estimator
            .update(reading.sample.as_ref(), reading.is_fresh(), dt)
        {
            let event = if outcome.degraded {
                FlightEvent::EstimationDegraded
            } else {
                FlightEvent::CalibrationComplete
            };
            push_event(&mut events, event);
        }
        let estimate = *self.estimator.estimate();
        let stale = self.estimator.age_cycles() > cfg.control.estimate_stale_cycles;

        // Safety, start of cycle
        let inputs = SafetyInputs {
            commands: commands.as_ref(),
            sensor_failed: self.sensor_failed,
            estimator_tracking: self.estimator.is_tracking(),
            estimate: &estimate,
        };
        if let Some(transition) = self.supervisor.check(&cfg, now_us, &inputs) {
            // Every transition starts the controller from a clean slate.
            self.stabilizer.reset();
            push_event(
                &mut events,
                match transition {
                    Transition::Armed => FlightEvent::Armed,
                    Transition::Disarmed(reason) => FlightEvent::Disarmed(reason),
                    Transition::Failsafe(cause) => FlightEvent::Failsafe(cause),
                },
            );
        }

        // Control and mixing
        let motors = self.mixer.motor_count();
        let demand = match self.supervisor.state() {
            SafetyState::Armed => commands.map(|c| (c, Guidance::Pilot, c.throttle)),
            SafetyState::Failsafe if self.supervisor.descending() => {
                // Hold level on the last known mode, throttle from the profile.
                let last = self
                    .receiver
                    .last_commands()
                    .copied()
                    .unwrap_or_default();
                let hold = CommandChannels {
                    throttle: cfg.failsafe.throttle,
                    ..last
                };
                Some((hold, Guidance::Level, cfg.failsafe.throttle))
            }
            _ => None,
        };

        let mixed = match demand {
            Some((cmd, guidance, throttle)) => {
                let torque: TorqueCommand =
                    self.stabilizer
                        .update(&cfg.control, &estimate, &cmd, guidance, stale, dt);
                self.mixer.mix(throttle, torque.roll, torque.pitch, torque.yaw)
            }
            None => ActuatorCommands::uniform(motors, cfg.output.disarmed),
        };

        if mixed.saturated && !self.saturated {
            push_event(&mut events, FlightEvent::ActuatorSaturation);
        }
        self.saturated = mixed.saturated;

        // Safety, end of cycle
        let mut outputs = self.supervisor.gate(&cfg, &mixed, motors);
        outputs.saturated = mixed.saturated;

        let frame = self.output.encode(&outputs);
        self.sink.emit(&frame);

        if let Some(&event) = events.last() {
            self.last_event = Some((self.cycle, event));
        }

        CycleReport {
            cycle: self.cycle,
            now_us,
            state: self.supervisor.state(),
            failsafe_cause: self.supervisor.failsafe_cause(),
            phase: self.estimator.phase(),
            estimate,
            estimate_age: self.estimator.age_cycles(),
            sensor: reading.status,
            commands,
            mode: commands
                .map(|c| c.mode)
                .or_else(|| self.receiver.last_commands().map(|c| c.mode))
                .unwrap_or_default(),
            outputs,
            events,
        }
    }
}
