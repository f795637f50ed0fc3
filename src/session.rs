//! The single call surface the UI layer talks to.
//!
//! [`SessionController`] owns the force cell, the arm cell, the protocol
//! machine and the audio output, checks configuration before anything moves,
//! and otherwise just forwards.

use crate::arm::ArmCell;
use crate::config::{EngineTuning, ProtocolConfig, SessionFile, SonificationConfig};
use crate::engine::EngineSpec;
use crate::error::{ConfigurationError, SessionError};
use crate::force::{ForceCell, ForceSample};
use crate::output::{AudioOutput, DeviceFault};
use crate::protocol::{ProtocolMachine, ProtocolState, ProtocolTimer};
use log::info;
use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// What the dashboard shows.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// Protocol state
    pub state: ProtocolState,
    /// Set being worked or rested, if any
    pub current_set_index: Option<u32>,
    /// Time until the state changes on its own
    pub time_remaining: Duration,
    /// Work intervals finished in this run
    pub completed_sets: u32,
    /// Sets in this run
    pub set_count: u32,
    /// Working, but the sensor has gone quiet and feedback is muted
    pub sensor_stale: bool,
    /// Newest force reading
    pub latest: Option<ForceSample>,
    /// Window feedback is currently, or was last, armed against
    pub sonification: SonificationConfig,
    /// Why the last session ended early
    pub last_error: Option<String>,
}

/// Facade over the session core, generic over where the audio goes.
pub struct SessionController<O> {
    machine: Arc<Mutex<ProtocolMachine>>,
    force: Arc<ForceCell>,
    arm: Arc<ArmCell>,
    fault: Arc<DeviceFault>,
    tuning: EngineTuning,
    output: O,
    timer: Option<ProtocolTimer>,
}

impl<O> SessionController<O>
where
    O: AudioOutput,
{
    /// A controller with the given starting configuration. The output is not
    /// opened until the first start.
    pub fn new(file: SessionFile, output: O) -> Result<Self, ConfigurationError> {
        file.tuning.validate()?;
        let arm = Arc::new(ArmCell::new(file.sonification));
        let mut machine = ProtocolMachine::new(file.protocol, file.sonification, Arc::clone(&arm));
        machine.configure(file.protocol, file.sonification)?;

        Ok(Self {
            machine: Arc::new(Mutex::new(machine)),
            force: Arc::new(ForceCell::new()),
            arm,
            fault: Arc::new(DeviceFault::default()),
            tuning: file.tuning,
            output,
            timer: None,
        })
    }

    /// The cell sensors should publish into.
    pub fn force_cell(&self) -> Arc<ForceCell> {
        Arc::clone(&self.force)
    }

    /// Records a reading from the transport. Safe to call from any thread
    /// through [`SessionController::force_cell`].
    pub fn ingest(&self, sample: ForceSample) {
        self.force.ingest(sample);
    }

    /// Newest force reading.
    pub fn latest(&self) -> Option<ForceSample> {
        self.force.latest()
    }

    /// The engine tuning in use.
    pub fn tuning(&self) -> EngineTuning {
        self.tuning
    }

    /// The audio output.
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    fn machine(&self) -> MutexGuard<'_, ProtocolMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the protocol and sonification settings. Rejected values
    /// leave everything, including a session in progress, untouched.
    pub fn configure(
        &self,
        protocol: ProtocolConfig,
        sonification: SonificationConfig,
    ) -> Result<(), ConfigurationError> {
        self.machine().configure(protocol, sonification)
    }

    /// Settings the next start will use.
    pub fn requested(&self) -> (ProtocolConfig, SonificationConfig) {
        self.machine().requested()
    }

    /// Starts a session now.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.start_at(Instant::now())
    }

    /// Starts a session at `now`: checks the configuration, makes sure the
    /// output is playing, then enters the countdown.
    pub fn start_at(&mut self, now: Instant) -> Result<(), SessionError> {
        let mut machine = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        if machine.state().is_active() {
            return Err(SessionError::AlreadyActive);
        }
        let (protocol, sonification) = machine.requested();
        protocol.validate()?;
        sonification.validate()?;

        if self.fault.has_tripped() {
            self.output.close();
        }
        if !self.output.is_open() {
            self.fault.reset();
            let spec = EngineSpec {
                tuning: self.tuning,
                force: Arc::clone(&self.force),
                arm: Arc::clone(&self.arm),
            };
            if let Err(e) = self.output.open(spec, Arc::clone(&self.fault)) {
                machine.fail(now, &e);
                return Err(e.into());
            }
        }

        machine.start(now)?;
        info!(
            "Session started: {} sets, target {} ± {}",
            protocol.set_count, sonification.target_load, sonification.tolerance
        );
        Ok(())
    }

    /// Stops the session now.
    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    /// Returns to idle at `now`. Feedback is disarmed before this returns, so
    /// the next audio block is already heading to silence.
    pub fn stop_at(&mut self, now: Instant) {
        self.machine().stop(now);
    }

    /// Advances the protocol to `now`, first aborting the session if the
    /// output has failed. Only needed when no timer thread is running.
    pub fn tick_at(&mut self, now: Instant) -> Vec<ProtocolState> {
        let mut machine = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(error) = self.fault.take() {
            machine.fail(now, error);
        }
        machine.tick(now)
    }

    /// Starts a background thread ticking the protocol at the tuned period.
    pub fn spawn_timer(&mut self) -> io::Result<()> {
        if self.timer.is_none() {
            self.timer = Some(ProtocolTimer::spawn(
                Arc::clone(&self.machine),
                Arc::clone(&self.fault),
                self.tuning.tick,
            )?);
        }
        Ok(())
    }

    /// Status now.
    pub fn status(&self) -> SessionStatus {
        self.status_at(Instant::now())
    }

    /// Status as seen at `now`.
    pub fn status_at(&self, now: Instant) -> SessionStatus {
        let machine = self.machine();
        let protocol = machine.status(now);
        let arm = self.arm.snapshot();
        SessionStatus {
            state: protocol.state,
            current_set_index: protocol.state.set_index(),
            time_remaining: protocol.time_remaining,
            completed_sets: protocol.completed_sets,
            set_count: protocol.set_count,
            sensor_stale: protocol.state.is_armed()
                && self.force.is_stale_at(now, self.tuning.stale_after),
            latest: self.force.latest(),
            sonification: arm.config,
            last_error: machine.last_error().map(str::to_owned),
        }
    }

    /// Stops the session, the timer and the output.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        self.output.close();
    }
}
