//! The exercise protocol: countdown, then alternating work and rest intervals
//! for a fixed number of sets.
//!
//! ```text
//! Idle --start--> Countdown --> Working(1) --> Resting(1) --> Working(2) ...
//!                             ... --> Resting(set_count) --> Complete
//! any state --stop--> Idle
//! ```
//!
//! The machine is the only writer of the [`ArmCell`]: entering `Working`
//! arms feedback, entering anything else disarms it. Time only moves when
//! [`ProtocolMachine::tick`] is called with a monotonic instant, normally by
//! a [`ProtocolTimer`].

use crate::arm::ArmCell;
use crate::config::{ProtocolConfig, SonificationConfig};
use crate::error::{ConfigurationError, SessionError};
use crate::output::DeviceFault;
use log::{info, warn};
use std::{
    fmt::Display,
    io,
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

/// Where in the protocol we are. Set indices are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolState {
    /// Nothing running
    #[default]
    Idle,
    /// Lead-in before the first set
    Countdown,
    /// Holding the target during set `n`
    Working(u32),
    /// Recovering after set `n`
    Resting(u32),
    /// Every set done
    Complete,
}

impl ProtocolState {
    /// The set this state belongs to, if any.
    pub fn set_index(&self) -> Option<u32> {
        match *self {
            ProtocolState::Working(n) | ProtocolState::Resting(n) => Some(n),
            _ => None,
        }
    }

    /// Counting down, working or resting.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProtocolState::Countdown | ProtocolState::Working(_) | ProtocolState::Resting(_)
        )
    }

    /// Feedback is allowed to sound.
    pub fn is_armed(&self) -> bool {
        matches!(self, ProtocolState::Working(_))
    }
}

impl Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolState::Idle => write!(f, "idle"),
            ProtocolState::Countdown => write!(f, "countdown"),
            ProtocolState::Working(n) => write!(f, "work {n}"),
            ProtocolState::Resting(n) => write!(f, "rest {n}"),
            ProtocolState::Complete => write!(f, "complete"),
        }
    }
}

/// A read-only view of the machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolStatus {
    /// Current state
    pub state: ProtocolState,
    /// Time until the current state expires, zero when it never does
    pub time_remaining: Duration,
    /// Work intervals finished in this run
    pub completed_sets: u32,
    /// Sets in this run
    pub set_count: u32,
}

/// Time-driven protocol state machine.
#[derive(Debug)]
pub struct ProtocolMachine {
    state: ProtocolState,
    entered_at: Instant,
    // Config of the run in progress
    protocol: ProtocolConfig,
    // Latest accepted configs, picked up at the next start or work interval
    next_protocol: ProtocolConfig,
    next_sonification: SonificationConfig,
    completed_sets: u32,
    arm: Arc<ArmCell>,
    last_error: Option<String>,
}

impl ProtocolMachine {
    /// An idle machine publishing into `arm`.
    pub fn new(
        protocol: ProtocolConfig,
        sonification: SonificationConfig,
        arm: Arc<ArmCell>,
    ) -> Self {
        arm.disarm();
        Self {
            state: ProtocolState::Idle,
            entered_at: Instant::now(),
            protocol,
            next_protocol: protocol,
            next_sonification: sonification,
            completed_sets: 0,
            arm,
            last_error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Configs the next start will use.
    pub fn requested(&self) -> (ProtocolConfig, SonificationConfig) {
        (self.next_protocol, self.next_sonification)
    }

    /// Why the last session was cut short, if it was.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Accepts new configs. Invalid values are rejected and nothing changes.
    ///
    /// A running session keeps its protocol until the next start; the
    /// sonification window is picked up when the next work interval begins.
    pub fn configure(
        &mut self,
        protocol: ProtocolConfig,
        sonification: SonificationConfig,
    ) -> Result<(), ConfigurationError> {
        protocol.validate()?;
        sonification.validate()?;
        self.next_protocol = protocol;
        self.next_sonification = sonification;
        Ok(())
    }

    /// Begins a run from `Idle` or `Complete`.
    pub fn start(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        self.next_protocol.validate()?;
        self.next_sonification.validate()?;

        self.protocol = self.next_protocol;
        self.completed_sets = 0;
        self.last_error = None;
        self.enter(ProtocolState::Countdown, now);
        Ok(())
    }

    /// Returns to `Idle` from anywhere, disarming before it returns.
    pub fn stop(&mut self, now: Instant) {
        if self.state != ProtocolState::Idle {
            self.enter(ProtocolState::Idle, now);
        }
    }

    /// Ends the session because of `reason`, keeping it for the status line.
    pub fn fail(&mut self, now: Instant, reason: impl Display) {
        warn!("Session aborted in {}: {}", self.state, reason);
        self.stop(now);
        self.last_error = Some(reason.to_string());
    }

    /// Applies every expiry up to `now` and returns the states entered, in
    /// order. Deadlines chain, so a late tick catches up without drift.
    pub fn tick(&mut self, now: Instant) -> Vec<ProtocolState> {
        let mut entered = Vec::new();
        while let Some(duration) = self.duration_of(self.state) {
            // A deadline past the end of the clock never arrives
            let Some(deadline) = self.entered_at.checked_add(duration) else {
                break;
            };
            if now < deadline {
                break;
            }
            let next = self.successor();
            self.enter(next, deadline);
            entered.push(next);
        }
        entered
    }

    /// Snapshot for the UI.
    pub fn status(&self, now: Instant) -> ProtocolStatus {
        let time_remaining = self
            .duration_of(self.state)
            .map(|d| match self.entered_at.checked_add(d) {
                Some(deadline) => deadline.saturating_duration_since(now),
                None => Duration::MAX,
            })
            .unwrap_or_default();
        ProtocolStatus {
            state: self.state,
            time_remaining,
            completed_sets: self.completed_sets,
            set_count: self.protocol.set_count,
        }
    }

    fn duration_of(&self, state: ProtocolState) -> Option<Duration> {
        match state {
            ProtocolState::Countdown => Some(self.protocol.countdown_duration),
            ProtocolState::Working(_) => Some(self.protocol.work_duration),
            ProtocolState::Resting(_) => Some(self.protocol.rest_duration),
            ProtocolState::Idle | ProtocolState::Complete => None,
        }
    }

    fn successor(&self) -> ProtocolState {
        match self.state {
            ProtocolState::Countdown => ProtocolState::Working(1),
            ProtocolState::Working(n) => ProtocolState::Resting(n),
            ProtocolState::Resting(n) if n < self.protocol.set_count => {
                ProtocolState::Working(n + 1)
            }
            ProtocolState::Resting(_) => ProtocolState::Complete,
            other => other,
        }
    }

    fn enter(&mut self, next: ProtocolState, at: Instant) {
        match next {
            ProtocolState::Working(n) => self.arm.arm(self.next_sonification, n),
            _ => self.arm.disarm(),
        }
        if let ProtocolState::Resting(n) = next {
            self.completed_sets = n;
        }
        info!("Protocol {} -> {}", self.state, next);
        self.state = next;
        self.entered_at = at;
    }
}

enum Signal {
    Stop,
}

/// Background thread ticking a shared [`ProtocolMachine`] at a fixed period.
///
/// Each tick first checks the [`DeviceFault`] and aborts the session if the
/// audio output reported a failure.
pub struct ProtocolTimer {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
}

impl ProtocolTimer {
    /// Starts ticking `machine` every `period`.
    pub fn spawn(
        machine: Arc<Mutex<ProtocolMachine>>,
        fault: Arc<DeviceFault>,
        period: Duration,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Signal>();
        let handle = thread::Builder::new()
            .name("protocol-timer".into())
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    next += period;
                    spin_sleep::sleep(next.saturating_duration_since(Instant::now()));
                    if let Ok(Signal::Stop) | Err(mpsc::TryRecvError::Disconnected) = rx.try_recv()
                    {
                        break;
                    }

                    let now = Instant::now();
                    let mut machine = machine.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(error) = fault.take() {
                        machine.fail(now, error);
                    }
                    machine.tick(now);
                }
            })?;

        Ok(Self {
            handle: Some(handle),
            tx,
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Protocol timer panicked");
            }
        }
    }
}

impl Drop for ProtocolTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use ProtocolState::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn three_sets() -> ProtocolConfig {
        ProtocolConfig {
            work_duration: secs(7),
            rest_duration: secs(20),
            set_count: 3,
            countdown_duration: secs(10),
        }
    }

    fn window() -> SonificationConfig {
        SonificationConfig {
            target_load: 20.0,
            tolerance: 2.0,
        }
    }

    fn machine() -> (ProtocolMachine, Arc<ArmCell>) {
        let arm = Arc::new(ArmCell::new(window()));
        (
            ProtocolMachine::new(three_sets(), window(), Arc::clone(&arm)),
            arm,
        )
    }

    #[test]
    fn endless_work_interval_never_expires() {
        let arm = Arc::new(ArmCell::new(window()));
        let endless = ProtocolConfig {
            work_duration: Duration::MAX,
            ..three_sets()
        };
        let mut m = ProtocolMachine::new(endless, window(), arm);
        let t0 = Instant::now();
        m.start(t0).unwrap();
        assert_eq!(m.tick(t0 + secs(10)), vec![Working(1)]);
        assert!(m.tick(t0 + secs(1_000_000)).is_empty());
        assert_eq!(m.status(t0 + secs(20)).time_remaining, Duration::MAX);
    }

    #[test]
    fn full_run_visits_every_state_in_order() {
        let (mut m, arm) = machine();
        let t0 = Instant::now();
        let mut visited = vec![m.state()];
        m.start(t0).unwrap();
        visited.push(m.state());

        // Tick every 100ms through the whole protocol and a bit beyond
        let mut armed_entries = 0;
        for step in 1..=(100 * 10 + 10 * 10) {
            let now = t0 + Duration::from_millis(step * 100);
            for state in m.tick(now) {
                if state.is_armed() {
                    armed_entries += 1;
                }
                visited.push(state);
            }
            assert_eq!(arm.is_armed(), m.state().is_armed());
        }

        assert_eq!(
            visited,
            vec![
                Idle,
                Countdown,
                Working(1),
                Resting(1),
                Working(2),
                Resting(2),
                Working(3),
                Resting(3),
                Complete
            ]
        );
        assert_eq!(armed_entries, 3);
        assert!(!arm.is_armed());
        assert_eq!(m.status(t0 + secs(1000)).completed_sets, 3);
    }

    #[test]
    fn transitions_happen_at_their_deadlines() {
        let (mut m, arm) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();

        assert!(m.tick(t0 + Duration::from_millis(9_999)).is_empty());
        assert!(!arm.is_armed());
        assert_eq!(m.tick(t0 + secs(10)), vec![Working(1)]);
        assert!(arm.is_armed());
        assert_eq!(arm.snapshot().set_index, 1);
        assert_eq!(m.tick(t0 + secs(17)), vec![Resting(1)]);
        assert!(!arm.is_armed());
    }

    #[test]
    fn late_tick_catches_up() {
        let (mut m, _) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();
        // countdown 10 + work 7 + rest 20 + 3s into work 2
        assert_eq!(
            m.tick(t0 + secs(40)),
            vec![Working(1), Resting(1), Working(2)]
        );
        let status = m.status(t0 + secs(40));
        assert_eq!(status.state, Working(2));
        assert_eq!(status.time_remaining, secs(4));
        assert_eq!(status.completed_sets, 1);
    }

    #[test]
    fn stop_from_work_disarms_immediately() {
        let (mut m, arm) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();
        m.tick(t0 + secs(40));
        assert_eq!(m.state(), Working(2));
        assert!(arm.is_armed());

        m.stop(t0 + secs(41));
        assert_eq!(m.state(), Idle);
        assert!(!arm.is_armed());
        assert!(m.tick(t0 + secs(1000)).is_empty());
        assert_eq!(m.status(t0 + secs(1000)).time_remaining, Duration::ZERO);
    }

    #[test]
    fn stop_works_from_every_state() {
        let t0 = Instant::now();
        for at in [0, 5, 12, 20, 1000] {
            let (mut m, arm) = machine();
            m.start(t0).unwrap();
            m.tick(t0 + secs(at));
            m.stop(t0 + secs(at));
            assert_eq!(m.state(), Idle);
            assert!(!arm.is_armed());
        }
    }

    #[test]
    fn start_while_active_is_refused() {
        let (mut m, _) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();
        assert!(matches!(m.start(t0), Err(SessionError::AlreadyActive)));
        m.tick(t0 + secs(12));
        assert!(matches!(m.start(t0), Err(SessionError::AlreadyActive)));
    }

    #[test]
    fn complete_restarts_into_countdown() {
        let (mut m, _) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();
        m.tick(t0 + secs(1000));
        assert_eq!(m.state(), Complete);

        m.start(t0 + secs(1001)).unwrap();
        assert_eq!(m.state(), Countdown);
        assert_eq!(m.status(t0 + secs(1001)).completed_sets, 0);
    }

    #[test]
    fn invalid_configure_leaves_the_run_alone() {
        let (mut m, arm) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();
        m.tick(t0 + secs(12));

        let bad = SonificationConfig {
            target_load: 20.0,
            tolerance: 0.0,
        };
        assert_eq!(
            m.configure(three_sets(), bad),
            Err(ConfigurationError::NonPositiveTolerance(0.0))
        );
        assert_eq!(m.state(), Working(1));
        assert!(arm.is_armed());
        assert_eq!(arm.snapshot().config, window());
        assert_eq!(m.requested(), (three_sets(), window()));
    }

    #[test]
    fn new_window_applies_at_the_next_work_interval() {
        let (mut m, arm) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();
        m.tick(t0 + secs(12));

        let heavier = SonificationConfig {
            target_load: 30.0,
            tolerance: 3.0,
        };
        m.configure(three_sets(), heavier).unwrap();
        assert_eq!(arm.snapshot().config, window());

        m.tick(t0 + secs(37));
        assert_eq!(m.state(), Working(2));
        assert_eq!(arm.snapshot().config, heavier);
    }

    #[test]
    fn failure_is_remembered_until_the_next_start() {
        let (mut m, arm) = machine();
        let t0 = Instant::now();
        m.start(t0).unwrap();
        m.tick(t0 + secs(12));

        m.fail(t0 + secs(13), DeviceError::StreamLost("unplugged".into()));
        assert_eq!(m.state(), Idle);
        assert!(!arm.is_armed());
        assert_eq!(m.last_error(), Some("audio stream lost: unplugged"));

        m.start(t0 + secs(14)).unwrap();
        assert_eq!(m.last_error(), None);
    }

    #[test]
    fn timer_thread_ticks_and_aborts_on_fault() {
        let (m, arm) = machine();
        let machine = Arc::new(Mutex::new(ProtocolMachine {
            protocol: ProtocolConfig {
                countdown_duration: Duration::from_millis(20),
                ..three_sets()
            },
            next_protocol: ProtocolConfig {
                countdown_duration: Duration::from_millis(20),
                ..three_sets()
            },
            ..m
        }));
        let fault = Arc::new(DeviceFault::default());
        let mut timer = ProtocolTimer::spawn(
            Arc::clone(&machine),
            Arc::clone(&fault),
            Duration::from_millis(5),
        )
        .unwrap();

        machine.lock().unwrap().start(Instant::now()).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(machine.lock().unwrap().state(), Working(1));
        assert!(arm.is_armed());

        fault.raise(DeviceError::StreamLost("gone".into()));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(machine.lock().unwrap().state(), Idle);
        assert!(!arm.is_armed());

        timer.stop();
    }
}
