//! A synthetic load cell: publishes a steady level plus uniform jitter at a
//! fixed rate from its own thread. Useful for demos without hardware and for
//! exercising the staleness path (see [`DummySensor::pause`]).

use crate::force::{ForceCell, ForceSample, ForceSensor};
use log::{debug, warn};
use rand::prelude::*;
use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

enum Signal {
    Level(f32),
    Noise(f32),
    Pause(bool),
    Stop,
}

/// Settings for a [`DummySensor`].
#[derive(Debug, Clone, Copy)]
pub struct DummySensorBuilder {
    level: f32,
    noise: f32,
    rate_hz: f32,
}

impl Default for DummySensorBuilder {
    fn default() -> Self {
        Self {
            level: 0.0,
            noise: 0.05,
            rate_hz: 80.0,
        }
    }
}

impl DummySensorBuilder {
    /// Load the sensor reports around.
    pub fn level(mut self, level: f32) -> Self {
        self.level = level;
        self
    }

    /// Peak jitter added to every reading.
    pub fn noise(mut self, noise: f32) -> Self {
        self.noise = noise.abs();
        self
    }

    /// Readings per second.
    pub fn rate_hz(mut self, rate_hz: f32) -> Self {
        self.rate_hz = rate_hz;
        self
    }

    /// Builds a detached sensor.
    pub fn build(self) -> DummySensor {
        DummySensor {
            settings: self,
            handle: None,
            tx: None,
        }
    }
}

/// A [`ForceSensor`] that makes its readings up.
pub struct DummySensor {
    settings: DummySensorBuilder,
    handle: Option<thread::JoinHandle<()>>,
    tx: Option<mpsc::Sender<Signal>>,
}

impl DummySensor {
    /// Starts configuring a dummy sensor.
    pub fn builder() -> DummySensorBuilder {
        DummySensorBuilder::default()
    }

    /// Current nominal level.
    pub fn level(&self) -> f32 {
        self.settings.level
    }

    /// Moves the nominal level.
    pub fn set_level(&mut self, level: f32) {
        self.settings.level = level;
        self.send(Signal::Level(level));
    }

    /// Moves the nominal level by `delta`.
    pub fn nudge(&mut self, delta: f32) {
        self.set_level(self.settings.level + delta);
    }

    /// Changes the jitter amplitude.
    pub fn set_noise(&mut self, noise: f32) {
        self.settings.noise = noise.abs();
        self.send(Signal::Noise(noise.abs()));
    }

    /// Stops publishing without detaching, as a dropped radio link would.
    pub fn pause(&self, paused: bool) {
        self.send(Signal::Pause(paused));
    }

    fn send(&self, signal: Signal) {
        if let Some(tx) = &self.tx {
            if tx.send(signal).is_err() {
                warn!("Dummy sensor thread is gone");
            }
        }
    }
}

impl ForceSensor for DummySensor {
    fn attach(&mut self, cell: Arc<ForceCell>) {
        self.detach();

        let (tx, rx) = mpsc::channel::<Signal>();
        let DummySensorBuilder {
            mut level,
            mut noise,
            rate_hz,
        } = self.settings;
        let period = Duration::from_secs_f32(1.0 / rate_hz.max(1.0));

        let handle = thread::spawn(move || {
            let mut rng = thread_rng();
            let started = Instant::now();
            let mut paused = false;
            loop {
                while let Ok(received) = rx.try_recv() {
                    match received {
                        Signal::Level(new_level) => level = new_level,
                        Signal::Noise(new_noise) => noise = new_noise,
                        Signal::Pause(new_paused) => paused = new_paused,
                        Signal::Stop => return,
                    }
                }
                if !paused {
                    let jitter = if noise > 0.0 {
                        rng.gen_range(-noise..noise)
                    } else {
                        0.0
                    };
                    let micros = started.elapsed().as_micros() as u32;
                    cell.ingest(ForceSample::new(micros, level + jitter));
                }
                spin_sleep::sleep(period);
            }
        });

        debug!("Dummy sensor attached at {rate_hz} Hz");
        self.handle = Some(handle);
        self.tx = Some(tx);
    }

    fn detach(&mut self) {
        self.send(Signal::Stop);
        self.tx = None;
        // Joining needs the handle by value, so it has to come out of the struct
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                warn!("Dummy sensor thread panicked");
            }
        }
    }

    fn name(&self) -> &str {
        "dummy"
    }
}

impl Drop for DummySensor {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for(cell: &ForceCell, pred: impl Fn(f32) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cell.latest().map_or(false, |s| pred(s.load_newtons)) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn publishes_around_the_level() {
        let cell = Arc::new(ForceCell::new());
        let mut sensor = DummySensor::builder()
            .level(20.0)
            .noise(0.5)
            .rate_hz(200.0)
            .build();
        sensor.attach(Arc::clone(&cell));
        assert!(wait_for(&cell, |load| (19.5..=20.5).contains(&load)));

        sensor.nudge(10.0);
        assert_eq!(sensor.level(), 30.0);
        assert!(wait_for(&cell, |load| (29.5..=30.5).contains(&load)));
        sensor.detach();
    }

    #[test]
    fn pause_lets_the_cell_go_stale() {
        let cell = Arc::new(ForceCell::new());
        let mut sensor = DummySensor::builder().level(5.0).rate_hz(200.0).build();
        sensor.attach(Arc::clone(&cell));
        assert!(wait_for(&cell, |_| true));

        sensor.pause(true);
        thread::sleep(Duration::from_millis(100));
        let age = cell.age_since_last().unwrap();
        assert!(age >= Duration::from_millis(50), "age was {age:?}");

        sensor.pause(false);
        thread::sleep(Duration::from_millis(50));
        assert!(cell.age_since_last().unwrap() < Duration::from_millis(100));
    }

    #[test]
    fn detached_sensor_stops_writing() {
        let cell = Arc::new(ForceCell::new());
        let mut sensor = DummySensor::builder().rate_hz(200.0).build();
        sensor.attach(Arc::clone(&cell));
        assert!(wait_for(&cell, |_| true));
        sensor.detach();

        let before = cell.latest();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cell.latest(), before);
    }
}
