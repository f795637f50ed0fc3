//! A [`ForceSensor`] fed by raw notification frames on a byte stream.
//!
//! The BLE link itself lives outside this crate. A bridge that subscribes to
//! the load cell's notify characteristic and copies every notification
//! payload, unchanged, onto a pipe or socket is enough to drive a session:
//! frames carry their own length, so no extra framing is needed. Commands for
//! the write characteristic go back the other way on a separate stream, if the
//! bridge offers one.

use crate::force::{ForceCell, ForceSample, ForceSensor};
use crate::progressor::{
    battery_millivolts, describe_response, response_text, Command, Frame, FrameDecoder, SoftTare,
};
use log::{debug, info, warn};
use std::{
    io::{self, ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

/// Zeroes readings against the mean of the first `window` of device time.
#[derive(Debug, Clone)]
pub struct TareFilter {
    window: Duration,
    first: Option<Duration>,
    tare: SoftTare,
    offset: Option<f32>,
}

impl TareFilter {
    /// Averages the readings in the first `window` of device time.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            first: None,
            tare: SoftTare::new(),
            offset: None,
        }
    }

    /// The offset once the window has passed.
    pub fn offset(&self) -> Option<f32> {
        self.offset
    }

    /// Swallows readings inside the tare window, then returns every later
    /// reading with the offset removed.
    pub fn apply(&mut self, sample: ForceSample) -> Option<ForceSample> {
        if let Some(offset) = self.offset {
            return Some(ForceSample {
                load_newtons: sample.load_newtons - offset,
                ..sample
            });
        }

        let first = *self.first.get_or_insert(sample.timestamp);
        if sample.timestamp.saturating_sub(first) < self.window {
            self.tare.push(sample.load_newtons);
            return None;
        }

        let offset = self.tare.offset().unwrap_or(0.0);
        info!(
            "Soft tare settled at {offset:.3} from {} readings",
            self.tare.count()
        );
        self.offset = Some(offset);
        self.apply(sample)
    }
}

/// Decodes notification frames from `R` on a background thread.
pub struct StreamSensor<R> {
    name: String,
    reader: Option<R>,
    tare_window: Option<Duration>,
    commands: Option<Box<dyn Write + Send>>,
    // Query the next command response answers
    pending_query: Arc<Mutex<Option<Command>>>,
    // Millivolts, 0 until the device has reported
    battery: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<R> StreamSensor<R>
where
    R: Read + Send + 'static,
{
    /// A sensor reading frames from `reader`.
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader: Some(reader),
            tare_window: None,
            commands: None,
            pending_query: Arc::new(Mutex::new(None)),
            battery: Arc::new(AtomicU32::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Soft-tares against the first `window` of readings before publishing.
    pub fn with_tare(mut self, window: Duration) -> Self {
        self.tare_window = Some(window).filter(|w| !w.is_zero());
        self
    }

    /// Sends device commands to `writer`. Attaching then asks for the battery
    /// voltage and starts weight measurement; detaching stops it.
    pub fn with_commands(mut self, writer: impl Write + Send + 'static) -> Self {
        self.commands = Some(Box::new(writer));
        self
    }

    /// Writes `command` to the device. Replies to queries are logged as they
    /// arrive.
    pub fn send(&mut self, command: Command) -> io::Result<()> {
        let Some(writer) = self.commands.as_mut() else {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "no command stream to the device",
            ));
        };
        if command.expects_response() {
            *self
                .pending_query
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(command);
        }
        writer.write_all(&command.encode())?;
        writer.flush()
    }

    /// Last battery voltage the device reported, in millivolts.
    pub fn battery_millivolts(&self) -> Option<u32> {
        Some(self.battery.load(Ordering::Acquire)).filter(|&mv| mv > 0)
    }

    /// Whether the reader thread has run out of input.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl<R> ForceSensor for StreamSensor<R>
where
    R: Read + Send + 'static,
{
    fn attach(&mut self, cell: Arc<ForceCell>) {
        let Some(mut reader) = self.reader.take() else {
            warn!("{}: stream already consumed, cannot attach again", self.name);
            return;
        };
        if self.commands.is_some() {
            for command in [Command::GetBatteryVoltage, Command::StartWeightMeasurement] {
                if let Err(e) = self.send(command) {
                    warn!("{}: could not send {command:?}: {e}", self.name);
                }
            }
        }

        let name = self.name.clone();
        let stop = Arc::clone(&self.stop);
        let pending_query = Arc::clone(&self.pending_query);
        let battery = Arc::clone(&self.battery);
        let mut tare = self.tare_window.map(TareFilter::new);

        self.handle = Some(thread::spawn(move || {
            let mut buffer = [0; 256];
            let mut decoder = FrameDecoder::new();

            while !stop.load(Ordering::Acquire) {
                let read_len = match reader.read(&mut buffer) {
                    Ok(0) => {
                        info!("{name}: end of stream");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("{name}: read failed: {e}");
                        break;
                    }
                };

                decoder.push(&buffer[..read_len]);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok(Frame::Weights(samples)) => {
                            for sample in samples {
                                let sample = match tare.as_mut() {
                                    Some(tare) => tare.apply(sample),
                                    None => Some(sample),
                                };
                                if let Some(sample) = sample {
                                    cell.ingest(sample);
                                }
                            }
                        }
                        Ok(Frame::CommandResponse(payload)) => {
                            let query = pending_query
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .take();
                            if query == Some(Command::GetBatteryVoltage) {
                                if let Some(mv) = battery_millivolts(&payload) {
                                    battery.store(mv, Ordering::Release);
                                }
                            }
                            match describe_response(query, &payload) {
                                Some(text) => info!("{name}: {text}"),
                                None => debug!(
                                    "{name}: command response {:?}",
                                    response_text(&payload).unwrap_or("<binary>")
                                ),
                            }
                        }
                        Ok(Frame::LowPower) => warn!("{name}: low power warning"),
                        // Often happens right after connecting, with a partial frame in flight
                        Err(e) => warn!("{name}: dropped frame: {e}"),
                    }
                }
            }
        }));
    }

    fn detach(&mut self) {
        if self.commands.is_some() && self.handle.is_some() {
            if let Err(e) = self.send(Command::StopWeightMeasurement) {
                warn!("{}: could not stop measurement: {e}", self.name);
            }
        }
        self.stop.store(true, Ordering::Release);
        // A blocked read cannot be interrupted; the thread exits after its next read
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("{}: reader thread panicked", self.name);
                }
            } else {
                debug!("{}: leaving reader thread to finish its read", self.name);
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
