//! Live training sessions and offline renders.
//!
//! ```text
//! # Live, with a synthetic sensor steered from the keyboard
//! forcetone --target 20 --tolerance 2 run
//!
//! # Live, with frames from a BLE bridge on stdin and a one second tare,
//! # sending device commands back through a named pipe
//! ble-bridge --commands /tmp/cmd | forcetone -c session.ron run --source stdin --tare 1 --commands /tmp/cmd
//!
//! # Offline, with a sensor dropout halfway through the first set
//! forcetone --sets 2 render -o session.wav --dropout-at 13 --dropout-length 2
//! ```

use clap::Parser;
use forcetone::{
    args::{CommandTask, ForcetoneArgs, RenderCommand, RunCommand, Source},
    config::SessionFile,
    dummy_sensor::DummySensor,
    force::ForceSensor,
    gui::dashboard,
    output::CpalOutput,
    render::render_session,
    session::SessionController,
    stream_sensor::StreamSensor,
};
use log::{error, info, warn};
use std::{error::Error, fs::OpenOptions, io, process::ExitCode};

fn main() -> ExitCode {
    env_logger::init();
    let args = ForcetoneArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("forcetone: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: ForcetoneArgs) -> Result<(), Box<dyn Error>> {
    let file = args.session.resolve()?;
    match args.command {
        CommandTask::Run(cmd) => live(file, &cmd),
        CommandTask::Render(cmd) => offline(file, &cmd),
    }
}

fn live(file: SessionFile, cmd: &RunCommand) -> Result<(), Box<dyn Error>> {
    let mut controller = SessionController::new(file, CpalOutput::new(cmd.block))?;
    controller.spawn_timer()?;

    let res = match cmd.source {
        Source::Dummy => {
            let mut sensor = DummySensor::builder().level(cmd.start_load).build();
            sensor.attach(controller.force_cell());
            let res = dashboard(&mut controller, Some(&mut sensor));
            sensor.detach();
            res
        }
        Source::Stdin => {
            let mut sensor = StreamSensor::new("stdin", io::stdin());
            if let Some(window) = cmd.tare_window() {
                sensor = sensor.with_tare(window);
            } else if cmd.tare != 0.0 {
                warn!("Ignoring tare window of {} s", cmd.tare);
            }
            if let Some(path) = &cmd.commands {
                let writer = OpenOptions::new().write(true).open(path)?;
                sensor = sensor.with_commands(writer);
            }
            sensor.attach(controller.force_cell());
            let res = dashboard(&mut controller, None);
            if let Some(mv) = sensor.battery_millivolts() {
                info!("Sensor battery was at {mv} mV");
            }
            sensor.detach();
            res
        }
    };

    controller.shutdown();
    res?;
    Ok(())
}

fn offline(file: SessionFile, cmd: &RenderCommand) -> Result<(), Box<dyn Error>> {
    let plan = cmd.plan();
    let summary = render_session(file, &plan, &cmd.outfile)?;
    info!("{} state changes", summary.transitions.len());
    println!(
        "Wrote {}: {:.1} s, {} of {} sets",
        cmd.outfile.display(),
        summary.duration(plan.sample_rate).as_secs_f32(),
        summary.completed_sets,
        file.protocol.set_count
    );
    Ok(())
}
