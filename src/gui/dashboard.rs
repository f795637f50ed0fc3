use std::{
    io::stdout,
    time::{Duration, Instant},
};

use crate::dummy_sensor::DummySensor;
use crate::error::SessionError;
use crate::gui::{error::DashboardError, history::ForceHistory, settings::SettingsEditor};
use crate::output::AudioOutput;
use crate::protocol::ProtocolState;
use crate::session::{SessionController, SessionStatus};

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use log::warn;
use ratatui::{
    prelude::*,
    widgets::{
        block::Title,
        *,
    },
    Terminal,
};

const ORANGE: Color = Color::Rgb(255, 140, 0);
const REFRESH: Duration = Duration::from_millis(33);
const HISTORY_SECONDS: f64 = 10.0;

/// Something the user asked for from the keyboard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Start a session
    Start,
    /// Stop the session
    Stop,
    /// Leave the dashboard
    Quit,
    /// Move the dummy sensor's level by this many tolerances
    Nudge(f32),
    /// Move the settings selection by this many places
    Select(i32),
    /// Change the selected setting by this many notches
    Adjust(i32),
}

impl Action {
    /// The action bound to `key`, if any.
    pub fn from_key(key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Char('s') | KeyCode::Enter => Some(Action::Start),
            KeyCode::Char('x') | KeyCode::Char(' ') => Some(Action::Stop),
            KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
            KeyCode::Up => Some(Action::Nudge(0.5)),
            KeyCode::Down => Some(Action::Nudge(-0.5)),
            KeyCode::PageUp => Some(Action::Nudge(5.0)),
            KeyCode::PageDown => Some(Action::Nudge(-5.0)),
            KeyCode::Tab => Some(Action::Select(1)),
            KeyCode::BackTab => Some(Action::Select(-1)),
            KeyCode::Char('+') | KeyCode::Char('=') | KeyCode::Char(']') => {
                Some(Action::Adjust(1))
            }
            KeyCode::Char('-') | KeyCode::Char('[') => Some(Action::Adjust(-1)),
            _ => None,
        }
    }
}

/// `mm:ss`, rounding up so a fresh ten second countdown reads `00:10`.
pub fn mm_ss(duration: Duration) -> String {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Orange while counting down, green while working, red while resting.
pub fn state_colour(state: ProtocolState) -> Color {
    match state {
        ProtocolState::Countdown => ORANGE,
        ProtocolState::Working(_) => Color::Green,
        ProtocolState::Resting(_) => Color::Red,
        ProtocolState::Idle | ProtocolState::Complete => Color::Gray,
    }
}

fn state_label(status: &SessionStatus) -> String {
    match status.state {
        ProtocolState::Idle => "READY".into(),
        ProtocolState::Countdown => "GET SET".into(),
        ProtocolState::Working(n) => format!("WORK {n}/{}", status.set_count),
        ProtocolState::Resting(n) => format!("REST {n}/{}", status.set_count),
        ProtocolState::Complete => "DONE".into(),
    }
}

/// Draws one frame of the dashboard.
pub fn draw(
    frame: &mut Frame,
    status: &SessionStatus,
    history: &mut ForceHistory,
    settings: &SettingsEditor,
    notice: Option<&str>,
) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(frame.size());

    let colour = state_colour(status.state);
    let bold = Style::default().fg(colour).add_modifier(Modifier::BOLD);
    let mut header = vec![
        Span::styled(format!(" {} ", state_label(status)), bold),
        Span::styled(mm_ss(status.time_remaining), bold),
        "   load ".into(),
        match status.latest {
            Some(sample) => Span::styled(
                format!("{:6.2}", sample.load_newtons),
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ),
            None => "  --  ".dark_gray(),
        },
        format!(
            "   target {} ± {}",
            status.sonification.target_load, status.sonification.tolerance
        )
        .into(),
    ];
    if status.sensor_stale {
        header.push("   SENSOR STALE".red().bold());
    }
    let timer = Paragraph::new(Line::from(header)).block(
        Block::default()
            .title(Title::from(" forcetone ".magenta().bold()).alignment(Alignment::Center))
            .borders(Borders::ALL),
    );
    frame.render_widget(timer, rows[0]);

    let ratio = if status.set_count == 0 {
        0.0
    } else {
        (status.completed_sets as f64 / status.set_count as f64).clamp(0.0, 1.0)
    };
    let sets = Gauge::default()
        .block(Block::default().title(" Completed sets ").borders(Borders::ALL))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio)
        .label(format!("{} / {}", status.completed_sets, status.set_count));
    frame.render_widget(sets, rows[1]);

    let target = status.sonification.target_load as f64;
    let tolerance = status.sonification.tolerance as f64;
    let [x0, x1] = history.x_bounds();
    let band = |load: f64| vec![(x0, load), (x1, load)];
    let (upper, centre, lower) = (
        band(target + tolerance),
        band(target),
        band(target - tolerance),
    );
    let y_max = history
        .peak()
        .unwrap_or(0.0)
        .max(target + 2.0 * tolerance)
        .max(1.0)
        * 1.1;
    let y_min = history.trough().unwrap_or(0.0).min(0.0);
    let points = history.points();

    let chart = Chart::new(vec![
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::DarkGray))
            .data(&upper),
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Yellow))
            .data(&centre),
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::DarkGray))
            .data(&lower),
        Dataset::default()
            .name("load")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(colour))
            .data(points),
    ])
    .block(Block::default().title(" Force ").borders(Borders::ALL))
    .x_axis(
        Axis::default()
            .style(Style::default().fg(Color::White))
            .bounds([x0, x1])
            .labels(vec![
                Span::from(format!("-{HISTORY_SECONDS:.0}s")),
                Span::from("now"),
            ]),
    )
    .y_axis(
        Axis::default()
            .style(Style::default().fg(Color::White))
            .bounds([y_min, y_max])
            .labels(vec![
                Span::from(format!("{y_min:.0}")),
                Span::from(format!("{target:.0}")),
                Span::from(format!("{y_max:.0}")),
            ]),
    );
    frame.render_widget(chart, rows[2]);
    frame.render_widget(Paragraph::new(settings.line()), rows[3]);

    let mut footer = vec![
        " Start ".into(),
        "<S>".magenta().bold(),
        " Stop ".into(),
        "<X>".magenta().bold(),
        " Quit ".into(),
        "<Q>".magenta().bold(),
        " Load ".into(),
        "<Up>/<Down> ".magenta().bold(),
    ];
    if let Some(error) = notice.or(status.last_error.as_deref()) {
        footer.push(Span::styled(format!(" {error}"), Style::default().fg(Color::Red)));
    }
    frame.render_widget(
        Paragraph::new(Line::from(footer)).alignment(Alignment::Left),
        rows[4],
    );
}

/// Runs the dashboard on the terminal until the user quits. With a dummy
/// sensor, the arrow keys move its level. Between sessions the settings line
/// changes what the next start uses.
pub fn dashboard<O>(
    controller: &mut SessionController<O>,
    mut dummy: Option<&mut DummySensor>,
) -> Result<(), DashboardError>
where
    O: AudioOutput,
{
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let res = run_dashboard(&mut terminal, controller, &mut dummy);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    res
}

fn run_dashboard<B, O>(
    terminal: &mut Terminal<B>,
    controller: &mut SessionController<O>,
    dummy: &mut Option<&mut DummySensor>,
) -> Result<(), DashboardError>
where
    B: Backend,
    O: AudioOutput,
{
    let opened = Instant::now();
    let mut history = ForceHistory::new(HISTORY_SECONDS, 4096);
    let mut last_seen = None;
    let mut notice: Option<String> = None;
    let mut settings = SettingsEditor::new(&*controller);

    loop {
        let status = controller.status();
        if status.latest != last_seen {
            if let Some(sample) = status.latest {
                history.push(opened.elapsed().as_secs_f64(), sample.load_newtons as f64);
            }
            last_seen = status.latest;
        }
        terminal.draw(|frame| {
            draw(
                frame,
                &status,
                &mut history,
                &settings,
                notice.as_deref(),
            )
        })?;

        if !event::poll(REFRESH)? {
            continue;
        }
        let event::Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match Action::from_key(key.code) {
            Some(Action::Start) => {
                notice = match controller.start() {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("Could not start: {e}");
                        Some(e.to_string())
                    }
                };
            }
            Some(Action::Stop) => controller.stop(),
            Some(Action::Quit) => return Ok(()),
            Some(Action::Select(by)) => settings.select(by),
            Some(Action::Adjust(steps)) => notice = adjust(&mut settings, &*controller, steps),
            Some(Action::Nudge(tolerances)) => {
                if let Some(sensor) = dummy.as_deref_mut() {
                    sensor.nudge(tolerances * status.sonification.tolerance);
                }
            }
            None => {}
        }
    }
}

// Notice to show after an edit, if any
fn adjust<O>(
    settings: &mut SettingsEditor,
    controller: &SessionController<O>,
    steps: i32,
) -> Option<String>
where
    O: AudioOutput,
{
    match settings.adjust(controller, steps) {
        Ok(()) => None,
        Err(SessionError::AlreadyActive) => Some("stop the session to change settings".into()),
        Err(e) => {
            warn!("Rejected setting: {e}");
            Some(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolConfig, SessionFile, SonificationConfig};
    use crate::force::ForceSample;
    use crate::gui::settings::Setting;
    use crate::output::{OfflineOutput, OutputFormat};
    use ratatui::backend::TestBackend;

    fn status(state: ProtocolState) -> SessionStatus {
        SessionStatus {
            state,
            current_set_index: state.set_index(),
            time_remaining: Duration::from_millis(6_200),
            completed_sets: 1,
            set_count: 3,
            sensor_stale: false,
            latest: Some(ForceSample::new(0, 19.5)),
            sonification: SonificationConfig {
                target_load: 20.0,
                tolerance: 2.0,
            },
            last_error: None,
        }
    }

    fn render(status: &SessionStatus, notice: Option<&str>) -> String {
        let settings = SettingsEditor::with_configs(ProtocolConfig::default(), status.sonification);
        render_with(status, &settings, notice)
    }

    fn render_with(
        status: &SessionStatus,
        settings: &SettingsEditor,
        notice: Option<&str>,
    ) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 24)).unwrap();
        let mut history = ForceHistory::new(HISTORY_SECONDS, 64);
        for i in 0..20 {
            history.push(i as f64 * 0.1, 19.0 + (i % 3) as f64);
        }
        terminal
            .draw(|frame| draw(frame, status, &mut history, settings, notice))
            .unwrap();
        let buffer = terminal.backend().buffer();
        buffer.content.iter().map(|cell| cell.symbol()).collect()
    }

    #[test]
    fn timer_rounds_up() {
        assert_eq!(mm_ss(Duration::from_secs(10)), "00:10");
        assert_eq!(mm_ss(Duration::from_millis(9_001)), "00:10");
        assert_eq!(mm_ss(Duration::from_secs(125)), "02:05");
        assert_eq!(mm_ss(Duration::ZERO), "00:00");
    }

    #[test]
    fn colours_follow_the_state() {
        assert_eq!(state_colour(ProtocolState::Countdown), ORANGE);
        assert_eq!(state_colour(ProtocolState::Working(2)), Color::Green);
        assert_eq!(state_colour(ProtocolState::Resting(2)), Color::Red);
    }

    #[test]
    fn keys() {
        assert_eq!(Action::from_key(KeyCode::Char('s')), Some(Action::Start));
        assert_eq!(Action::from_key(KeyCode::Char('x')), Some(Action::Stop));
        assert_eq!(Action::from_key(KeyCode::Char('q')), Some(Action::Quit));
        assert_eq!(Action::from_key(KeyCode::Up), Some(Action::Nudge(0.5)));
        assert_eq!(Action::from_key(KeyCode::Tab), Some(Action::Select(1)));
        assert_eq!(Action::from_key(KeyCode::BackTab), Some(Action::Select(-1)));
        assert_eq!(Action::from_key(KeyCode::Char('+')), Some(Action::Adjust(1)));
        assert_eq!(Action::from_key(KeyCode::Char('-')), Some(Action::Adjust(-1)));
        assert_eq!(Action::from_key(KeyCode::Char('z')), None);
    }

    fn controller() -> SessionController<OfflineOutput> {
        let format = OutputFormat {
            sample_rate: 48_000,
            channels: 1,
        };
        SessionController::new(SessionFile::default(), OfflineOutput::new(format)).unwrap()
    }

    #[test]
    fn edits_show_on_the_settings_line() {
        let c = controller();
        let mut settings = SettingsEditor::new(&c);
        settings.select(2);
        assert_eq!(settings.selected(), Setting::Work);
        assert_eq!(adjust(&mut settings, &c, 5), None);

        let work = c.requested().0.work_duration;
        let screen = render_with(&status(ProtocolState::Idle), &settings, None);
        assert!(screen.contains(&format!("Work {}", mm_ss(work))));
        assert!(screen.contains("<Tab>"));
    }

    #[test]
    fn rejected_edits_become_the_notice() {
        let mut c = controller();
        let mut settings = SettingsEditor::new(&c);
        settings.select(-1);
        let steps = -(c.requested().0.set_count as i32);
        let notice = adjust(&mut settings, &c, steps);
        assert_eq!(notice.as_deref(), Some("set count must be at least 1"));
        let screen = render_with(&status(ProtocolState::Idle), &settings, notice.as_deref());
        assert!(screen.contains("set count must be at least 1"));

        c.start().unwrap();
        assert_eq!(
            adjust(&mut settings, &c, 1).as_deref(),
            Some("stop the session to change settings")
        );
        c.shutdown();
    }

    #[test]
    fn shows_the_work_interval() {
        let screen = render(&status(ProtocolState::Working(2)), None);
        assert!(screen.contains("WORK 2/3"));
        assert!(screen.contains("00:07"));
        assert!(screen.contains("19.50"));
        assert!(screen.contains("1 / 3"));
        assert!(!screen.contains("SENSOR STALE"));
    }

    #[test]
    fn shows_stale_sensor_and_errors() {
        let mut stale = status(ProtocolState::Working(1));
        stale.sensor_stale = true;
        assert!(render(&stale, None).contains("SENSOR STALE"));

        let mut failed = status(ProtocolState::Idle);
        failed.last_error = Some("audio stream lost: unplugged".into());
        let screen = render(&failed, None);
        assert!(screen.contains("READY"));
        assert!(screen.contains("audio stream lost: unplugged"));

        let screen = render(&failed, Some("session already running"));
        assert!(screen.contains("session already running"));
    }
}
