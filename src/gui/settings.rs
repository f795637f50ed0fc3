use std::time::Duration;

use crate::config::{ProtocolConfig, SonificationConfig};
use crate::error::SessionError;
use crate::gui::dashboard::mm_ss;
use crate::output::AudioOutput;
use crate::session::SessionController;

use ratatui::prelude::*;

/// A setting the dashboard can change between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    /// Load to hold
    Target,
    /// Band around the target
    Tolerance,
    /// Seconds of work per set
    Work,
    /// Seconds of rest per set
    Rest,
    /// Number of sets
    Sets,
}

const ORDER: [Setting; 5] = [
    Setting::Target,
    Setting::Tolerance,
    Setting::Work,
    Setting::Rest,
    Setting::Sets,
];

impl Setting {
    fn label(self) -> &'static str {
        match self {
            Setting::Target => "Target",
            Setting::Tolerance => "Tolerance",
            Setting::Work => "Work",
            Setting::Rest => "Rest",
            Setting::Sets => "Sets",
        }
    }

    fn position(self) -> usize {
        ORDER.iter().position(|&s| s == self).unwrap_or(0)
    }
}

// Rounded so repeated steps land on the grid instead of drifting
fn step_load(value: f32, step: f32, steps: i32) -> f32 {
    ((value + step * steps as f32) / step).round() * step
}

fn step_duration(value: Duration, step: Duration, steps: i32) -> Duration {
    let by = step.saturating_mul(steps.unsigned_abs());
    if steps < 0 {
        value.saturating_sub(by)
    } else {
        value.saturating_add(by)
    }
}

/// The settings the next start will use, and which one the keys change.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsEditor {
    selected: Setting,
    protocol: ProtocolConfig,
    sonification: SonificationConfig,
}

impl SettingsEditor {
    /// An editor showing what `controller` will start with.
    pub fn new<O: AudioOutput>(controller: &SessionController<O>) -> Self {
        let (protocol, sonification) = controller.requested();
        Self::with_configs(protocol, sonification)
    }

    /// An editor starting from the given settings, with the target selected.
    pub fn with_configs(protocol: ProtocolConfig, sonification: SonificationConfig) -> Self {
        Self {
            selected: Setting::Target,
            protocol,
            sonification,
        }
    }

    /// Setting the keys change.
    pub fn selected(&self) -> Setting {
        self.selected
    }

    /// Moves the selection `by` places, wrapping around.
    pub fn select(&mut self, by: i32) {
        let len = ORDER.len() as i32;
        let at = (self.selected.position() as i32 + by).rem_euclid(len);
        self.selected = ORDER[at as usize];
    }

    /// Moves the selected setting `steps` notches and hands the result to
    /// the controller. Only allowed while no session is running; a rejected
    /// value leaves the editor as it was.
    pub fn adjust<O: AudioOutput>(
        &mut self,
        controller: &SessionController<O>,
        steps: i32,
    ) -> Result<(), SessionError> {
        if controller.status().state.is_active() {
            return Err(SessionError::AlreadyActive);
        }

        let mut protocol = self.protocol;
        let mut sonification = self.sonification;
        match self.selected {
            Setting::Target => {
                sonification.target_load = step_load(sonification.target_load, 0.5, steps)
            }
            Setting::Tolerance => {
                sonification.tolerance = step_load(sonification.tolerance, 0.1, steps)
            }
            Setting::Work => {
                protocol.work_duration =
                    step_duration(protocol.work_duration, Duration::from_secs(1), steps)
            }
            Setting::Rest => {
                protocol.rest_duration =
                    step_duration(protocol.rest_duration, Duration::from_secs(5), steps)
            }
            Setting::Sets => {
                protocol.set_count = protocol.set_count.saturating_add_signed(steps)
            }
        }

        controller.configure(protocol, sonification)?;
        self.protocol = protocol;
        self.sonification = sonification;
        Ok(())
    }

    /// One line listing every setting, the selected one highlighted.
    pub fn line(&self) -> Line<'static> {
        let values = [
            format!("{:.1}", self.sonification.target_load),
            format!("{:.1}", self.sonification.tolerance),
            mm_ss(self.protocol.work_duration),
            mm_ss(self.protocol.rest_duration),
            self.protocol.set_count.to_string(),
        ];
        let mut spans = vec![Span::from(" Next ")];
        for (setting, value) in ORDER.iter().zip(values) {
            let text = format!(" {} {value} ", setting.label());
            spans.push(if *setting == self.selected {
                Span::styled(text, Style::default().add_modifier(Modifier::REVERSED))
            } else {
                Span::from(text)
            });
        }
        spans.push(" <Tab>".magenta().bold());
        spans.push(" select ".into());
        spans.push("<+>/<->".magenta().bold());
        spans.push(" change".into());
        Line::from(spans)
    }
}
