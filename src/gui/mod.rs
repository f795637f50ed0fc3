//! The terminal dashboard: timer, set progress, a live force chart against
//! the target band, the settings for the next session, and the keys that
//! drive it all.

mod dashboard;
mod error;
mod history;
mod settings;

pub use dashboard::{dashboard, draw, mm_ss, state_colour, Action};
pub use error::DashboardError;
pub use history::ForceHistory;
pub use settings::{Setting, SettingsEditor};
