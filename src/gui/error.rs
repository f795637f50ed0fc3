use std::{error::Error, fmt::Display, io};

use crate::error::SessionError;

/// Something that stopped the dashboard.
#[derive(Debug)]
pub enum DashboardError {
    /// The terminal could not be set up, drawn to or read from
    IOError(io::Error),
    /// The session could not be driven
    SessionError(SessionError),
}

impl Display for DashboardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IOError(e) => write!(f, "terminal error: {e}"),
            Self::SessionError(e) => write!(f, "{e}"),
        }
    }
}

impl Error for DashboardError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::IOError(e) => Some(e),
            Self::SessionError(e) => Some(e),
        }
    }
}

impl From<io::Error> for DashboardError {
    fn from(value: io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<SessionError> for DashboardError {
    fn from(value: SessionError) -> Self {
        Self::SessionError(value)
    }
}
