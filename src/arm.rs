//! The published "is feedback allowed, and against what" slot.
//!
//! Written by the protocol machine on every state change, read by the audio
//! callback once per block. Loads are wait-free; a store swaps in a fresh
//! snapshot that the very next load observes.

use crate::config::SonificationConfig;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// One published snapshot of the protocol's gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmState {
    /// Feedback may sound
    pub armed: bool,
    /// Window to sonify against while armed
    pub config: SonificationConfig,
    /// Set the snapshot belongs to, 0 outside of work
    pub set_index: u32,
}

impl ArmState {
    /// A disarmed snapshot.
    pub fn disarmed(config: SonificationConfig) -> Self {
        Self {
            armed: false,
            config,
            set_index: 0,
        }
    }
}

/// Single-slot cell holding the current [`ArmState`].
#[derive(Debug)]
pub struct ArmCell {
    slot: ArcSwap<ArmState>,
}

impl ArmCell {
    /// A disarmed cell.
    pub fn new(config: SonificationConfig) -> Self {
        Self {
            slot: ArcSwap::from_pointee(ArmState::disarmed(config)),
        }
    }

    /// Arms feedback for `set_index` against `config`.
    pub fn arm(&self, config: SonificationConfig, set_index: u32) {
        self.slot.store(Arc::new(ArmState {
            armed: true,
            config,
            set_index,
        }));
    }

    /// Disarms feedback, keeping the last config for display.
    pub fn disarm(&self) {
        let config = self.slot.load().config;
        self.slot.store(Arc::new(ArmState::disarmed(config)));
    }

    /// Copies out the current snapshot.
    pub fn snapshot(&self) -> ArmState {
        **self.slot.load()
    }

    /// Whether feedback is currently armed.
    pub fn is_armed(&self) -> bool {
        self.slot.load().armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disarmed() {
        let cell = ArmCell::new(SonificationConfig::default());
        assert!(!cell.is_armed());
        assert_eq!(cell.snapshot().set_index, 0);
    }

    #[test]
    fn arm_then_disarm() {
        let cfg = SonificationConfig {
            target_load: 20.0,
            tolerance: 2.0,
        };
        let cell = ArmCell::new(SonificationConfig::default());

        cell.arm(cfg, 2);
        let snap = cell.snapshot();
        assert!(snap.armed);
        assert_eq!(snap.config, cfg);
        assert_eq!(snap.set_index, 2);

        cell.disarm();
        let snap = cell.snapshot();
        assert!(!snap.armed);
        assert_eq!(snap.config, cfg);
    }
}
