//! forcetone turns isometric training into sound. While the athlete pulls or
//! presses against a load cell, a reference tone plays; the further the
//! measured load strays from the target, the more noise is mixed into it, so
//! the athlete can hold the target with their eyes closed.
//!
//! A session is a protocol of timed phases: a countdown, then a number of
//! sets, each a work interval followed by rest. Feedback sounds only during
//! work intervals and goes quiet whenever the sensor does.
//!
//! The pieces, from the sensor to the speaker:
//!
//! - [`force`] holds the newest reading where the audio thread can read it
//!   without locking, and [`progressor`], [`stream_sensor`] and
//!   [`dummy_sensor`] put readings there.
//! - [`arm`] publishes whether feedback may sound and against which window.
//! - [`engine`] renders audio blocks from those two.
//! - [`protocol`] runs the session clock and arms the engine.
//! - [`output`] plays the engine on a device, or hands blocks to the caller.
//! - [`session`] ties it together behind one call surface, which [`gui`]
//!   and [`render`] drive.

#![warn(missing_docs)]
pub mod args;
pub mod arm;
pub mod config;
pub mod dummy_sensor;
pub mod engine;
pub mod error;
pub mod force;
pub mod gui;
pub mod output;
pub mod progressor;
pub mod protocol;
pub mod render;
pub mod session;
pub mod stream_sensor;
