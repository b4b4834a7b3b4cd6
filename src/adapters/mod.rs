//! Channel implementations over byte streams.
//!
//! Each link spawns one tokio task that owns the reader and writer halves
//! of its device connection. Transport setup (serial port, TCP, HTTP
//! bridge) is left to the caller; anything implementing tokio's
//! `AsyncBufRead`/`AsyncWrite` will do.

pub mod encoder_link;
pub mod gcode_link;

pub use encoder_link::EncoderLink;
pub use gcode_link::GcodeLink;
