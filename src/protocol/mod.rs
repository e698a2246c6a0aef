//! Wire protocol for the latency probe.
//!
//! The synchronous side of the protocol is deliberately simple: each request
//! is a single ASCII command byte, and the probe answers with a frame whose
//! first byte is the case-flipped command byte (the "ack"), followed by an
//! optional trimmed ASCII payload. Asynchronous trigger frames are text
//! lines handled by [`trigger`].

pub mod trigger;

pub use trigger::{TriggerMessage, is_trigger_frame};

/// Protocol version the probe firmware must report for the `Version` command.
pub const PROTOCOL_VERSION: &str = "2";

/// Command bytes understood by the probe firmware.
///
/// Mirrors the `#define` table in the firmware sketch; each command is a
/// single ASCII character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Ping with a delay.
    PingDelayed = b'D',
    /// Reset all firmware variables.
    Reset = b'F',
    /// Send some digits for clock sync.
    SyncSend = b'I',
    /// Ping with a single byte.
    Ping = b'P',
    /// Report firmware protocol version.
    Version = b'V',
    /// Read out recorded sync times.
    SyncReadout = b'R',
    /// Send last shock time and watch for another shock.
    Gshock = b'G',
    /// Current probe time.
    TimeNow = b'T',
    /// Initial zero for clock sync.
    SyncZero = b'Z',
    /// Send a message on screen color change.
    AutoScreenOn = b'C',
    /// Stop sending screen change messages.
    AutoScreenOff = b'c',
    /// Send info about the last screen color change.
    SendLastScreen = b'E',
    /// Probe the screen for a brightness vs. time curve.
    BrightnessCurve = b'U',
    /// Send messages on state change of the laser.
    AutoLaserOn = b'L',
    /// Stop sending laser change messages.
    AutoLaserOff = b'l',
    /// Send info about the last laser state change.
    SendLastLaser = b'J',
    /// Start watching for a signal on the audio out line.
    Audio = b'A',
    /// Generate a tone into the mic and send a timestamp.
    Beep = b'B',
    /// Start listening for a MIDI message.
    Midi = b'M',
    /// Generate a MIDI NoteOn message.
    Note = b'N',
}

impl Command {
    /// Returns the raw command byte sent over the wire.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Returns the acknowledgment byte the probe answers with.
    ///
    /// Every command's ack is its case-flipped counterpart.
    #[must_use]
    pub const fn expected_ack(self) -> u8 {
        flip_case(self as u8)
    }
}

/// Flips the case of an ASCII letter; non-letters are returned unchanged.
///
/// This is the core acknowledgment convention of the probe protocol:
/// command `b'V'` is acknowledged with `b'v'` and vice versa.
#[must_use]
pub const fn flip_case(c: u8) -> u8 {
    if c.is_ascii_uppercase() {
        c.to_ascii_lowercase()
    } else if c.is_ascii_lowercase() {
        c.to_ascii_uppercase()
    } else {
        c
    }
}
