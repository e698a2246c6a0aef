//! Error types for the probelink library.

use thiserror::Error;

use crate::listener::ListenerState;

/// The main error type for probelink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying bus implementation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport fault reported by the bus collaborator.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// No probe connection is established.
    #[error("not connected to probe")]
    NotConnected,

    /// A bounded read elapsed without the probe answering.
    #[error("timed out reading from probe after {timeout_ms}ms")]
    ReadTimeout { timeout_ms: u64 },

    /// The response frame did not start with the expected acknowledgment byte.
    #[error("unexpected response from probe: expected ack {expected:?}, got {response:?}")]
    UnexpectedAck { expected: char, response: String },

    /// The probe reports a protocol version this library does not speak.
    #[error("protocol version mismatch: expected {expected:?}, device reports {actual:?}")]
    VersionMismatch { expected: String, actual: String },

    /// A synchronous read was attempted while the trigger listener owns
    /// the inbound endpoint.
    #[error("listener is running, inbound endpoint unavailable")]
    ListenerActive,

    /// The listener was asked to start from a state other than `Stopped`.
    #[error("listener not stopped (current state: {state:?})")]
    ListenerNotStopped { state: ListenerState },

    /// A frame claiming to be a trigger could not be parsed.
    #[error("malformed trigger frame {frame:?}: {reason}")]
    TriggerParse { frame: String, reason: String },

    /// The user denied the permission request for the probe device.
    #[error("permission to open the probe device was denied")]
    PermissionDenied,

    /// No attached device matched the probe vendor id.
    #[error("no probe device found (vendor id 0x{vendor_id:04x})")]
    DeviceNotFound { vendor_id: u16 },
}

/// Result type alias for probelink operations.
pub type Result<T> = std::result::Result<T, Error>;
