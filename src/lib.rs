//! # probelink
//!
//! A Rust client library for hardware input-latency measurement probes.
//!
//! The probe is a microcontroller attached over a USB serial-like transport.
//! It answers single-byte commands synchronously (each command byte is
//! acknowledged by its case-flipped counterpart) and, once a listener is
//! started, pushes asynchronous trigger frames with microsecond timestamps
//! in its own clock domain. Interpreting those timestamps requires the
//! clock offset established by the sync handshake.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use probelink::{ProbeConfig, ProbeManager, TriggerMessage};
//! # use probelink::transport::{DetachMonitor, DeviceEnumerator, PermissionBroker, ProbeBus};
//! # use probelink::clock::TimeSyncEngine;
//!
//! # async fn run(
//! #     bus: Arc<dyn ProbeBus>,
//! #     enumerator: Arc<dyn DeviceEnumerator>,
//! #     permissions: Arc<dyn PermissionBroker>,
//! #     detach: &dyn DetachMonitor,
//! #     engine: Arc<dyn TimeSyncEngine>,
//! # ) -> probelink::Result<()> {
//! let manager = ProbeManager::new(
//!     bus,
//!     enumerator,
//!     permissions,
//!     detach,
//!     engine,
//!     ProbeConfig::default(),
//! );
//!
//! // Discover the probe, acquire permission and run the clock handshake.
//! if manager.connect().await {
//!     manager.listener().set_handler(Arc::new(|msg: TriggerMessage| {
//!         println!("trigger {} at {}us", msg.tag, msg.timestamp);
//!     }));
//!     manager.listener().start().await?;
//!     // ... run a measurement ...
//!     manager.listener().stop().await;
//!     manager.disconnect().await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Collaborator contracts for the physical transport stack
//! - [`protocol`] - Command bytes, the ack convention, trigger frames
//! - [`commands`] - Synchronous command/acknowledgment channel
//! - [`listener`] - Background trigger listener
//! - [`clock`] - Clock synchronization coordinator
//! - [`manager`] - Top-level [`ProbeManager`] connection owner
//!
//! The inbound endpoint is a single shared resource: while the listener is
//! running it is the only reader, and synchronous reads fail fast with
//! [`Error::ListenerActive`] instead of racing it.

pub mod clock;
pub mod commands;
pub mod error;
pub mod listener;
pub mod manager;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use clock::{ClockState, ClockSync, DriftReport, TimeSyncEngine};
pub use commands::CommandChannel;
pub use error::{Error, Result};
pub use listener::{ListenerState, TriggerHandler, TriggerListener};
pub use manager::{PROBE_VENDOR_ID, ProbeConfig, ProbeManager};
pub use protocol::{Command, PROTOCOL_VERSION, TriggerMessage, flip_case, is_trigger_frame};
pub use transport::{BusHandle, DeviceDescriptor, EndpointPair, ProbeLink};
