//! Transport collaborator boundary.
//!
//! The physical transport stack (device enumeration, permission dialogs,
//! raw bulk transfers, detach notifications) lives outside this crate.
//! This module fixes the contracts those collaborators must meet; the
//! library only ever talks to them through these object-safe traits.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::Result;

/// A device reported by the enumeration collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Number of interfaces the device exposes.
    pub interface_count: u8,
    /// Human-readable device name for logging.
    pub name: String,
}

/// Opaque token for an open device connection, issued by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusHandle(pub u64);

/// Resolved in/out endpoint addresses of the claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    /// Inbound (device-to-host) endpoint address.
    pub ep_in: u8,
    /// Outbound (host-to-device) endpoint address.
    pub ep_out: u8,
}

/// An established probe connection: open handle plus resolved endpoints.
#[derive(Debug, Clone)]
pub struct ProbeLink {
    /// Open bus connection token.
    pub handle: BusHandle,
    /// Resolved endpoint pair of the claimed interface.
    pub endpoints: EndpointPair,
    /// The device this link was opened for.
    pub device: DeviceDescriptor,
}

/// Raw bulk-transfer capability of the transport stack.
///
/// All waits are bounded: `bulk_read` resolves with `Ok(None)` when the
/// timeout elapses without data, which callers treat as expected rather
/// than as a fault.
pub trait ProbeBus: Send + Sync {
    /// Opens a connection to the device.
    fn open(&self, device: &DeviceDescriptor) -> BoxFuture<'_, Result<BusHandle>>;

    /// Claims the given interface and resolves its endpoint pair.
    fn claim_interface(&self, handle: BusHandle, interface: u8)
    -> BoxFuture<'_, Result<EndpointPair>>;

    /// Reads up to `max_len` bytes from an inbound endpoint.
    ///
    /// Returns `Ok(None)` if the bounded timeout elapsed with no data.
    fn bulk_read(
        &self,
        handle: BusHandle,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Bytes>>>;

    /// Writes `data` to an outbound endpoint with a bounded timeout.
    fn bulk_write(
        &self,
        handle: BusHandle,
        endpoint: u8,
        data: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<()>>;

    /// Releases the connection. Teardown is infallible.
    fn close(&self, handle: BusHandle) -> BoxFuture<'_, ()>;
}

/// Device enumeration collaborator.
pub trait DeviceEnumerator: Send + Sync {
    /// Lists currently attached devices.
    fn list_devices(&self) -> BoxFuture<'_, Result<Vec<DeviceDescriptor>>>;
}

/// Permission collaborator.
///
/// The platform's permission-grant flow is modeled as an async request
/// resolving to granted (`true`) or denied (`false`).
pub trait PermissionBroker: Send + Sync {
    /// Asks the user for permission to open the device.
    fn request_permission(&self, device: &DeviceDescriptor) -> BoxFuture<'_, Result<bool>>;
}

/// Detachment collaborator: notifies when a device is removed.
pub trait DetachMonitor: Send + Sync {
    /// Subscribes to device-removal notifications.
    fn subscribe(&self) -> broadcast::Receiver<DeviceDescriptor>;
}
