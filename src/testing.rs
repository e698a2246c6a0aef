//! Scripted mock collaborators shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::clock::TimeSyncEngine;
use crate::commands::CommandChannel;
use crate::error::{Error, Result};
use crate::listener::ListenerStateCell;
use crate::transport::{
    BusHandle, DetachMonitor, DeviceDescriptor, DeviceEnumerator, EndpointPair, PermissionBroker,
    ProbeBus, ProbeLink,
};

/// The descriptor used by most tests: a probe on the expected vendor id.
pub(crate) fn probe_device() -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: 0x16c0,
        product_id: 0x0486,
        interface_count: 2,
        name: "teensy-probe".into(),
    }
}

pub(crate) fn test_link() -> ProbeLink {
    ProbeLink {
        handle: BusHandle(1),
        endpoints: EndpointPair {
            ep_in: 0x81,
            ep_out: 0x02,
        },
        device: probe_device(),
    }
}

/// A command channel wired to a mock bus with short test timeouts.
pub(crate) fn channel_for(bus: std::sync::Arc<MockBus>) -> CommandChannel {
    CommandChannel::new(
        bus,
        std::sync::Arc::new(tokio::sync::RwLock::new(Some(test_link()))),
        ListenerStateCell::new(),
        Duration::from_millis(5),
        Duration::from_millis(5),
    )
}

/// Scripted bulk-transfer bus.
///
/// Inbound frames are queued with [`push_read`](Self::push_read); each
/// `bulk_read` pops one frame, or waits out the timeout and reports no data.
/// Reads against a closed handle are recorded so tests can assert the
/// endpoint-ownership invariant.
pub(crate) struct MockBus {
    reads: Mutex<VecDeque<Bytes>>,
    written: Mutex<Vec<u8>>,
    opened: Mutex<Vec<u64>>,
    closed: Mutex<HashSet<u64>>,
    read_after_close: AtomicBool,
    next_handle: AtomicU64,
}

impl MockBus {
    pub(crate) fn new() -> Self {
        Self {
            reads: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(HashSet::new()),
            read_after_close: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
        }
    }

    pub(crate) fn push_read(&self, data: &[u8]) {
        self.reads
            .lock()
            .expect("reads lock")
            .push_back(Bytes::copy_from_slice(data));
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().expect("written lock").clone()
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.reads.lock().expect("reads lock").len()
    }

    pub(crate) fn read_after_close(&self) -> bool {
        self.read_after_close.load(Ordering::SeqCst)
    }

    /// True if every opened handle has been closed again.
    pub(crate) fn all_closed(&self) -> bool {
        let opened = self.opened.lock().expect("opened lock");
        let closed = self.closed.lock().expect("closed lock");
        !opened.is_empty() && opened.iter().all(|h| closed.contains(h))
    }

    fn is_closed(&self, handle: BusHandle) -> bool {
        self.closed.lock().expect("closed lock").contains(&handle.0)
    }
}

impl ProbeBus for MockBus {
    fn open(&self, _device: &DeviceDescriptor) -> BoxFuture<'_, Result<BusHandle>> {
        Box::pin(async move {
            let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
            self.opened.lock().expect("opened lock").push(id);
            Ok(BusHandle(id))
        })
    }

    fn claim_interface(
        &self,
        _handle: BusHandle,
        _interface: u8,
    ) -> BoxFuture<'_, Result<EndpointPair>> {
        Box::pin(async move {
            Ok(EndpointPair {
                ep_in: 0x81,
                ep_out: 0x02,
            })
        })
    }

    fn bulk_read(
        &self,
        handle: BusHandle,
        _endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            if self.is_closed(handle) {
                self.read_after_close.store(true, Ordering::SeqCst);
                return Err(Error::Transport {
                    message: "read against closed handle".into(),
                });
            }
            let next = self.reads.lock().expect("reads lock").pop_front();
            match next {
                Some(data) => Ok(Some(data.slice(..data.len().min(max_len)))),
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
            }
        })
    }

    fn bulk_write(
        &self,
        handle: BusHandle,
        _endpoint: u8,
        data: Bytes,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_closed(handle) {
                return Err(Error::Transport {
                    message: "write against closed handle".into(),
                });
            }
            self.written.lock().expect("written lock").extend_from_slice(&data);
            Ok(())
        })
    }

    fn close(&self, handle: BusHandle) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.lock().expect("closed lock").insert(handle.0);
        })
    }
}

/// Enumerator over a configurable device list.
#[derive(Default)]
pub(crate) struct MockEnumerator {
    devices: Mutex<Vec<DeviceDescriptor>>,
}

impl MockEnumerator {
    pub(crate) fn attach(&self, device: DeviceDescriptor) {
        self.devices.lock().expect("devices lock").push(device);
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn list_devices(&self) -> BoxFuture<'_, Result<Vec<DeviceDescriptor>>> {
        Box::pin(async move { Ok(self.devices.lock().expect("devices lock").clone()) })
    }
}

/// Permission broker with a switchable answer.
pub(crate) struct MockPermissions {
    grant: AtomicBool,
}

impl MockPermissions {
    pub(crate) fn granting() -> Self {
        Self {
            grant: AtomicBool::new(true),
        }
    }

    pub(crate) fn deny(&self) {
        self.grant.store(false, Ordering::SeqCst);
    }
}

impl PermissionBroker for MockPermissions {
    fn request_permission(&self, _device: &DeviceDescriptor) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { Ok(self.grant.load(Ordering::SeqCst)) })
    }
}

/// Detach monitor driven by the test.
pub(crate) struct MockDetach {
    tx: broadcast::Sender<DeviceDescriptor>,
}

impl MockDetach {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub(crate) fn detach(&self, device: DeviceDescriptor) {
        let _ = self.tx.send(device);
    }
}

impl DetachMonitor for MockDetach {
    fn subscribe(&self) -> broadcast::Receiver<DeviceDescriptor> {
        self.tx.subscribe()
    }
}

/// Time-sync engine returning scripted offsets and bounds.
#[derive(Default)]
pub(crate) struct MockEngine {
    base: AtomicI64,
    min_error: AtomicI64,
    max_error: AtomicI64,
    fail_next: AtomicBool,
}

impl MockEngine {
    pub(crate) fn set_base(&self, base_us: i64) {
        self.base.store(base_us, Ordering::SeqCst);
    }

    pub(crate) fn set_bounds(&self, min_us: i64, max_us: i64) {
        self.min_error.store(min_us, Ordering::SeqCst);
        self.max_error.store(max_us, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_sync(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl TimeSyncEngine for MockEngine {
    fn sync_round_trip(
        &self,
        _handle: BusHandle,
        _ep_out: u8,
        _ep_in: u8,
    ) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::Transport {
                    message: "sync round trip failed".into(),
                });
            }
            Ok(self.base.load(Ordering::SeqCst))
        })
    }

    fn refresh_bounds(&self, _handle: BusHandle) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn min_error_micros(&self) -> i64 {
        self.min_error.load(Ordering::SeqCst)
    }

    fn max_error_micros(&self) -> i64 {
        self.max_error.load(Ordering::SeqCst)
    }
}
