//! Probe connection manager.
//!
//! [`ProbeManager`] owns the transport handle and its lifecycle: device
//! discovery, permission acquisition, interface claim, the clock handshake,
//! and ordered teardown. It composes the [`CommandChannel`], the
//! [`TriggerListener`](crate::listener::TriggerListener) and the
//! [`ClockSync`] coordinator around one shared link slot.
//!
//! There is no global instance: construct one manager from its collaborators
//! at startup and pass it by reference.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::clock::{ClockSync, DEFAULT_DRIFT_LIMIT_US, TimeSyncEngine};
use crate::commands::CommandChannel;
use crate::error::{Error, Result};
use crate::listener::TriggerListener;
use crate::protocol::{Command, TriggerMessage};
use crate::transport::{
    DetachMonitor, DeviceDescriptor, DeviceEnumerator, PermissionBroker, ProbeBus, ProbeLink,
};

/// Vendor id of the probe's USB controller.
pub const PROBE_VENDOR_ID: u16 = 0x16c0;

/// Interface index claimed on the probe (serial mode).
pub const PROBE_INTERFACE: u8 = 1;

/// Default bounded read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Default bounded write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for a [`ProbeManager`].
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Vendor id used to select the probe among attached devices.
    pub vendor_id: u16,
    /// Interface index to claim.
    pub interface: u8,
    /// Timeout for bounded inbound reads.
    pub read_timeout: Duration,
    /// Timeout for outbound writes.
    pub write_timeout: Duration,
    /// Drift limit above which [`ClockSync::check_drift`] warns.
    pub drift_limit_us: i64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            vendor_id: PROBE_VENDOR_ID,
            interface: PROBE_INTERFACE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            drift_limit_us: DEFAULT_DRIFT_LIMIT_US,
        }
    }
}

impl ProbeConfig {
    /// Sets the vendor id used for device selection.
    #[must_use]
    pub const fn vendor_id(mut self, vid: u16) -> Self {
        self.vendor_id = vid;
        self
    }

    /// Sets the bounded read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the drift warning limit in microseconds.
    #[must_use]
    pub const fn drift_limit_us(mut self, limit: i64) -> Self {
        self.drift_limit_us = limit;
        self
    }
}

type ConnectCallback = Box<dyn Fn() + Send + Sync>;

/// Top-level owner of the probe connection.
pub struct ProbeManager {
    bus: Arc<dyn ProbeBus>,
    enumerator: Arc<dyn DeviceEnumerator>,
    permissions: Arc<dyn PermissionBroker>,
    config: ProbeConfig,
    link: Arc<RwLock<Option<ProbeLink>>>,
    channel: CommandChannel,
    clock: ClockSync,
    listener: Arc<TriggerListener>,
    callbacks: std::sync::Mutex<Vec<ConnectCallback>>,
    detach_rx: std::sync::Mutex<Option<broadcast::Receiver<DeviceDescriptor>>>,
    detach_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProbeManager {
    /// Creates a manager from its collaborators.
    ///
    /// Subscribes to the detach monitor; the background watcher task that
    /// consumes the subscription is spawned on the first connect attempt,
    /// so construction itself needs no async runtime. A removal
    /// notification matching the connected device triggers an automatic
    /// disconnect.
    #[must_use]
    pub fn new(
        bus: Arc<dyn ProbeBus>,
        enumerator: Arc<dyn DeviceEnumerator>,
        permissions: Arc<dyn PermissionBroker>,
        detach: &dyn DetachMonitor,
        engine: Arc<dyn TimeSyncEngine>,
        config: ProbeConfig,
    ) -> Self {
        let link = Arc::new(RwLock::new(None));
        let listener = Arc::new(TriggerListener::new(
            Arc::clone(&bus),
            Arc::clone(&link),
            config.read_timeout,
        ));
        let channel = CommandChannel::new(
            Arc::clone(&bus),
            Arc::clone(&link),
            listener.state_cell(),
            config.read_timeout,
            config.write_timeout,
        );
        let clock = ClockSync::new(
            engine,
            Arc::clone(&link),
            listener.state_cell(),
            config.drift_limit_us,
        );

        Self {
            bus,
            enumerator,
            permissions,
            config,
            link,
            channel,
            clock,
            listener,
            callbacks: std::sync::Mutex::new(Vec::new()),
            detach_rx: std::sync::Mutex::new(Some(detach.subscribe())),
            detach_task: std::sync::Mutex::new(None),
        }
    }

    /// Spawns the detach watcher on first use. Must run inside a runtime,
    /// which every connect path already does.
    fn ensure_detach_watcher(&self) {
        let Ok(mut rx_slot) = self.detach_rx.lock() else {
            return;
        };
        if let Some(rx) = rx_slot.take() {
            let task = spawn_detach_watcher(
                rx,
                Arc::clone(&self.bus),
                Arc::clone(&self.link),
                Arc::clone(&self.listener),
            );
            if let Ok(mut task_slot) = self.detach_task.lock() {
                *task_slot = Some(task);
            }
        }
    }

    /// Discovers the probe, acquires permission and connects.
    ///
    /// Connection-path failures (no device, permission denied, bus faults)
    /// are logged and leave the manager disconnected; the caller may retry.
    /// Returns whether a connection is established afterwards.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("probe connection failed: {e}");
                false
            }
        }
    }

    /// Strict variant of [`connect`](Self::connect) surfacing the failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`], [`Error::PermissionDenied`], or a
    /// transport error. On any failure after the device was opened, the
    /// handle is released again before returning.
    pub async fn try_connect(&self) -> Result<()> {
        let device = self.find_probe_device().await?;
        self.try_connect_device(device).await
    }

    /// Connects to an explicitly chosen device, skipping discovery.
    ///
    /// # Errors
    ///
    /// Same as [`try_connect`](Self::try_connect), minus device selection.
    pub async fn try_connect_device(&self, device: DeviceDescriptor) -> Result<()> {
        self.ensure_detach_watcher();

        tracing::info!("requesting permission for probe device");
        if !self.permissions.request_permission(&device).await? {
            return Err(Error::PermissionDenied);
        }

        let handle = self.bus.open(&device).await?;
        let endpoints = match self.bus.claim_interface(handle, self.config.interface).await {
            Ok(endpoints) => {
                tracing::info!("interface claimed successfully");
                endpoints
            }
            Err(e) => {
                // Keep the ownership invariant: nothing may hold a
                // half-claimed handle.
                self.bus.close(handle).await;
                return Err(e);
            }
        };

        *self.link.write().await = Some(ProbeLink {
            handle,
            endpoints,
            device,
        });

        // Handshake failures leave the link up; the probe may just need a
        // retry of check_version()/sync_clock().
        if let Err(e) = self.handshake().await {
            tracing::warn!("unable to communicate with probe: {e}");
        }

        self.fire_connect_callbacks();
        Ok(())
    }

    /// Selection policy: log every candidate, pick the first one matching
    /// the configured vendor id.
    async fn find_probe_device(&self) -> Result<DeviceDescriptor> {
        tracing::info!(
            "looking for probe device, VID=0x{:04x}",
            self.config.vendor_id
        );

        let devices = self.enumerator.list_devices().await?;
        if devices.is_empty() {
            tracing::info!("no connected devices found");
            return Err(Error::DeviceNotFound {
                vendor_id: self.config.vendor_id,
            });
        }

        tracing::info!("found {} connected devices:", devices.len());
        let mut selected = None;
        for dev in devices {
            let matches = selected.is_none() && dev.vendor_id == self.config.vendor_id;
            tracing::info!(
                "device: {}, VID:PID - {:04x}:{:04x}, {} interfaces{}",
                dev.name,
                dev.vendor_id,
                dev.product_id,
                dev.interface_count,
                if matches { " <- using this one" } else { "" }
            );
            if matches {
                selected = Some(dev);
            }
        }

        selected.ok_or(Error::DeviceNotFound {
            vendor_id: self.config.vendor_id,
        })
    }

    /// Version check plus initial clock sync.
    async fn handshake(&self) -> Result<()> {
        self.clock.check_version(&self.channel).await?;
        self.clock.sync_clock().await
    }

    /// Disconnects from the probe.
    ///
    /// If the listener is active it is stopped and joined first; endpoint
    /// resources are only released once no reader can touch them.
    pub async fn disconnect(&self) {
        if !self.listener.is_stopped() {
            self.listener.stop().await;
        }
        let link = self.link.write().await.take();
        if let Some(link) = link {
            self.bus.close(link.handle).await;
            tracing::info!("disconnected from probe");
        }
    }

    /// Returns true iff the link is up (both endpoints resolved).
    pub async fn is_connected(&self) -> bool {
        self.link.read().await.is_some()
    }

    /// Registers a callback for connection establishment.
    ///
    /// Fire-once: if the probe is already connected the callback runs
    /// immediately and synchronously; otherwise it runs on the next
    /// successful connect.
    pub async fn register_connect_callback(&self, callback: ConnectCallback) {
        if self.is_connected().await {
            callback();
            return;
        }
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(callback);
        }
    }

    fn fire_connect_callbacks(&self) {
        let pending = match self.callbacks.lock() {
            Ok(mut callbacks) => std::mem::take(&mut *callbacks),
            Err(_) => return,
        };
        for callback in pending {
            callback();
        }
    }

    /// The synchronous command channel.
    #[must_use]
    pub const fn commands(&self) -> &CommandChannel {
        &self.channel
    }

    /// The clock-sync coordinator.
    #[must_use]
    pub const fn clock(&self) -> &ClockSync {
        &self.clock
    }

    /// The trigger listener.
    #[must_use]
    pub fn listener(&self) -> &TriggerListener {
        &self.listener
    }

    /// Reads the probe's last recorded shock time, in probe microseconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerParse`] if the probe's reply is not an
    /// integer.
    pub async fn read_last_shock_time(&self) -> Result<i64> {
        let reply = self.channel.send_receive(Command::Gshock.byte()).await?;
        tracing::debug!("shock time reply: {:?}", reply);
        reply.trim().parse().map_err(|_| Error::TriggerParse {
            frame: reply,
            reason: "invalid shock time".into(),
        })
    }

    /// Issues a command whose reply is a single trigger frame and parses it.
    pub async fn read_trigger_message(&self, cmd: Command) -> Result<TriggerMessage> {
        let response = self.channel.command_with_ack(cmd.byte(), b'G').await?;
        TriggerMessage::parse(&response)
    }
}

impl Drop for ProbeManager {
    fn drop(&mut self) {
        if let Ok(mut task_slot) = self.detach_task.lock() {
            if let Some(task) = task_slot.take() {
                task.abort();
            }
        }
    }
}

/// Watches the detach stream and tears the link down when the connected
/// device is removed.
fn spawn_detach_watcher(
    mut rx: broadcast::Receiver<DeviceDescriptor>,
    bus: Arc<dyn ProbeBus>,
    link: Arc<RwLock<Option<ProbeLink>>>,
    listener: Arc<TriggerListener>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(device) => {
                    let matches = link
                        .read()
                        .await
                        .as_ref()
                        .is_some_and(|l| l.device == device);
                    if !matches {
                        continue;
                    }
                    tracing::info!("probe was detached");
                    if !listener.is_stopped() {
                        listener.stop().await;
                    }
                    let current = link.write().await.take();
                    if let Some(current) = current {
                        bus.close(current.handle).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("detach watcher lagged, missed {n} notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
