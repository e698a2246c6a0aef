//! Background trigger listener.
//!
//! While active, the listener is the sole reader of the inbound endpoint:
//! a dedicated polling task performs bounded-timeout bulk reads and forwards
//! raw frames over a channel to a dispatch task, so handler work never
//! delays the next read. Stopping is cooperative; the only suspension point
//! in the loop is the bounded read, so worst-case stop latency is about one
//! read-timeout interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{TriggerMessage, is_trigger_frame};
use crate::transport::{ProbeBus, ProbeLink};

/// Read buffer size for the polling loop.
const BUFF_SIZE: usize = 1024 * 4;

/// Capacity of the raw-frame channel between the poll and dispatch tasks.
const FRAME_QUEUE: usize = 256;

/// Lifecycle states of the trigger listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    /// No polling task exists.
    Stopped = 0,
    /// `start()` accepted; the polling task has been spawned but has not
    /// entered its loop yet.
    Starting = 1,
    /// The polling task owns the inbound endpoint.
    Running = 2,
    /// Stop requested; the polling task will exit after its current read.
    Stopping = 3,
}

impl ListenerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Shared atomic cell holding the listener state.
///
/// Cloned into the command channel so synchronous reads can fail fast while
/// the listener owns the inbound endpoint. Using an atomic means the stop
/// signal and the loop's check cannot race.
#[derive(Debug, Clone)]
pub(crate) struct ListenerStateCell(Arc<AtomicU8>);

impl ListenerStateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ListenerState::Stopped as u8)))
    }

    pub(crate) fn load(&self) -> ListenerState {
        ListenerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ListenerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ListenerState, to: ListenerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.load() == ListenerState::Stopped
    }
}

/// Callback interface for parsed trigger messages.
///
/// Invoked on the dispatch task, not on the polling task.
pub trait TriggerHandler: Send + Sync {
    /// Called for every well-formed trigger frame received from the probe.
    fn on_trigger(&self, msg: TriggerMessage);
}

impl<F: Fn(TriggerMessage) + Send + Sync> TriggerHandler for F {
    fn on_trigger(&self, msg: TriggerMessage) {
        self(msg);
    }
}

type HandlerSlot = Arc<std::sync::RwLock<Option<Arc<dyn TriggerHandler>>>>;

/// Background polling loop that parses probe trigger frames and dispatches
/// them to the registered handler.
pub struct TriggerListener {
    bus: Arc<dyn ProbeBus>,
    link: Arc<RwLock<Option<ProbeLink>>>,
    state: ListenerStateCell,
    handler: HandlerSlot,
    read_timeout: Duration,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerListener {
    pub(crate) fn new(
        bus: Arc<dyn ProbeBus>,
        link: Arc<RwLock<Option<ProbeLink>>>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            link,
            state: ListenerStateCell::new(),
            handler: Arc::new(std::sync::RwLock::new(None)),
            read_timeout,
            poll_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
        }
    }

    /// Handle to the shared state cell, for the command channel's
    /// fail-fast checks.
    pub(crate) fn state_cell(&self) -> ListenerStateCell {
        self.state.clone()
    }

    /// Current listener state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.state.load()
    }

    /// Returns true if no polling task exists.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Registers the trigger handler. Last write wins; dispatch always uses
    /// whatever handler is registered at dispatch time.
    pub fn set_handler(&self, handler: Arc<dyn TriggerHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Clears the trigger handler. Frames arriving afterwards are parsed
    /// and dropped.
    pub fn clear_handler(&self) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = None;
        }
    }

    /// Starts the polling task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if there is no probe link, or
    /// [`Error::ListenerNotStopped`] if a previous listener has not fully
    /// stopped.
    pub async fn start(&self) -> Result<()> {
        let (handle, ep_in) = {
            let link = self.link.read().await;
            let link = link.as_ref().ok_or(Error::NotConnected)?;
            (link.handle, link.endpoints.ep_in)
        };

        if !self
            .state
            .transition(ListenerState::Stopped, ListenerState::Starting)
        {
            return Err(Error::ListenerNotStopped {
                state: self.state.load(),
            });
        }

        tracing::info!("starting trigger listener");

        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(FRAME_QUEUE);

        let handler = Arc::clone(&self.handler);
        let dispatch_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                dispatch_frame(&handler, &frame);
            }
        });

        let bus = Arc::clone(&self.bus);
        let state = self.state.clone();
        let read_timeout = self.read_timeout;
        let poll_task = tokio::spawn(async move {
            // stop() may have landed between spawn and loop entry.
            if state.transition(ListenerState::Starting, ListenerState::Running) {
                while state.load() == ListenerState::Running {
                    match bus.bulk_read(handle, ep_in, BUFF_SIZE, read_timeout).await {
                        Ok(Some(data)) if !data.is_empty() => match std::str::from_utf8(&data) {
                            Ok(s) => {
                                tracing::trace!("listener received {:?}", s);
                                if frame_tx.send(s.to_owned()).await.is_err() {
                                    tracing::debug!("frame receiver dropped");
                                    break;
                                }
                            }
                            Err(_) => {
                                tracing::debug!(
                                    "discarding non-text frame: {}",
                                    hex::encode(&data)
                                );
                            }
                        },
                        // Empty read or timeout: nothing arrived, poll again.
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!("listener read error (ignored): {e}");
                        }
                    }
                }
            }
            state.store(ListenerState::Stopped);
            tracing::debug!("listener loop exited");
        });

        *self.poll_task.lock().await = Some(poll_task);
        *self.dispatch_task.lock().await = Some(dispatch_task);
        Ok(())
    }

    /// Signals the polling task to stop and waits for it to exit.
    ///
    /// Cooperative: there is no mid-read cancellation, so this takes up to
    /// one read-timeout interval. Join failures are logged only.
    pub async fn stop(&self) {
        match self.state.load() {
            ListenerState::Stopped => return,
            ListenerState::Starting | ListenerState::Running => {
                tracing::info!("stopping trigger listener");
                self.state.store(ListenerState::Stopping);
            }
            ListenerState::Stopping => {}
        }

        if let Some(task) = self.poll_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("error while joining listener task: {e}");
                // The task never stored Stopped; repair the state so the
                // endpoint is usable again.
                self.state.store(ListenerState::Stopped);
            }
        } else {
            self.state.store(ListenerState::Stopped);
        }

        // The poll task dropped its sender, so the dispatch task drains
        // whatever is queued and ends.
        if let Some(task) = self.dispatch_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("error while joining dispatch task: {e}");
            }
        }
        tracing::info!("trigger listener stopped");
    }
}

/// Classifies one raw frame and hands it to the current handler.
///
/// Non-trigger frames and parse failures are logged and discarded; nothing
/// here is fatal to the listener loop.
fn dispatch_frame(handler: &HandlerSlot, frame: &str) {
    if !is_trigger_frame(frame) {
        tracing::info!("malformed trigger data: {:?}", frame);
        return;
    }

    // Drop the leading `G` marker before field parsing.
    let body = frame.trim()[1..].trim();
    match TriggerMessage::parse(body) {
        Ok(msg) => {
            let current = handler.read().map_or(None, |slot| slot.clone());
            if let Some(h) = current {
                h.on_trigger(msg);
            }
        }
        Err(e) => tracing::warn!("{e}"),
    }
}

impl Drop for TriggerListener {
    fn drop(&mut self) {
        // Abort background tasks
        if let Some(task) = self.poll_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::testing::MockBus;
    use crate::transport::{BusHandle, DeviceDescriptor, EndpointPair};

    fn test_link() -> ProbeLink {
        ProbeLink {
            handle: BusHandle(1),
            endpoints: EndpointPair {
                ep_in: 0x81,
                ep_out: 0x02,
            },
            device: DeviceDescriptor {
                vendor_id: 0x16c0,
                product_id: 0x0486,
                interface_count: 2,
                name: "probe".into(),
            },
        }
    }

    fn listener_with_bus(bus: Arc<MockBus>) -> TriggerListener {
        let link = Arc::new(RwLock::new(Some(test_link())));
        TriggerListener::new(bus, link, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_start_requires_connection() {
        let bus = Arc::new(MockBus::new());
        let listener = TriggerListener::new(bus, Arc::new(RwLock::new(None)), Duration::from_millis(5));
        assert!(matches!(listener.start().await, Err(Error::NotConnected)));
        assert!(listener.is_stopped());
    }

    #[tokio::test]
    async fn test_start_then_stop_returns_to_stopped() {
        let listener = listener_with_bus(Arc::new(MockBus::new()));
        listener.start().await.unwrap();
        listener.stop().await;
        assert_eq!(listener.state(), ListenerState::Stopped);
        // A second stop is a no-op.
        listener.stop().await;
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let listener = listener_with_bus(Arc::new(MockBus::new()));
        listener.start().await.unwrap();
        let err = listener.start().await.unwrap_err();
        assert!(matches!(err, Error::ListenerNotStopped { .. }));
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_dispatched_to_handler() {
        let bus = Arc::new(MockBus::new());
        bus.push_read(b"G T 12345 7 1\n");
        let listener = listener_with_bus(Arc::clone(&bus));

        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        listener.set_handler(Arc::new(move |msg: TriggerMessage| {
            assert_eq!(msg.tag, 'T');
            assert_eq!(msg.timestamp, 12345);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        listener.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_kill_loop() {
        let bus = Arc::new(MockBus::new());
        bus.push_read(b"garbage line");
        bus.push_read(b"G T notanumber 7 1");
        bus.push_read(b"G T 555 9 2");
        let listener = listener_with_bus(Arc::clone(&bus));

        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        listener.set_handler(Arc::new(move |msg: TriggerMessage| {
            assert_eq!(msg.timestamp, 555);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        listener.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleared_handler_not_invoked() {
        let bus = Arc::new(MockBus::new());
        let listener = listener_with_bus(Arc::clone(&bus));

        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        listener.set_handler(Arc::new(move |_msg: TriggerMessage| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        listener.clear_handler();

        listener.start().await.unwrap();
        bus.push_read(b"G T 1 2 3");
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
