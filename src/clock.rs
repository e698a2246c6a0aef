//! Clock synchronization coordinator.
//!
//! The probe keeps its own microsecond clock; interpreting its timestamps
//! requires the offset between that clock and the host clock. The offset
//! itself is computed by an external time-sync engine over a raw round-trip
//! exchange; this module orchestrates the handshake (version check, initial
//! sync) and periodic drift checks, and owns the resulting [`ClockState`].

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::commands::CommandChannel;
use crate::error::{Error, Result};
use crate::listener::ListenerStateCell;
use crate::protocol::{Command, PROTOCOL_VERSION};
use crate::transport::{BusHandle, ProbeLink};

/// Default drift limit above which a warning is raised, in microseconds.
pub const DEFAULT_DRIFT_LIMIT_US: i64 = 1500;

/// External time-sync algorithm.
///
/// The sampling and statistics method is opaque; only this call contract is
/// fixed. The round trip talks to the probe directly over the raw handle and
/// endpoints, using its own sub-protocol rather than the command channel's
/// framing.
pub trait TimeSyncEngine: Send + Sync {
    /// Runs the round-trip exchange and returns the host base time in
    /// microseconds.
    fn sync_round_trip(
        &self,
        handle: BusHandle,
        ep_out: u8,
        ep_in: u8,
    ) -> BoxFuture<'_, Result<i64>>;

    /// Refreshes the round-trip error bounds.
    fn refresh_bounds(&self, handle: BusHandle) -> BoxFuture<'_, Result<()>>;

    /// Lower error bound of the last exchange, microseconds (signed).
    fn min_error_micros(&self) -> i64;

    /// Upper error bound of the last exchange, microseconds (signed).
    fn max_error_micros(&self) -> i64;
}

/// Clock offset state, mutated only by [`ClockSync`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockState {
    /// Host-clock offset in microseconds. `None` until a sync succeeds.
    pub base_time_us: Option<i64>,
    /// Monotonic host time of the last successful sync.
    pub last_sync: Option<Instant>,
    /// Lower round-trip error bound from the engine, microseconds.
    pub min_error_us: i64,
    /// Upper round-trip error bound from the engine, microseconds.
    pub max_error_us: i64,
}

/// Result of a drift check. Advisory only; the clock offset is untouched.
#[derive(Debug, Clone, Copy)]
pub struct DriftReport {
    /// Lower round-trip error bound, microseconds.
    pub min_error_us: i64,
    /// Upper round-trip error bound, microseconds.
    pub max_error_us: i64,
    /// Estimated drift: `|min + max| / 2`.
    pub drift_us: i64,
    /// True if the drift strictly exceeds the configured limit.
    pub exceeded: bool,
}

/// Coordinates the clock handshake and drift checks against the external
/// time-sync engine.
pub struct ClockSync {
    engine: Arc<dyn TimeSyncEngine>,
    link: Arc<RwLock<Option<ProbeLink>>>,
    listener_state: ListenerStateCell,
    state: RwLock<ClockState>,
    epoch: Instant,
    drift_limit_us: i64,
}

impl ClockSync {
    pub(crate) fn new(
        engine: Arc<dyn TimeSyncEngine>,
        link: Arc<RwLock<Option<ProbeLink>>>,
        listener_state: ListenerStateCell,
        drift_limit_us: i64,
    ) -> Self {
        Self {
            engine,
            link,
            listener_state,
            state: RwLock::new(ClockState::default()),
            epoch: Instant::now(),
            drift_limit_us,
        }
    }

    /// Snapshot of the current clock state.
    pub async fn state(&self) -> ClockState {
        *self.state.read().await
    }

    /// Monotonic host time in microseconds, measured from construction.
    #[must_use]
    pub fn host_micros(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    /// Host time in probe clock terms: host microseconds minus the base
    /// offset. Meaningful only after a successful sync.
    pub async fn micros(&self) -> i64 {
        let base = self.state.read().await.base_time_us.unwrap_or(0);
        self.host_micros() - base
    }

    async fn current_link(&self) -> Result<ProbeLink> {
        self.link.read().await.clone().ok_or(Error::NotConnected)
    }

    /// Verifies the probe speaks the expected protocol version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerActive`] while the trigger listener owns
    /// the inbound endpoint (the version reply would otherwise end up in
    /// the trigger stream), and [`Error::VersionMismatch`] carrying both
    /// versions if the device reports anything other than
    /// [`PROTOCOL_VERSION`].
    pub async fn check_version(&self, channel: &CommandChannel) -> Result<()> {
        if !self.listener_state.is_stopped() {
            return Err(Error::ListenerActive);
        }
        let reported = channel.command(Command::Version).await?;
        if reported != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION.to_owned(),
                actual: reported,
            });
        }
        tracing::debug!("probe protocol version {reported} ok");
        Ok(())
    }

    /// Runs the engine's round-trip exchange and installs the new base time.
    ///
    /// Best-effort: an engine failure is logged and leaves the previous
    /// offset (and the timestamp of the last successful sync) untouched,
    /// so a failed sync can never corrupt existing clock state. The error
    /// bounds are recorded either way for visibility.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a link and
    /// [`Error::ListenerActive`] while the trigger listener owns the inbound
    /// endpoint. Engine failures are not propagated.
    pub async fn sync_clock(&self) -> Result<()> {
        if !self.listener_state.is_stopped() {
            return Err(Error::ListenerActive);
        }
        let link = self.current_link().await?;

        let outcome = self
            .engine
            .sync_round_trip(link.handle, link.endpoints.ep_out, link.endpoints.ep_in)
            .await;

        let mut state = self.state.write().await;
        state.min_error_us = self.engine.min_error_micros();
        state.max_error_us = self.engine.max_error_micros();

        match outcome {
            Ok(base) => {
                state.base_time_us = Some(base);
                state.last_sync = Some(Instant::now());
                tracing::info!(
                    "synced clocks, base={}us, max error={}us",
                    base,
                    state.max_error_us
                );
            }
            Err(e) => {
                tracing::warn!("clock sync failed, keeping previous base time: {e}");
            }
        }
        Ok(())
    }

    /// Refreshes the error bounds and reports the estimated drift.
    ///
    /// Advisory only: never mutates the base time. The warning fires when
    /// the drift strictly exceeds the configured limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a link and
    /// [`Error::ListenerActive`] while the trigger listener is running.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        if !self.listener_state.is_stopped() {
            return Err(Error::ListenerActive);
        }
        let link = self.current_link().await?;

        self.engine.refresh_bounds(link.handle).await?;
        let min_error_us = self.engine.min_error_micros();
        let max_error_us = self.engine.max_error_micros();
        let drift_us = (min_error_us + max_error_us).abs() / 2;
        let exceeded = drift_us > self.drift_limit_us;

        {
            let mut state = self.state.write().await;
            state.min_error_us = min_error_us;
            state.max_error_us = max_error_us;
        }

        if exceeded {
            tracing::warn!(
                "high clock drift: {drift_us}us (limit {}us), remote clock delayed between \
                 {min_error_us} and {max_error_us}us",
                self.drift_limit_us
            );
        } else {
            tracing::info!("remote clock delayed between {min_error_us} and {max_error_us}us");
        }

        Ok(DriftReport {
            min_error_us,
            max_error_us,
            drift_us,
            exceeded,
        })
    }
}
