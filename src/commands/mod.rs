//! Synchronous command/acknowledgment channel.
//!
//! Every synchronous request is a single ASCII command byte; the probe
//! answers with a frame whose first byte is the case-flipped command byte.
//! The channel shares the inbound endpoint with the trigger listener and
//! must never read while the listener is active: reads fail fast against
//! the shared listener-state cell instead.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::listener::ListenerStateCell;
use crate::protocol::{Command, flip_case};
use crate::transport::{ProbeBus, ProbeLink};

/// Read buffer for single-frame responses.
const READ_BUFF_SIZE: usize = 64;

/// Read buffer for multi-frame bulk responses.
const BULK_BUFF_SIZE: usize = 1024 * 4;

/// Command channel for synchronous exchanges with the probe.
pub struct CommandChannel {
    bus: Arc<dyn ProbeBus>,
    link: Arc<RwLock<Option<ProbeLink>>>,
    listener_state: ListenerStateCell,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl CommandChannel {
    pub(crate) fn new(
        bus: Arc<dyn ProbeBus>,
        link: Arc<RwLock<Option<ProbeLink>>>,
        listener_state: ListenerStateCell,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            link,
            listener_state,
            read_timeout,
            write_timeout,
        }
    }

    async fn current_link(&self) -> Result<ProbeLink> {
        self.link.read().await.clone().ok_or(Error::NotConnected)
    }

    /// Writes a single command byte to the outbound endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without an open link, or a transport
    /// error if the write fails.
    pub async fn send_byte(&self, cmd: u8) -> Result<()> {
        let link = self.current_link().await?;
        tracing::trace!("sending command byte {:?}", cmd as char);
        self.bus
            .bulk_write(
                link.handle,
                link.endpoints.ep_out,
                Bytes::copy_from_slice(&[cmd]),
                self.write_timeout,
            )
            .await
    }

    /// Reads one response frame from the inbound endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerActive`] if the trigger listener owns the
    /// inbound endpoint, or [`Error::ReadTimeout`] if nothing arrives within
    /// the bounded read timeout.
    pub async fn read_one(&self) -> Result<String> {
        if !self.listener_state.is_stopped() {
            return Err(Error::ListenerActive);
        }
        let link = self.current_link().await?;

        let data = self
            .bus
            .bulk_read(
                link.handle,
                link.endpoints.ep_in,
                READ_BUFF_SIZE,
                self.read_timeout,
            )
            .await?
            .ok_or(Error::ReadTimeout {
                timeout_ms: self.read_timeout.as_millis() as u64,
            })?;

        let s = String::from_utf8_lossy(&data).into_owned();
        tracing::debug!("read_one() received: {:?}", s);
        Ok(s)
    }

    /// Sends a command byte and reads the raw response without verifying
    /// the acknowledgment. Used for exchanges with their own reply format.
    pub async fn send_receive(&self, cmd: u8) -> Result<String> {
        self.send_byte(cmd).await?;
        self.read_one().await
    }

    /// Performs one command/acknowledgment exchange.
    ///
    /// If the trigger listener is active, the command byte is sent
    /// fire-and-forget and an empty string is returned; any response will
    /// surface through the listener instead. This mirrors the probe's
    /// documented behavior and leaves response correlation to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedAck`] if the response does not begin with
    /// `expected_ack`, carrying both the expectation and the received frame.
    pub async fn command_with_ack(&self, cmd: u8, expected_ack: u8) -> Result<String> {
        if !self.listener_state.is_stopped() {
            self.send_byte(cmd).await?;
            return Ok(String::new());
        }

        let response = self.send_receive(cmd).await?;
        if response.as_bytes().first() != Some(&expected_ack) {
            return Err(Error::UnexpectedAck {
                expected: expected_ack as char,
                response,
            });
        }
        Ok(response[1..].trim().to_owned())
    }

    /// Performs a command exchange with the conventional case-flipped ack.
    pub async fn command_byte(&self, cmd: u8) -> Result<String> {
        self.command_with_ack(cmd, flip_case(cmd)).await
    }

    /// Performs a command exchange for a known probe [`Command`].
    pub async fn command(&self, cmd: Command) -> Result<String> {
        self.command_with_ack(cmd.byte(), cmd.expected_ack()).await
    }

    /// Reads until the probe stops answering, concatenating everything.
    ///
    /// Responses the firmware flushes as separate packets come out of
    /// separate bulk transfers, while longer text may arrive as one transfer
    /// of up to a few kilobytes; this accumulates both until a read times
    /// out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerActive`] if the trigger listener owns the
    /// inbound endpoint.
    pub async fn read_all(&self) -> Result<String> {
        if !self.listener_state.is_stopped() {
            return Err(Error::ListenerActive);
        }
        let link = self.current_link().await?;

        let mut out = String::new();
        loop {
            let chunk = self
                .bus
                .bulk_read(
                    link.handle,
                    link.endpoints.ep_in,
                    BULK_BUFF_SIZE,
                    self.read_timeout,
                )
                .await?;
            match chunk {
                Some(data) => out.push_str(&String::from_utf8_lossy(&data)),
                // Timed out: the probe has nothing more to say.
                None => break,
            }
        }
        tracing::debug!("read_all() received {} bytes", out.len());
        Ok(out)
    }
}
