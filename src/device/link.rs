//! Serial transport to the display/motor controller
//!
//! `DeviceLink` owns the port handle and is the only thing that reads or
//! writes it. Command exchanges are strictly request/reply; image transfers
//! are fire-and-ack where any inbound byte inside the timeout counts as the
//! acknowledgment. Failures come back as `false` or an error value, never a
//! panic, and the link tracks whether it must be reopened.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::protocol::{Command, decode_reply};
use crate::{Error, Result};

/// Bytes pulled from the port per read call
const READ_CHUNK: usize = 256;

/// Sleep between polls while waiting for inbound bytes
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Written ahead of every image payload so the firmware leaves command mode
pub const IMAGE_PROBE: &[u8] = b"IMG\n";

/// Longest reply line accepted before the exchange is treated as garbage
const MAX_LINE: usize = 64 * 1024;

/// Shortest driver timeout used while waiting out a reply deadline
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Byte stream to the peer
///
/// Implemented by the OS serial port; tests substitute scripted ports.
pub trait SerialIo: Read + Write + Send {
    /// Discard everything waiting in the input buffer
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the request
    fn clear_input(&mut self) -> io::Result<()>;

    /// Number of bytes waiting to be read
    ///
    /// # Errors
    ///
    /// Returns error if the driver cannot be queried
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Bound how long a single read or write may block
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the timeout
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Opens serial handles by path
pub trait PortOpener: Send + Sync {
    /// Open `path` at `baud`, giving up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be opened
    fn open(&self, path: &str, baud: u32, timeout: Duration) -> io::Result<Box<dyn SerialIo>>;
}

/// Opens real ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, path: &str, baud: u32, timeout: Duration) -> io::Result<Box<dyn SerialIo>> {
        let mut port = serialport::new(path, baud)
            .timeout(timeout)
            .open()
            .map_err(io::Error::from)?;

        // Some boards only start talking once DTR is asserted
        if let Err(e) = port.write_data_terminal_ready(true) {
            tracing::debug!(path, error = %e, "could not assert DTR");
        }

        Ok(Box::new(SystemPort(port)))
    }
}

struct SystemPort(Box<dyn serialport::SerialPort>);

impl Read for SystemPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SystemPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SerialIo for SystemPort {
    fn clear_input(&mut self) -> io::Result<()> {
        self.0
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let n = self.0.bytes_to_read().map_err(io::Error::from)?;
        Ok(usize::try_from(n).unwrap_or(usize::MAX))
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.set_timeout(timeout).map_err(io::Error::from)
    }
}

/// Opener with no ports behind it: every open fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPorts;

impl PortOpener for NoPorts {
    fn open(&self, path: &str, _baud: u32, _timeout: Duration) -> io::Result<Box<dyn SerialIo>> {
        Err(io::Error::new(
            ErrorKind::NotFound,
            format!("no port available at {path}"),
        ))
    }
}

/// Connection status of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No handle; must be reopened before any send
    Closed,
    /// Last write succeeded (and was acknowledged where applicable)
    Open,
    /// Handle held, but the last exchange failed and needs a retry
    Degraded,
}

/// Delay schedule between open attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failed attempt
    Fixed(Duration),
    /// `base + step * attempt`
    Incremental {
        /// Delay after the first failure
        base: Duration,
        /// Added for each further failure
        step: Duration,
    },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (zero-based)
    #[must_use]
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(d) => d,
            Self::Incremental { base, step } => base.saturating_add(step.saturating_mul(attempt)),
        }
    }
}

/// Timing parameters of a link
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Baud rate
    pub baud: u32,
    /// Per-attempt open timeout (also the driver read/write timeout)
    pub open_timeout: Duration,
    /// How long to wait for a command reply line
    pub command_timeout: Duration,
    /// Pause between image transfer attempts
    pub retry_delay: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            open_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Exclusive owner of one serial handle
pub struct DeviceLink {
    opener: Box<dyn PortOpener>,
    settings: LinkSettings,
    port: Option<Box<dyn SerialIo>>,
    state: LinkState,
    path: Option<String>,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("state", &self.state)
            .field("path", &self.path)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DeviceLink {
    /// Create a closed link
    #[must_use]
    pub fn new(opener: Box<dyn PortOpener>, settings: LinkSettings) -> Self {
        Self {
            opener,
            settings,
            port: None,
            state: LinkState::Closed,
            path: None,
        }
    }

    /// Current connection status
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Path of the last successfully opened port
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Try once to open the port
    ///
    /// Replaces any handle already held. Returns `false` and leaves the link
    /// closed on failure.
    pub fn open(&mut self, path: &str) -> bool {
        self.close();

        match self
            .opener
            .open(path, self.settings.baud, self.settings.open_timeout)
        {
            Ok(port) => {
                self.port = Some(port);
                self.state = LinkState::Open;
                self.path = Some(path.to_string());
                tracing::info!(path, baud = self.settings.baud, "serial link opened");
                true
            }
            Err(e) => {
                tracing::debug!(path, error = %e, "serial open failed");
                false
            }
        }
    }

    /// Open the port if the link is closed, retrying with backoff
    ///
    /// Returns `false` when every attempt failed. That is fatal for the
    /// caller's current operation only.
    pub fn ensure_open(&mut self, path: &str, max_attempts: u32, backoff: Backoff) -> bool {
        if self.state != LinkState::Closed {
            return true;
        }

        let attempts = max_attempts.max(1);
        for attempt in 0..attempts {
            if self.open(path) {
                return true;
            }

            if attempt + 1 < attempts {
                let delay = backoff.delay(attempt);
                tracing::debug!(path, attempt = attempt + 1, ?delay, "retrying serial open");
                std::thread::sleep(delay);
            }
        }

        tracing::warn!(path, attempts, "serial link unavailable");
        false
    }

    /// Send one command and wait for its reply
    ///
    /// Stale input is discarded before writing, so the reply read is always
    /// the one for this command.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if the link is closed or the write/read fails
    /// - `Error::Protocol` if no reply arrives in time or it cannot be parsed
    /// - `Error::Remote` if the peer answered with an error field
    pub fn send_command(&mut self, command: &Command) -> Result<Value> {
        let frame = command.encode()?;
        let timeout = self.settings.command_timeout;
        let driver_timeout = self.settings.open_timeout;

        let reply = {
            let port = self.port_mut()?;
            let exchange = write_frame(port, &frame)
                .and_then(|()| read_line(port, timeout, driver_timeout));
            match exchange {
                Ok(reply) => reply,
                Err(e) if is_transient(&e) => {
                    self.state = LinkState::Degraded;
                    tracing::debug!(method = %command.method, error = %e, "command exchange stalled");
                    return Err(Error::Transport(format!("{}: {e}", command.method)));
                }
                Err(e) => {
                    self.fail(&e);
                    return Err(Error::Transport(format!("{}: {e}", command.method)));
                }
            }
        };

        let line = match reply {
            ReplyLine::Line(line) => line,
            ReplyLine::Missing => {
                self.state = LinkState::Degraded;
                return Err(Error::Protocol(format!(
                    "no reply to {} within {timeout:?}",
                    command.method
                )));
            }
            ReplyLine::Overlong => {
                self.state = LinkState::Degraded;
                return Err(Error::Protocol(format!(
                    "reply to {} exceeded {MAX_LINE} bytes",
                    command.method
                )));
            }
        };

        match decode_reply(&line) {
            Ok(value) => {
                self.state = LinkState::Open;
                tracing::trace!(method = %command.method, "command acknowledged");
                Ok(value)
            }
            Err(e @ Error::Remote(_)) => {
                self.state = LinkState::Open;
                Err(e)
            }
            Err(e) => {
                self.state = LinkState::Degraded;
                Err(e)
            }
        }
    }

    /// Stream a raw image payload, retrying until acknowledged
    ///
    /// Each attempt writes [`IMAGE_PROBE`], drains stale input, writes the
    /// payload, flushes and then waits up to `timeout` for any inbound byte.
    /// Stalled writes count as a missed attempt. Returns `false` once
    /// `retries + 1` attempts went unacknowledged or the port failed outright.
    pub fn send_image(&mut self, payload: &[u8], timeout: Duration, retries: u32) -> bool {
        for attempt in 0..=retries {
            if attempt > 0 {
                std::thread::sleep(self.settings.retry_delay);
            }

            let port = match self.port_mut() {
                Ok(port) => port,
                Err(e) => {
                    tracing::debug!(error = %e, "image skipped");
                    return false;
                }
            };

            match transfer_image(port, payload, timeout) {
                Ok(true) => {
                    self.state = LinkState::Open;
                    tracing::trace!(bytes = payload.len(), attempt, "image acknowledged");
                    return true;
                }
                Ok(false) => {
                    self.state = LinkState::Degraded;
                    tracing::debug!(attempt = attempt + 1, ?timeout, "image ack timed out");
                }
                Err(e) if is_transient(&e) => {
                    self.state = LinkState::Degraded;
                    tracing::debug!(attempt = attempt + 1, error = %e, "image transfer stalled");
                }
                Err(e) => {
                    self.fail(&e);
                    return false;
                }
            }
        }

        false
    }

    /// Release the handle; safe to call repeatedly
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!(path = ?self.path, "serial link closed");
        }
        self.state = LinkState::Closed;
    }

    fn port_mut(&mut self) -> Result<&mut dyn SerialIo> {
        match self.port.as_mut() {
            Some(port) => Ok(port.as_mut()),
            None => Err(Error::Transport("serial link is closed".to_string())),
        }
    }

    fn fail(&mut self, e: &io::Error) {
        tracing::warn!(path = ?self.path, error = %e, "serial I/O failed, closing link");
        self.close();
    }
}

fn write_frame(port: &mut dyn SerialIo, frame: &[u8]) -> io::Result<()> {
    port.clear_input()?;
    port.write_all(frame)?;
    port.flush()
}

/// Errors a serial driver reports when it merely ran out of time
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Outcome of waiting for a reply line
enum ReplyLine {
    Line(String),
    Missing,
    Overlong,
}

/// Read one `\n`-terminated line within `timeout`
///
/// Each read is bounded by the time left, and the driver timeout is restored
/// afterwards.
fn read_line(
    port: &mut dyn SerialIo,
    timeout: Duration,
    driver_timeout: Duration,
) -> io::Result<ReplyLine> {
    let reply = read_line_until(port, Instant::now() + timeout);
    port.set_timeout(driver_timeout)?;
    reply
}

fn read_line_until(port: &mut dyn SerialIo, deadline: Instant) -> io::Result<ReplyLine> {
    let mut scratch = [0_u8; READ_CHUNK];
    let mut line = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(ReplyLine::Missing);
        }
        port.set_timeout(remaining.max(MIN_READ_TIMEOUT))?;

        match port.read(&mut scratch) {
            Ok(0) => std::thread::sleep(POLL_INTERVAL.min(remaining)),
            Ok(n) => {
                line.extend_from_slice(&scratch[..n]);
                if let Some(end) = line.iter().position(|&b| b == b'\n') {
                    line.truncate(end);
                    return Ok(ReplyLine::Line(String::from_utf8_lossy(&line).into_owned()));
                }
                if line.len() > MAX_LINE {
                    return Ok(ReplyLine::Overlong);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                std::thread::sleep(POLL_INTERVAL.min(remaining));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// One image attempt; `Ok(false)` means nothing came back in time
fn transfer_image(port: &mut dyn SerialIo, payload: &[u8], timeout: Duration) -> io::Result<bool> {
    port.write_all(IMAGE_PROBE)?;
    port.clear_input()?;
    port.write_all(payload)?;
    port.flush()?;

    let deadline = Instant::now() + timeout;
    loop {
        if port.bytes_available()? > 0 {
            port.clear_input()?;
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Where and how hard the shared link tries to reach the device
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    /// Port path
    pub path: String,
    /// Open attempts per `ensure_open`
    pub open_attempts: u32,
    /// Delay schedule between open attempts
    pub backoff: Backoff,
    /// Ack window per image attempt
    pub image_timeout: Duration,
    /// Extra image attempts after the first
    pub image_retries: u32,
}

/// Cloneable handle that serializes all access to one [`DeviceLink`]
///
/// The async methods run the blocking serial work on the runtime's blocking
/// pool, so a slow write never stalls the caller's task.
#[derive(Clone)]
pub struct SharedLink {
    inner: Arc<Mutex<DeviceLink>>,
    policy: Arc<LinkPolicy>,
}

impl std::fmt::Debug for SharedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLink")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SharedLink {
    /// Wrap a link with its reconnect/retry policy
    #[must_use]
    pub fn new(link: DeviceLink, policy: LinkPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(link)),
            policy: Arc::new(policy),
        }
    }

    /// Reconnect/retry policy
    #[must_use]
    pub fn policy(&self) -> &LinkPolicy {
        &self.policy
    }

    /// Current connection status; a poisoned link reads as closed
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.lock().map_or(LinkState::Closed, |link| link.state())
    }

    /// Open the link if closed, per the policy
    pub async fn ensure_open(&self) -> bool {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.ensure_open_blocking())
            .await
            .unwrap_or(false)
    }

    /// Blocking form of [`Self::ensure_open`]
    pub fn ensure_open_blocking(&self) -> bool {
        let policy = &self.policy;
        match self.lock() {
            Ok(mut link) => link.ensure_open(&policy.path, policy.open_attempts, policy.backoff),
            Err(e) => {
                tracing::warn!(error = %e, "serial link unusable");
                false
            }
        }
    }

    /// Send one command and wait for its reply
    ///
    /// # Errors
    ///
    /// See [`DeviceLink::send_command`]
    pub async fn send_command(&self, command: Command) -> Result<Value> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.lock()?.send_command(&command))
            .await
            .map_err(|e| Error::Transport(format!("command task failed: {e}")))?
    }

    /// Send an image payload with the policy's timeout and retries
    pub async fn send_image(&self, payload: Arc<[u8]>) -> bool {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.send_image_blocking(&payload))
            .await
            .unwrap_or(false)
    }

    /// Blocking form of [`Self::send_image`]
    pub fn send_image_blocking(&self, payload: &[u8]) -> bool {
        let policy = &self.policy;
        match self.lock() {
            Ok(mut link) => link.send_image(payload, policy.image_timeout, policy.image_retries),
            Err(e) => {
                tracing::warn!(error = %e, "image skipped");
                false
            }
        }
    }

    /// Close the link; in-flight exchanges finish first
    pub async fn close(&self) {
        let this = self.clone();
        if tokio::task::spawn_blocking(move || this.close_blocking())
            .await
            .is_err()
        {
            tracing::warn!("close task failed");
        }
    }

    /// Release the handle even if an earlier exchange panicked mid-way
    fn close_blocking(&self) {
        match self.inner.lock() {
            Ok(mut link) => link.close(),
            Err(poisoned) => {
                tracing::warn!("serial link lock poisoned, releasing handle");
                poisoned.into_inner().close();
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DeviceLink>> {
        self.inner
            .lock()
            .map_err(|_| Error::Transport("serial link lock poisoned".to_string()))
    }
}
