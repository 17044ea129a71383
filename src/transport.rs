//! The contract shared by the BLE and serial transports.
//!
//! A transport is a handle to a background task that owns the link. Commands
//! are queued and return immediately; their outcome shows up later as a state
//! change, a [`TransportEvent`], or text in the receive buffer.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::Result;
use crate::utils::decode_utf8;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    /// No link and not scanning.
    #[default]
    Idle,
    /// Actively scanning for peripherals (BLE only).
    Discovering,
    /// A link is being opened.
    Connecting,
    /// A writable link is established.
    Connected,
    /// A link is being torn down.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a link handle exists in this state.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Disconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Notification sent to observers after the transport state changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection state changed.
    StateChanged {
        /// Previous state.
        old: ConnectionState,
        /// New state.
        new: ConnectionState,
    },
    /// Text was appended to the receive buffer.
    TextReceived(String),
    /// The receive buffer was cleared.
    TextCleared,
    /// The discovered-device list changed.
    DevicesChanged,
    /// The serial port list changed.
    PortsChanged,
    /// The selected port or baud rate changed.
    SelectionChanged,
    /// A scan was requested while the radio was off.
    RadioUnavailable,
    /// A connection attempt failed and the transport went back to idle.
    ConnectFailed {
        /// Description of the failure.
        reason: String,
    },
}

/// Append-only buffer of received text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
}

impl TextBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `payload` and append it.
    ///
    /// Returns the appended text, or `None` if the payload was not valid
    /// UTF-8 and was dropped.
    pub fn append_bytes(&mut self, payload: &[u8]) -> Option<String> {
        match decode_utf8(payload) {
            Some(text) => {
                self.text.push_str(&text);
                Some(text)
            }
            None => {
                trace!("Dropping {} bytes of invalid UTF-8", payload.len());
                None
            }
        }
    }

    /// The accumulated text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Discard all text.
    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// The "connect, send text, receive text" contract.
pub trait Transport {
    /// What [`connect`](Transport::connect) connects to.
    type Target;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Check if connected.
    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Everything received since the buffer was last cleared.
    fn received_text(&self) -> String;

    /// Request a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportClosed`](crate::Error::TransportClosed) if the
    /// transport has shut down. Connection failures are reported as events.
    fn connect(&self, target: Self::Target) -> Result<()>;

    /// Queue `text` for sending. A no-op when not connected.
    fn send(&self, text: &str) -> Result<()>;

    /// Request a disconnect. Idempotent.
    fn disconnect(&self) -> Result<()>;

    /// Clear the receive buffer.
    fn clear_received_text(&self) -> Result<()>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Spawn a task that feeds matching events from `rx` into `callback`.
pub(crate) fn spawn_callback<T, F, M>(
    counter: &AtomicU64,
    mut rx: broadcast::Receiver<TransportEvent>,
    select: M,
    callback: F,
) -> CallbackHandle
where
    T: Send + 'static,
    M: Fn(TransportEvent) -> Option<T> + Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let callback_id = counter.fetch_add(1, Ordering::SeqCst);

    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(value) = select(event) {
                        callback(value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!("Callback {} lagged by {} events", callback_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    CallbackHandle::new(callback_id, move || {
        handle.abort();
    })
}

/// Work queued for a link's writer task.
pub(crate) enum Outbound {
    /// Bytes to write, in order.
    Payload(Vec<u8>),
    /// Answered once everything queued before it has been written.
    Flush(oneshot::Sender<()>),
}

/// Writer task of an open link.
///
/// Writes run off the transport task so a peer that stops draining cannot
/// hold up commands or teardown.
pub(crate) struct LinkWriter {
    queue: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl LinkWriter {
    /// Spawn `run` on the receiving end of a new queue.
    pub(crate) fn spawn<R, Fut>(run: R) -> Self
    where
        R: FnOnce(mpsc::UnboundedReceiver<Outbound>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            queue,
            task: tokio::spawn(run(rx)),
        }
    }

    /// Queue `payload`. Returns immediately.
    pub(crate) fn write(&self, payload: Vec<u8>) {
        if self.queue.send(Outbound::Payload(payload)).is_err() {
            trace!("Writer stopped, payload dropped");
        }
    }

    /// Answer `done` once every payload queued so far has been written.
    pub(crate) fn flush(&self, done: oneshot::Sender<()>) {
        if let Err(mpsc::error::SendError(Outbound::Flush(done))) =
            self.queue.send(Outbound::Flush(done))
        {
            let _ = done.send(());
        }
    }

    /// Stop the writer, dropping unwritten payloads, and wait until it has
    /// released its end of the link.
    pub(crate) async fn close(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}
