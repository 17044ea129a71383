//! Serial UART transport.
//!
//! [`SerialTransport`] is a handle to a background task that owns the open
//! port and runs the connection state machine:
//!
//! ```text
//! Idle --connect--> Connecting --(port opened)--> Connected
//!     --disconnect or port removed--> Idle
//! ```
//!
//! Connecting while a port is open closes it first. Ports are enumerated when
//! the transport is created and whenever a port disappears. Writes run on a
//! per-port writer task, so a device that stops reading never blocks
//! [`disconnect`](Transport::disconnect).

use parking_lot::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::{SerialConfig, BAUD_RATE_PREFERENCE_KEY};
use crate::error::{Error, Result};
use crate::preferences::PreferenceStore;
use crate::serial::port::{PortDescriptor, PortReader, PortWriter, SerialConnection, SerialDriver};
use crate::serial::tokio_driver::TokioSerialDriver;
use crate::transport::{
    spawn_callback, CallbackHandle, ConnectionState, LinkWriter, Outbound, TextBuffer, Transport,
    TransportEvent,
};

/// Where [`SerialTransport`] connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialTarget {
    /// OS path of the port.
    pub path: String,
    /// Baud rate to open it at.
    pub baud_rate: u32,
}

impl SerialTarget {
    /// Create a target.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

/// Requests queued by the handle for the transport task.
enum Command {
    RefreshPorts,
    SelectPort(Option<String>),
    SelectBaudRate(u32),
    Connect(SerialTarget),
    ConnectSelected,
    Send(String),
    Disconnect,
    ClearText,
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// State readable from the handle. Written only by the transport task.
#[derive(Debug, Default)]
struct SerialShared {
    state: ConnectionState,
    ports: Vec<PortDescriptor>,
    selected_port: Option<String>,
    baud_rate: u32,
    active_port: Option<String>,
    text: TextBuffer,
}

/// Result of an open request, tagged with the attempt it belongs to.
struct OpenOutcome {
    session: u64,
    path: String,
    result: Result<SerialConnection>,
}

/// An open port. The port closes once the reader is dropped and the writer
/// task has stopped.
struct OpenLink {
    path: String,
    reader: PortReader,
    writer: LinkWriter,
}

/// Text transport over an OS serial port.
pub struct SerialTransport {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<RwLock<SerialShared>>,
    event_tx: broadcast::Sender<TransportEvent>,
    callback_counter: AtomicU64,
}

impl SerialTransport {
    /// Start a transport using `driver` for port access and `preferences` for
    /// the persisted baud rate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<D, P>(driver: D, preferences: P, config: SerialConfig) -> Self
    where
        D: SerialDriver,
        P: PreferenceStore + 'static,
    {
        let baud_rate = preferences
            .get(BAUD_RATE_PREFERENCE_KEY)
            .and_then(|value| u32::try_from(value).ok())
            .filter(|&value| value > 0)
            .unwrap_or(config.default_baud_rate);
        debug!("Initial baud rate {}", baud_rate);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (opens_tx, opens_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(RwLock::new(SerialShared {
            baud_rate,
            ..Default::default()
        }));

        let mut task = SerialTask {
            driver: Arc::new(driver),
            preferences,
            config,
            shared: shared.clone(),
            event_tx: event_tx.clone(),
            opens_tx,
            session: 0,
            link: None,
        };
        task.refresh_ports();
        tokio::spawn(task.run(command_rx, opens_rx));

        Self {
            commands,
            shared,
            event_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Start a transport on this machine's serial ports.
    pub fn with_system_ports<P>(preferences: P, config: SerialConfig) -> Self
    where
        P: PreferenceStore + 'static,
    {
        Self::new(TokioSerialDriver::new(), preferences, config)
    }

    /// Re-enumerate ports. Never affects an open port.
    pub fn refresh_ports(&self) -> Result<()> {
        self.command(Command::RefreshPorts)
    }

    /// Ports found by the last enumeration.
    pub fn ports(&self) -> Vec<PortDescriptor> {
        self.shared.read().ports.clone()
    }

    /// Path of the selected port.
    pub fn selected_port(&self) -> Option<String> {
        self.shared.read().selected_port.clone()
    }

    /// Select the port used by [`connect_selected`](Self::connect_selected).
    pub fn select_port(&self, path: impl Into<String>) -> Result<()> {
        self.command(Command::SelectPort(Some(path.into())))
    }

    /// Clear the port selection.
    pub fn clear_selected_port(&self) -> Result<()> {
        self.command(Command::SelectPort(None))
    }

    /// Selected baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.shared.read().baud_rate
    }

    /// Select and persist the baud rate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a baud rate of zero.
    pub fn select_baud_rate(&self, baud_rate: u32) -> Result<()> {
        validate_baud_rate(baud_rate)?;
        self.command(Command::SelectBaudRate(baud_rate))
    }

    /// Connect to the selected port at the selected baud rate.
    pub fn connect_selected(&self) -> Result<()> {
        self.command(Command::ConnectSelected)
    }

    /// Path of the port being opened or open.
    pub fn active_port(&self) -> Option<String> {
        self.shared.read().active_port.clone()
    }

    /// Register a callback for received text.
    pub fn on_text_received<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        spawn_callback(
            &self.callback_counter,
            self.event_tx.subscribe(),
            |event| match event {
                TransportEvent::TextReceived(text) => Some(text),
                _ => None,
            },
            callback,
        )
    }

    /// Register a callback for connection state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        spawn_callback(
            &self.callback_counter,
            self.event_tx.subscribe(),
            |event| match event {
                TransportEvent::StateChanged { new, .. } => Some(new),
                _ => None,
            },
            callback,
        )
    }

    /// Wait until every command and every byte read before this call has been
    /// applied, and every text sent before it has been written.
    ///
    /// A port closed while writes are pending drops them, and `sync` returns
    /// as soon as the close is done.
    pub async fn sync(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Sync(tx))?;
        match rx.await {
            Ok(()) => Ok(()),
            Err(_) if !self.commands.is_closed() => Ok(()),
            Err(_) => Err(Error::TransportClosed),
        }
    }

    /// Close any open port and stop the transport task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown(tx))?;
        rx.await.map_err(|_| Error::TransportClosed)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::TransportClosed)
    }
}

impl Transport for SerialTransport {
    type Target = SerialTarget;

    fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    fn received_text(&self) -> String {
        self.shared.read().text.as_str().to_string()
    }

    fn connect(&self, target: SerialTarget) -> Result<()> {
        validate_baud_rate(target.baud_rate)?;
        self.command(Command::Connect(target))
    }

    fn send(&self, text: &str) -> Result<()> {
        self.command(Command::Send(text.to_string()))
    }

    fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    fn clear_received_text(&self) -> Result<()> {
        self.command(Command::ClearText)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

fn validate_baud_rate(baud_rate: u32) -> Result<()> {
    if baud_rate == 0 {
        return Err(Error::InvalidParameter {
            name: "baud_rate".to_string(),
            value: baud_rate.to_string(),
        });
    }
    Ok(())
}

/// Read from the open port, or wait forever when there is none.
async fn read_link(link: &mut Option<OpenLink>, buf: &mut [u8]) -> std::io::Result<usize> {
    match link {
        Some(link) => link.reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Write queued text to the port in order.
fn spawn_port_writer(path: String, mut writer: PortWriter) -> LinkWriter {
    LinkWriter::spawn(move |mut queue| async move {
        while let Some(outbound) = queue.recv().await {
            match outbound {
                Outbound::Payload(payload) => {
                    let result = async {
                        writer.write_all(&payload).await?;
                        writer.flush().await
                    }
                    .await;

                    match result {
                        Ok(()) => trace!("Wrote {} bytes to {}", payload.len(), path),
                        Err(e) => warn!("Write to {} failed: {}", path, e),
                    }
                }
                Outbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    })
}

/// The single writer of a [`SerialTransport`]'s state.
struct SerialTask<D, P> {
    driver: Arc<D>,
    preferences: P,
    config: SerialConfig,
    shared: Arc<RwLock<SerialShared>>,
    event_tx: broadcast::Sender<TransportEvent>,
    opens_tx: mpsc::UnboundedSender<OpenOutcome>,
    /// Bumped on every connect and disconnect so late open results can be
    /// recognised and closed.
    session: u64,
    link: Option<OpenLink>,
}

impl<D: SerialDriver, P: PreferenceStore> SerialTask<D, P> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut opens: mpsc::UnboundedReceiver<OpenOutcome>,
    ) {
        debug!("Serial transport task started");
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        loop {
            // Port input first, so a command sees every byte read before it.
            tokio::select! {
                biased;
                read = read_link(&mut self.link, &mut buf) => self.handle_read(read, &buf).await,
                Some(outcome) = opens.recv() => self.handle_open(outcome),
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.close_link().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close_link().await;
                        break;
                    }
                },
            }
        }

        debug!("Serial transport task ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RefreshPorts => self.refresh_ports(),
            Command::SelectPort(path) => self.select_port(path),
            Command::SelectBaudRate(baud_rate) => self.select_baud_rate(baud_rate),
            Command::Connect(target) => self.connect(target).await,
            Command::ConnectSelected => {
                let (selected, baud_rate) = {
                    let shared = self.shared.read();
                    (shared.selected_port.clone(), shared.baud_rate)
                };
                match selected {
                    Some(path) => self.connect(SerialTarget::new(path, baud_rate)).await,
                    None => warn!("No serial port selected"),
                }
            }
            Command::Send(text) => self.send(text),
            Command::Disconnect => self.close_link().await,
            Command::ClearText => {
                self.shared.write().text.clear();
                self.emit(TransportEvent::TextCleared);
            }
            Command::Sync(done) => match &self.link {
                Some(link) => link.writer.flush(done),
                None => {
                    let _ = done.send(());
                }
            },
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    fn refresh_ports(&mut self) {
        let ports = match self.driver.available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        };
        debug!("Found {} serial ports", ports.len());

        let selection_changed = {
            let mut shared = self.shared.write();
            shared.ports = ports;

            let still_present = shared
                .selected_port
                .as_ref()
                .is_some_and(|path| shared.ports.iter().any(|p| p.path == *path));

            if still_present {
                false
            } else {
                let fallback = shared.ports.first().map(|p| p.path.clone());
                let changed = fallback != shared.selected_port;
                shared.selected_port = fallback;
                changed
            }
        };

        self.emit(TransportEvent::PortsChanged);
        if selection_changed {
            self.emit(TransportEvent::SelectionChanged);
        }
    }

    fn select_port(&mut self, path: Option<String>) {
        self.shared.write().selected_port = path;
        self.emit(TransportEvent::SelectionChanged);
    }

    fn select_baud_rate(&mut self, baud_rate: u32) {
        self.shared.write().baud_rate = baud_rate;
        if let Err(e) = self
            .preferences
            .set(BAUD_RATE_PREFERENCE_KEY, i64::from(baud_rate))
        {
            warn!("Failed to persist baud rate {}: {}", baud_rate, e);
        }
        self.emit(TransportEvent::SelectionChanged);
    }

    async fn connect(&mut self, target: SerialTarget) {
        if self.state() != ConnectionState::Idle {
            debug!("Closing current port before connecting to {}", target.path);
            self.close_link().await;
        }

        self.shared.write().selected_port = Some(target.path.clone());
        self.select_baud_rate(target.baud_rate);

        self.session += 1;
        let session = self.session;
        self.shared.write().active_port = Some(target.path.clone());
        self.set_state(ConnectionState::Connecting);

        let driver = self.driver.clone();
        let opens_tx = self.opens_tx.clone();
        tokio::spawn(async move {
            let result = driver.open(&target.path, target.baud_rate).await;
            let _ = opens_tx.send(OpenOutcome {
                session,
                path: target.path,
                result,
            });
        });
    }

    fn handle_open(&mut self, outcome: OpenOutcome) {
        if outcome.session != self.session || self.state() != ConnectionState::Connecting {
            // Dropping the connection closes the port.
            debug!("Discarding abandoned open of {}", outcome.path);
            return;
        }

        match outcome.result {
            Ok(connection) => {
                info!("Connected to {}", outcome.path);
                let writer = spawn_port_writer(outcome.path.clone(), connection.writer);
                self.link = Some(OpenLink {
                    path: outcome.path,
                    reader: connection.reader,
                    writer,
                });
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                warn!("Failed to open {}: {}", outcome.path, e);
                self.shared.write().active_port = None;
                self.set_state(ConnectionState::Idle);
                self.emit(TransportEvent::ConnectFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_read(&mut self, read: std::io::Result<usize>, buf: &[u8]) {
        match read {
            Ok(0) => self.link_lost("end of stream".to_string()).await,
            Ok(n) => {
                trace!("Read {} bytes", n);
                let appended = self.shared.write().text.append_bytes(&buf[..n]);
                if let Some(text) = appended {
                    self.emit(TransportEvent::TextReceived(text));
                }
            }
            Err(e) => self.link_lost(e.to_string()).await,
        }
    }

    /// The port went away without being asked to.
    async fn link_lost(&mut self, reason: String) {
        let path = self.link.as_ref().map(|link| link.path.clone());
        warn!(
            "Serial port {} removed: {}",
            path.as_deref().unwrap_or("?"),
            reason
        );
        self.close_link().await;
        self.refresh_ports();
    }

    fn send(&mut self, text: String) {
        match &self.link {
            Some(link) => link.writer.write(text.into_bytes()),
            None => debug!("Not connected, dropping {} bytes", text.len()),
        }
    }

    /// Close the port and abandon any open in flight. Idempotent.
    ///
    /// Writes still queued are dropped.
    async fn close_link(&mut self) {
        self.session += 1;
        if let Some(link) = self.link.take() {
            info!("Closing {}", link.path);
            drop(link.reader);
            link.writer.close().await;
        }
        self.shared.write().active_port = None;
        self.set_state(ConnectionState::Idle);
    }

    fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.shared.write().state, new_state);

        if old_state != new_state {
            debug!("Serial state changed: {} -> {}", old_state, new_state);
            self.emit(TransportEvent::StateChanged {
                old: old_state,
                new: new_state,
            });
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }
}
