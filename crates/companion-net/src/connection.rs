//! Connection lifecycle over an injected [`Transport`].
//!
//! Handles state transitions, retry on connect failure, and forwarding of
//! inbound frames to a single dispatch channel. State changes are published
//! through a [`watch`] channel so any number of observers can await them.

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc, watch};

use crate::error::ClientError;
use crate::reconnection::{ReconnectConfig, ReconnectState};
use crate::transport::{FrameReceiver, FrameSender, Transport};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `connect` is in progress (including retry pauses).
    Pending,
    Connected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Called once with the terminal error when connect retries are exhausted.
pub type FailureCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// One logical connection to the companion endpoint.
///
/// The sender half sits behind an async mutex so concurrent callers write
/// whole frames. The receiver half is owned by a background read task that
/// exits when the link fails or [`Connection::close`] is called.
pub struct Connection {
    transport: Arc<dyn Transport>,
    state: Arc<ConnectionStateWatch>,
    sender: Mutex<Option<Box<dyn FrameSender>>>,
    /// Sending `true` stops the read task of the current link.
    shutdown_tx: SyncMutex<Option<watch::Sender<bool>>>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Arc::new(ConnectionStateWatch::new()),
            sender: Mutex::new(None),
            shutdown_tx: SyncMutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.state.current() == ConnectionState::Connected
    }

    pub fn is_pending(&self) -> bool {
        self.state.current() == ConnectionState::Pending
    }

    /// Open a link to `address`, retrying per `retry`.
    ///
    /// Inbound frames are pushed to `inbound` until the link fails. When the
    /// retry budget is spent the state returns to `Disconnected`,
    /// `on_failure` is invoked with the terminal error, and that error is
    /// returned: [`ClientError::ServerNotResponsive`] if the endpoint refused
    /// the last attempt, the transport error otherwise.
    pub async fn connect(
        &self,
        address: &str,
        retry: &ReconnectConfig,
        on_failure: Option<FailureCallback>,
        inbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), ClientError> {
        if self.is_open() {
            return Ok(());
        }
        self.state.set(ConnectionState::Pending);
        let mut backoff = ReconnectState::new(retry.clone());

        loop {
            match self.transport.open(address).await {
                Ok(link) => {
                    self.install(link.sender, link.receiver, inbound).await;
                    tracing::info!(address, attempts = backoff.retries() + 1, "connected");
                    return Ok(());
                }
                Err(err) => {
                    let Some(delay) = backoff.next_delay() else {
                        self.state.set(ConnectionState::Disconnected);
                        let terminal = if err.is_refusal() {
                            ClientError::ServerNotResponsive(address.to_string())
                        } else {
                            ClientError::Transport(err)
                        };
                        tracing::error!(address, error = %terminal, "giving up on connection");
                        if let Some(callback) = on_failure {
                            callback(&terminal);
                        }
                        return Err(terminal);
                    };
                    tracing::warn!(
                        address,
                        attempt = backoff.retries(),
                        ?delay,
                        error = %err,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn install(
        &self,
        sender: Box<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
        inbound: mpsc::Sender<Vec<u8>>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Some(previous) = self.shutdown_tx.lock().replace(shutdown_tx) {
            let _ = previous.send(true);
        }
        *self.sender.lock().await = Some(sender);
        self.state.set(ConnectionState::Connected);

        let state = Arc::clone(&self.state);
        tokio::spawn(read_loop(receiver, inbound, state, shutdown_rx));
    }

    /// Transmit one frame. Fails fast unless the state is `Connected`.
    pub async fn send(&self, frame: &[u8]) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        let mut guard = self.sender.lock().await;
        let sender = guard.as_mut().ok_or(ClientError::NotConnected)?;
        sender.send(frame).await?;
        Ok(())
    }

    /// Release the link and force `Disconnected`. Idempotent.
    pub async fn close(&self) {
        if let Some(shutdown) = self.shutdown_tx.lock().take() {
            let _ = shutdown.send(true);
        }
        if let Some(mut sender) = self.sender.lock().await.take() {
            sender.close().await;
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

async fn read_loop(
    mut receiver: Box<dyn FrameReceiver>,
    inbound: mpsc::Sender<Vec<u8>>,
    state: Arc<ConnectionStateWatch>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = receiver.receive() => match result {
                Ok(frame) => {
                    if inbound.send(frame).await.is_err() {
                        tracing::debug!("dispatch loop gone, stopping reader");
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "connection lost");
                    if !*shutdown_rx.borrow() {
                        state.set(ConnectionState::Disconnected);
                    }
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}
