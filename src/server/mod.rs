//! Single-client WebSocket server driving one delivery loop per connection.
//!
//! States: `Listening -> ClientConnected -> Streaming`, then back to
//! `Listening` through `Disconnected`, or to `Terminated` on shutdown or when
//! the producer is gone. Only one client is served at a time; further
//! connection attempts wait in the listen backlog.
//!
//! Producer exit is watched while listening too, so a client is never greeted
//! when there is nothing left to stream.

pub mod delivery;
pub mod websocket;

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::watch, time::timeout};

use self::{
    delivery::{ClientConnection, DeliveryEnd, run_delivery},
    websocket::WsConnection,
};
use crate::{
    error::{ChannelError, ServerError},
    pipeline::SampleReceiver,
};

pub use delivery::DeliveryReport;

/// Sent once to every new client before streaming starts.
pub const READY_MESSAGE: &str = "Initializing streaming";

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    ClientConnected,
    Streaming,
    Disconnected,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerExit {
    Shutdown,
    /// The sample channel terminated; there is nothing left to stream.
    ProducerGone(ChannelError),
}

/// Re-pollable view of the shutdown flag.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was requested. Cancel safe.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Every trigger is gone, so shutdown can no longer happen.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Cloneable remote control for a running [`StreamingServer`].
#[derive(Clone, Debug)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ServerState>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Waits until the server reports `target`. Returns `false` if the server
    /// went away first.
    pub async fn wait_for(&self, target: ServerState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|current| *current == target).await.is_ok()
    }
}

pub struct StreamingServer {
    listener: TcpListener,
    interval: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state_tx: watch::Sender<ServerState>,
}

impl StreamingServer {
    /// Binds the listening socket. Failing here aborts startup.
    pub async fn bind(host: &str, port: u16, interval: Duration) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;

        let (shutdown_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(ServerState::Listening);
        Ok(Self {
            listener,
            interval,
            shutdown_tx: Arc::new(shutdown_tx),
            state_tx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    fn set_state(&self, state: ServerState) {
        log::debug!("server state: {state:?}");
        self.state_tx.send_replace(state);
    }

    /// Serves clients one at a time until shutdown or until the sample
    /// channel terminates.
    pub async fn run(self, mut samples: SampleReceiver) -> ServerExit {
        let mut shutdown = ShutdownSignal::new(self.shutdown_tx.subscribe());

        let exit = loop {
            self.set_state(ServerState::Listening);

            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait() => break ServerExit::Shutdown,
                _ = samples.writer_gone() => {
                    break ServerExit::ProducerGone(ChannelError::EndOfStream);
                }
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("failed to accept connection: {err}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            self.set_state(ServerState::ClientConnected);
            let handshake = timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream));
            let socket = match handshake.await {
                Ok(Ok(socket)) => socket,
                Ok(Err(err)) => {
                    log::warn!("websocket handshake with {peer} failed: {err}");
                    continue;
                }
                Err(_) => {
                    log::warn!("websocket handshake with {peer} timed out");
                    continue;
                }
            };
            let mut conn = WsConnection::new(socket);
            log::info!("client {peer} connected");

            if samples.writer_is_gone() {
                conn.close().await;
                break ServerExit::ProducerGone(ChannelError::EndOfStream);
            }

            if let Err(err) = conn.send_text(READY_MESSAGE.to_string()).await {
                log::warn!("client {peer} dropped before streaming: {err}");
                continue;
            }

            self.set_state(ServerState::Streaming);
            let report = run_delivery(&mut conn, &samples, self.interval, &mut shutdown).await;
            conn.close().await;
            log::info!(
                "session with {peer} ended ({:?}): {} sent, {} failed, {} overwritten so far",
                report.end,
                report.sent,
                report.failed,
                samples.overwritten()
            );

            match report.end {
                DeliveryEnd::ClientDisconnected => {
                    log::info!("client {peer} disconnected");
                    self.set_state(ServerState::Disconnected);
                }
                // Shutdown wins over a producer that died with it.
                DeliveryEnd::ChannelTerminated(_) if shutdown.is_requested() => {
                    break ServerExit::Shutdown;
                }
                DeliveryEnd::ChannelTerminated(err) => break ServerExit::ProducerGone(err),
                DeliveryEnd::Shutdown => break ServerExit::Shutdown,
            }
        };

        samples.close();
        self.set_state(ServerState::Terminated);
        exit
    }
}
