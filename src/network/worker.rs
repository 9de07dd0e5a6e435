use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::network::{NetworkError, NetworkOptions, EVENT_CHANNEL_CAPACITY};
use crate::protocol::auth::AuthManager;
use crate::protocol::codec::{authorize, framed, MessageReader, MessageWriter, ProtocolError};
use crate::protocol::message::{AuthChallenge, Message, MessageType};

/// What the worker's session layer hears from the network.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The master's first challenge of a connection was answered.
    Authenticated,
    /// A message from the master, received after the handshake.
    Message(Message),
    MasterDisconnected { reason: String },
}

/// Cloneable handle for writing to the current master, if any.
#[derive(Clone, Default)]
pub struct MasterLink {
    writer: Arc<Mutex<Option<MessageWriter>>>,
}

impl MasterLink {
    pub async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| NetworkError::NotConnected("master".to_string()))?;
        writer.write_message(message).await?;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    async fn attach(&self, writer: MessageWriter) {
        *self.writer.lock().await = Some(writer);
    }

    async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Listener side: accepts a master, answers its challenges and forwards
/// its messages. Connections are served one after another.
pub struct WorkerNetwork {
    auth: Arc<AuthManager>,
    acceptor: Option<TlsAcceptor>,
    options: NetworkOptions,
    link: MasterLink,
    events: mpsc::Sender<WorkerEvent>,
}

impl WorkerNetwork {
    pub fn new(
        auth: Arc<AuthManager>,
        acceptor: Option<TlsAcceptor>,
        options: NetworkOptions,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let network = Self {
            auth,
            acceptor,
            options,
            link: MasterLink::default(),
            events,
        };
        (network, rx)
    }

    pub fn link(&self) -> MasterLink {
        self.link.clone()
    }

    /// Accept masters until shutdown.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, tls = self.acceptor.is_some(), "Worker listening");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };
            tracing::info!(%peer, "Master connected");

            let reader = match self.open(stream).await {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Failed to set up master connection");
                    continue;
                }
            };

            let reason = self.serve(reader, &shutdown).await;
            self.link.detach().await;
            tracing::info!(%peer, reason = %reason, "Master disconnected");
            let _ = self
                .events
                .send(WorkerEvent::MasterDisconnected { reason })
                .await;
        }

        self.link.detach().await;
    }

    async fn open(&self, stream: TcpStream) -> Result<MessageReader, NetworkError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = match &self.acceptor {
            Some(acceptor) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "master".to_string());
                let tls = timeout(self.options.connection_timeout, acceptor.accept(stream))
                    .await
                    .map_err(|_| NetworkError::Timeout(format!("TLS handshake with {}", peer)))?
                    .map_err(|source| NetworkError::Handshake {
                        address: peer,
                        source,
                    })?;
                framed(tls, self.options.max_line_bytes)
            }
            None => framed(stream, self.options.max_line_bytes),
        };
        self.link.attach(writer).await;
        Ok(reader)
    }

    async fn serve(&self, mut reader: MessageReader, shutdown: &CancellationToken) -> String {
        let mut authenticated = false;
        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return "shutdown".to_string(),
                result = reader.read_message() => result,
            };

            let message = match result {
                Ok(message) => message,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "Discarding line from master");
                    continue;
                }
                Err(ProtocolError::ConnectionClosed) => return "connection closed".to_string(),
                Err(e) => return e.to_string(),
            };

            match message.kind {
                MessageType::AuthChallenge => {
                    let challenge = match message.payload::<AuthChallenge>() {
                        Ok(payload) => payload.challenge,
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed auth challenge");
                            continue;
                        }
                    };
                    let response = self.auth.respond(&challenge);
                    if let Err(e) = self.link.send(&Message::auth_response(&response)).await {
                        return e.to_string();
                    }
                    if !authenticated {
                        authenticated = true;
                        if self.events.send(WorkerEvent::Authenticated).await.is_err() {
                            return "event channel closed".to_string();
                        }
                    }
                }
                MessageType::Disconnect => return "master disconnected".to_string(),
                _ => match authorize(message, authenticated) {
                    Ok(message) => {
                        if self.events.send(WorkerEvent::Message(message)).await.is_err() {
                            return "event channel closed".to_string();
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping message from master"),
                },
            }
        }
    }
}
