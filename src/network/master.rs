use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::network::{NetworkError, NetworkOptions, EVENT_CHANNEL_CAPACITY};
use crate::protocol::auth::AuthManager;
use crate::protocol::codec::{authorize, framed, MessageReader, MessageWriter, ProtocolError};
use crate::protocol::message::{AuthResponse, Message, MessageType};
use crate::tls::ClientTls;

/// What the master's session layer hears from the network.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A worker connection completed the auth handshake.
    Connected { worker_id: String, address: String },
    /// An authenticated message from a worker.
    Message { worker_id: String, message: Message },
    /// A worker left the peer table.
    Disconnected { worker_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub worker_id: String,
    pub address: String,
    pub connected_at: DateTime<Utc>,
    pub authenticated: bool,
}

struct PeerHandle {
    writer: Arc<Mutex<MessageWriter>>,
    /// Distinguishes successive connections to the same worker id.
    generation: u64,
    address: String,
    connected_at: DateTime<Utc>,
    reader: JoinHandle<()>,
}

/// Outbound connections to workers.
pub struct MasterNetwork {
    auth: Arc<AuthManager>,
    tls: Option<ClientTls>,
    options: NetworkOptions,
    peers: RwLock<HashMap<String, PeerHandle>>,
    events: mpsc::Sender<NetworkEvent>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl MasterNetwork {
    pub fn new(
        auth: Arc<AuthManager>,
        tls: Option<ClientTls>,
        options: NetworkOptions,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<NetworkEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let network = Arc::new(Self {
            auth,
            tls,
            options,
            peers: RwLock::new(HashMap::new()),
            events,
            next_generation: AtomicU64::new(1),
            shutdown,
        });
        (network, rx)
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    /// Connect to a worker, run the auth handshake and start its reader loop.
    /// An existing connection under the same id is replaced.
    pub async fn connect_worker(
        self: &Arc<Self>,
        worker_id: &str,
        address: &str,
    ) -> Result<(), NetworkError> {
        let limit = self.options.connection_timeout;
        let tcp = timeout(limit, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connecting to {}", address)))?
            .map_err(|source| NetworkError::Connect {
                address: address.to_string(),
                source,
            })?;
        tcp.set_nodelay(true)?;

        let (mut reader, mut writer) = match &self.tls {
            Some(tls) => {
                let stream = timeout(limit, tls.connect(tcp))
                    .await
                    .map_err(|_| NetworkError::Timeout(format!("TLS handshake with {}", address)))?
                    .map_err(|source| NetworkError::Handshake {
                        address: address.to_string(),
                        source,
                    })?;
                framed(stream, self.options.max_line_bytes)
            }
            None => framed(tcp, self.options.max_line_bytes),
        };

        if let Err(e) = self.handshake(worker_id, &mut reader, &mut writer).await {
            self.auth.revoke(worker_id);
            let _ = writer.shutdown().await;
            return Err(e);
        }

        tracing::info!(worker_id, address, tls = self.tls.is_some(), "Worker connected");
        let _ = self
            .events
            .send(NetworkEvent::Connected {
                worker_id: worker_id.to_string(),
                address: address.to_string(),
            })
            .await;

        // The reader may finish at once; holding the write lock until the
        // entry is in place lets its cleanup find it.
        let mut peers = self.peers.write().await;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let reader_task = tokio::spawn(
            Arc::clone(self).read_loop(worker_id.to_string(), generation, reader),
        );
        let handle = PeerHandle {
            writer: Arc::new(Mutex::new(writer)),
            generation,
            address: address.to_string(),
            connected_at: Utc::now(),
            reader: reader_task,
        };
        if let Some(old) = peers.insert(worker_id.to_string(), handle) {
            tracing::warn!(worker_id, "Replacing existing connection");
            old.reader.abort();
        }
        Ok(())
    }

    /// Send a challenge and wait for a valid answer. Wrong answers and
    /// unauthenticated traffic are dropped until the deadline.
    async fn handshake(
        &self,
        worker_id: &str,
        reader: &mut MessageReader,
        writer: &mut MessageWriter,
    ) -> Result<(), NetworkError> {
        let challenge = self.auth.issue_challenge(worker_id);
        writer.write_message(&Message::auth_challenge(&challenge)).await?;

        let deadline = Instant::now() + self.options.connection_timeout;
        loop {
            let message = match timeout_at(deadline, reader.read_message()).await {
                Err(_) => return Err(NetworkError::AuthFailed(worker_id.to_string())),
                Ok(Ok(message)) => message,
                Ok(Err(e)) if e.is_recoverable() => {
                    tracing::warn!(worker_id, error = %e, "Discarding line during handshake");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };

            match message.kind {
                MessageType::AuthResponse => {
                    if self.verify(worker_id, &message) {
                        tracing::info!(worker_id, "Worker authenticated");
                        return Ok(());
                    }
                }
                MessageType::Disconnect => {
                    return Err(ProtocolError::ConnectionClosed.into());
                }
                other => {
                    tracing::warn!(worker_id, message_type = %other, "Dropping message before authentication");
                }
            }
        }
    }

    fn verify(&self, worker_id: &str, message: &Message) -> bool {
        match message.payload::<AuthResponse>() {
            Ok(answer) => self.auth.verify_response(worker_id, &answer.response),
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Malformed auth response");
                false
            }
        }
    }

    async fn read_loop(self: Arc<Self>, worker_id: String, generation: u64, mut reader: MessageReader) {
        let reason = loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break "shutdown".to_string(),
                result = reader.read_message() => result,
            };

            let message = match result {
                Ok(message) => message,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Discarding line");
                    continue;
                }
                Err(ProtocolError::ConnectionClosed) => break "connection closed".to_string(),
                Err(e) => break e.to_string(),
            };

            match message.kind {
                MessageType::AuthResponse => {
                    if self.verify(&worker_id, &message) {
                        tracing::info!(worker_id = %worker_id, "Worker re-authenticated");
                    }
                }
                MessageType::Disconnect => break "worker disconnected".to_string(),
                _ => match authorize(message, self.auth.is_authenticated(&worker_id)) {
                    Ok(message) => {
                        let event = NetworkEvent::Message {
                            worker_id: worker_id.clone(),
                            message,
                        };
                        if self.events.send(event).await.is_err() {
                            break "event channel closed".to_string();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Dropping message from worker");
                    }
                },
            }
        };

        if self.take_peer(&worker_id, generation).await.is_some() {
            self.emit_disconnected(&worker_id, reason).await;
        }
    }

    /// Remove the peer entry if it still belongs to `generation`.
    async fn take_peer(&self, worker_id: &str, generation: u64) -> Option<PeerHandle> {
        let mut peers = self.peers.write().await;
        if peers.get(worker_id).map(|p| p.generation) != Some(generation) {
            return None;
        }
        let handle = peers.remove(worker_id);
        drop(peers);
        self.auth.revoke(worker_id);
        handle
    }

    async fn emit_disconnected(&self, worker_id: &str, reason: String) {
        tracing::info!(worker_id, reason = %reason, "Worker disconnected");
        let _ = self
            .events
            .send(NetworkEvent::Disconnected {
                worker_id: worker_id.to_string(),
                reason,
            })
            .await;
    }

    /// Send one message to a worker. A failed write evicts the peer.
    pub async fn send(&self, worker_id: &str, message: &Message) -> Result<(), NetworkError> {
        let (writer, generation) = {
            let peers = self.peers.read().await;
            let peer = peers
                .get(worker_id)
                .ok_or_else(|| NetworkError::NotConnected(worker_id.to_string()))?;
            (Arc::clone(&peer.writer), peer.generation)
        };

        let result = writer.lock().await.write_message(message).await;
        if let Err(e) = result {
            tracing::warn!(worker_id, message_type = %message.kind, error = %e, "Send failed, evicting worker");
            if let Some(handle) = self.take_peer(worker_id, generation).await {
                handle.reader.abort();
                self.emit_disconnected(worker_id, format!("send failed: {}", e)).await;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Issue a fresh challenge on an existing connection.
    pub async fn reauthenticate(&self, worker_id: &str) -> Result<(), NetworkError> {
        let challenge = self.auth.issue_challenge(worker_id);
        tracing::debug!(worker_id, "Re-authenticating worker");
        self.send(worker_id, &Message::auth_challenge(&challenge)).await
    }

    /// Re-challenge `worker_id` if its session is about to end. Returns
    /// whether a challenge was sent.
    pub async fn renew_session(&self, worker_id: &str) -> Result<bool, NetworkError> {
        if !self.auth.needs_reauth(worker_id) {
            return Ok(false);
        }
        self.reauthenticate(worker_id).await?;
        Ok(true)
    }

    /// Tell a worker to go away and drop its connection.
    pub async fn disconnect_worker(&self, worker_id: &str, reason: &str) -> bool {
        let generation = match self.peers.read().await.get(worker_id) {
            Some(peer) => peer.generation,
            None => return false,
        };
        let _ = self.send(worker_id, &Message::disconnect(reason)).await;

        let Some(handle) = self.take_peer(worker_id, generation).await else {
            return false;
        };
        handle.reader.abort();
        let _ = handle.writer.lock().await.shutdown().await;
        self.emit_disconnected(worker_id, reason.to_string()).await;
        true
    }

    pub async fn disconnect_all(&self, reason: &str) {
        for worker_id in self.connected_workers().await {
            self.disconnect_worker(&worker_id, reason).await;
        }
    }

    pub async fn is_connected(&self, worker_id: &str) -> bool {
        self.peers.read().await.contains_key(worker_id)
    }

    pub async fn connected_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        let mut info: Vec<PeerInfo> = peers
            .iter()
            .map(|(id, peer)| PeerInfo {
                worker_id: id.clone(),
                address: peer.address.clone(),
                connected_at: peer.connected_at,
                authenticated: self.auth.is_authenticated(id),
            })
            .collect();
        info.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        info
    }
}
