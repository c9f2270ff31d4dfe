//! TCP control socket: length-prefixed JSON commands in, broadcasts out.

use std::collections::HashSet;
use std::sync::Arc;

use radio_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use radio_proto::state::StateManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::DaemonEvent;
use crate::BroadcastMessage;

/// Ids of the currently connected clients.
#[derive(Default)]
pub struct ClientRegistry {
    next_id: Mutex<usize>,
    connected: Mutex<HashSet<usize>>,
}

impl ClientRegistry {
    /// Register a new client; returns its id and the new client count.
    async fn add(&self) -> (usize, usize) {
        let id = {
            let mut next = self.next_id.lock().await;
            *next += 1;
            *next
        };
        let mut connected = self.connected.lock().await;
        connected.insert(id);
        (id, connected.len())
    }

    async fn remove(&self, id: usize) -> usize {
        let mut connected = self.connected.lock().await;
        connected.remove(&id);
        connected.len()
    }
}

/// Split complete frames off the front of `buf`.  Frames that are not
/// commands are dropped; a partial frame stays in the buffer.
pub fn take_commands(buf: &mut Vec<u8>) -> Vec<Command> {
    let mut commands = Vec::new();
    while buf.len() >= 4 {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            break;
        }
        match Message::decode(buf) {
            Ok((Message::Command(cmd), _)) => commands.push(cmd),
            Ok(_) => {}
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
        buf.drain(..4 + len);
    }
    commands
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    clients: Arc<ClientRegistry>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };
        info!("TCP server listening at {}", addr);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let (id, count) = clients.add().await;
            info!("Client {} connected from {}", id, peer);
            let _ = event_tx.send(DaemonEvent::ClientConnected).await;
            let _ = event_tx.send(DaemonEvent::ClientCountChanged(count)).await;

            let state_manager = Arc::clone(&state_manager);
            let clients = Arc::clone(&clients);
            let event_tx = event_tx.clone();
            let broadcast_rx = broadcast_tx.subscribe();
            tokio::spawn(async move {
                handle_client(stream, &state_manager, id, &event_tx, broadcast_rx).await;
                let count = clients.remove(id).await;
                info!("Client {} disconnected", id);
                let _ = event_tx.send(DaemonEvent::ClientCountChanged(count)).await;
            });
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    state_manager: &StateManager,
    client_id: usize,
    event_tx: &mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let state = state_manager.get_state().await;
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: state.rev,
        state,
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                let n = match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                };
                read_buf.extend_from_slice(&tmp[..n]);
                for cmd in take_commands(&mut read_buf) {
                    debug!("Client {} sent command: {:?}", client_id, cmd);
                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                        warn!("DaemonEvent channel closed");
                        return;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::StateUpdated) => Broadcast::State {
                        data: state_manager.get_state().await,
                    },
                    Ok(BroadcastMessage::StateChange(change)) => Broadcast::StateChange { change },
                    Ok(BroadcastMessage::Diagnostic(diagnostic)) => {
                        Broadcast::Diagnostic { diagnostic }
                    }
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Ok(BroadcastMessage::Error(message)) => Broadcast::Error { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // resync with a full snapshot
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::State {
                            data: state_manager.get_state().await,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send(&mut write_half, broadcast).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}
