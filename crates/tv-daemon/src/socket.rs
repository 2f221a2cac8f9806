//! TCP control socket — the seam where remote controls plug in.
//!
//! Clients speak the tv-proto framed protocol: they receive a `Hello` with a
//! state snapshot on connect, send `Command` frames, and receive every
//! notification the core broadcasts.  All commands are forwarded into the
//! core's event channel; the socket never touches core state directly.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info, warn};

use tv_proto::protocol::{Broadcast, Command, Decoded, Message, TvState, PROTOCOL_VERSION};

use crate::core::CoreEvent;

pub fn start_server(
    bind_address: String,
    port: u16,
    state: Arc<RwLock<TvState>>,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("failed to bind control socket {}: {}", addr, e);
                return;
            }
        };

        info!("control socket listening at {}", addr);

        let mut client_id = 0usize;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("client {} connected from {}", id, peer);

                    let state = Arc::clone(&state);
                    let event_tx = event_tx.clone();
                    let broadcast_rx = broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, state, id, event_tx, broadcast_rx).await;
                        info!("client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<RwLock<TvState>>,
    client_id: usize,
    event_tx: mpsc::Sender<CoreEvent>,
    mut broadcast_rx: broadcast::Receiver<Broadcast>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Greet with the protocol version and a full snapshot.
    if let Ok(encoded) = encode_hello(&state).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::decode(&read_buf) {
                                Decoded::Frame(Message::Command(cmd), consumed) => {
                                    read_buf.drain(..consumed);
                                    info!("client {} sent {:?}", client_id, cmd);

                                    let wants_state = matches!(cmd, Command::GetState);
                                    if !wants_state
                                        && event_tx.send(CoreEvent::Command(cmd)).await.is_err()
                                    {
                                        warn!("core event channel closed");
                                        return;
                                    }
                                    if wants_state {
                                        if let Ok(encoded) = encode_state(&state).await {
                                            if write_half.write_all(&encoded).await.is_err() {
                                                return;
                                            }
                                        }
                                    }
                                }
                                Decoded::Frame(_, consumed) => {
                                    // Clients have no business sending broadcasts.
                                    read_buf.drain(..consumed);
                                }
                                Decoded::Malformed(consumed) => {
                                    // Drop the bad frame; the stream itself is
                                    // still aligned thanks to the length prefix.
                                    warn!("client {} sent a malformed frame", client_id);
                                    read_buf.drain(..consumed);
                                }
                                Decoded::Incomplete => break, // keep buffering
                            }
                        }
                    }
                    Err(e) => {
                        error!("read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(broadcast) => {
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed notifications — resync with a snapshot.
                        warn!("client {} missed {} broadcasts", client_id, n);
                        if let Ok(encoded) = encode_state(&state).await {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

async fn encode_hello(state: &Arc<RwLock<TvState>>) -> anyhow::Result<Vec<u8>> {
    let snapshot = state.read().await.clone();
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: snapshot,
    })
    .encode()
}

async fn encode_state(state: &Arc<RwLock<TvState>>) -> anyhow::Result<Vec<u8>> {
    let snapshot = state.read().await.clone();
    Message::Broadcast(Broadcast::State { data: snapshot }).encode()
}
