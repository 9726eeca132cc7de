//! Server-role Front Plane: dial the local service named by the tunnel on
//! each inbound inner OPEN (§4.4)

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::FrontError;
use crate::peer::multiplex::{close_message, data_message};
use crate::peer::TunnelChannels;
use crate::registry::ServerTunnel;
use crate::wire::peer::{InnerMessage, InnerType};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

enum ConnCommand {
    Data(Vec<u8>),
    Close,
}

pub async fn run(
    server: ServerTunnel,
    channels: TunnelChannels,
    mut cancel: oneshot::Receiver<()>,
) -> Result<(), FrontError> {
    let TunnelChannels {
        outbound,
        mut inbound,
    } = channels;
    let mut conns: HashMap<String, mpsc::UnboundedSender<ConnCommand>> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            _ = &mut cancel => break,
            id = done_rx.recv() => {
                if let Some(id) = id {
                    conns.remove(&id);
                }
            }
            message = inbound.recv() => {
                let Some(message) = message else { break };
                dispatch(message, &server, &outbound, &done_tx, &mut conns);
            }
        }
    }
    Ok(())
}

fn dispatch(
    message: InnerMessage,
    server: &ServerTunnel,
    outbound: &mpsc::UnboundedSender<InnerMessage>,
    done_tx: &mpsc::UnboundedSender<String>,
    conns: &mut HashMap<String, mpsc::UnboundedSender<ConnCommand>>,
) {
    match InnerType::try_from(message.r#type) {
        Ok(InnerType::Open) => {
            let id = message.id;
            let (tx, rx) = mpsc::unbounded_channel();
            conns.insert(id.clone(), tx);
            tokio::spawn(run_connection(
                id,
                server.connect_address.clone(),
                server.connect_port,
                rx,
                outbound.clone(),
                done_tx.clone(),
            ));
        }
        Ok(InnerType::DataChunk) => {
            if let Some(tx) = conns.get(&message.id) {
                let _ = tx.send(ConnCommand::Data(message.payload));
            }
        }
        Ok(InnerType::Close) => {
            if let Some(tx) = conns.remove(&message.id) {
                let _ = tx.send(ConnCommand::Close);
            }
        }
        _ => tracing::debug!("server-side front plane ignoring inner type {}", message.r#type),
    }
}

/// One outbound dial per inner-OPEN id. Any DATA command sent before the
/// dial completes simply queues in `rx` (§4.4 "buffer outbound bytes until
/// the dial completes").
async fn run_connection(
    id: String,
    connect_address: String,
    connect_port: u16,
    mut rx: mpsc::UnboundedReceiver<ConnCommand>,
    outbound: mpsc::UnboundedSender<InnerMessage>,
    done_tx: mpsc::UnboundedSender<String>,
) {
    let addr = format!("{connect_address}:{connect_port}");
    let dialed = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await;
    let mut stream = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("front plane dial {addr} for {id} failed: {e}");
            let _ = outbound.send(close_message(&id));
            let _ = done_tx.send(id);
            return;
        }
        Err(_) => {
            tracing::warn!("front plane dial {addr} for {id} timed out");
            let _ = outbound.send(close_message(&id));
            let _ = done_tx.send(id);
            return;
        }
    };

    let mut read_buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(ConnCommand::Data(bytes)) => {
                        if let Err(e) = stream.write_all(&bytes).await {
                            if e.kind() != std::io::ErrorKind::ConnectionReset {
                                tracing::warn!("front plane write to {addr} for {id} failed: {e}");
                            }
                            break;
                        }
                    }
                    Some(ConnCommand::Close) | None => break,
                }
            }
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = outbound.send(data_message(&id, read_buf[..n].to_vec()));
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::ConnectionReset {
                            tracing::warn!("front plane read from {addr} for {id} failed: {e}");
                        }
                        break;
                    }
                }
            }
        }
    }

    let _ = outbound.send(close_message(&id));
    let _ = done_tx.send(id);
}
