//! Client-role Front Plane: bind a local listener and relay each accepted
//! connection over the tunnel as inner OPEN/DATA/CLOSE (§4.4)

use std::collections::HashMap;
use std::io::ErrorKind;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

use crate::error::FrontError;
use crate::front::{classify_listen_target, ListenTarget};
use crate::peer::multiplex::{close_message, data_message, new_tunnel_session_id, open_message};
use crate::peer::TunnelChannels;
use crate::registry::ClientTunnel;
use crate::wire::peer::{InnerMessage, InnerType};

const BIND_RETRY_PAUSE: Duration = Duration::from_secs(3);

enum ConnCommand {
    Data(Vec<u8>),
    Close,
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Pin<Box<dyn Stream>>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::pin(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::pin(stream))
            }
        }
    }
}

fn bind_address(configured: &str) -> &str {
    if configured.is_empty() {
        "0.0.0.0"
    } else {
        configured
    }
}

async fn bind_with_retry(tunnel: &ClientTunnel) -> Result<Listener, FrontError> {
    loop {
        let target = classify_listen_target(&tunnel.listen_address, &tunnel.listen_port)?;
        let result = match &target {
            ListenTarget::Tcp { address, port } => TcpListener::bind((bind_address(address), *port))
                .await
                .map(Listener::Tcp),
            ListenTarget::TcpAnyPort { address } => TcpListener::bind((bind_address(address), 0))
                .await
                .map(Listener::Tcp),
            #[cfg(unix)]
            ListenTarget::Unix { path } => {
                let _ = std::fs::remove_file(path);
                UnixListener::bind(path).map(Listener::Unix)
            }
            #[cfg(not(unix))]
            ListenTarget::Unix { .. } => {
                return Err(FrontError::BindFailed {
                    addr: tunnel.listen_port.clone(),
                    reason: "Unix-domain sockets are not supported on this platform".to_string(),
                })
            }
        };

        match result {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse || e.kind() == ErrorKind::PermissionDenied => {
                tracing::warn!(
                    "front plane bind on {}:{} failed ({e}), retrying in {:?}",
                    tunnel.listen_address,
                    tunnel.listen_port,
                    BIND_RETRY_PAUSE
                );
                tokio::time::sleep(BIND_RETRY_PAUSE).await;
            }
            Err(e) => {
                return Err(FrontError::BindFailed {
                    addr: format!("{}:{}", tunnel.listen_address, tunnel.listen_port),
                    reason: e.to_string(),
                })
            }
        }
    }
}

pub async fn run(
    tunnel: ClientTunnel,
    channels: TunnelChannels,
    mut cancel: oneshot::Receiver<()>,
) -> Result<(), FrontError> {
    let TunnelChannels {
        outbound,
        mut inbound,
    } = channels;
    let listener = bind_with_retry(&tunnel).await?;

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
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        let id = new_tunnel_session_id();
                        let (tx, rx) = mpsc::unbounded_channel();
                        conns.insert(id.clone(), tx);
                        let _ = outbound.send(open_message(&id));
                        tokio::spawn(run_connection(id, stream, rx, outbound.clone(), done_tx.clone()));
                    }
                    Err(e) => tracing::warn!("front plane accept failed: {e}"),
                }
            }
            message = inbound.recv() => {
                let Some(message) = message else { break };
                match InnerType::try_from(message.r#type) {
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
                    _ => tracing::debug!("client-side front plane ignoring inner type {}", message.r#type),
                }
            }
        }
    }
    Ok(())
}

async fn run_connection(
    id: String,
    mut stream: Pin<Box<dyn Stream>>,
    mut rx: mpsc::UnboundedReceiver<ConnCommand>,
    outbound: mpsc::UnboundedSender<InnerMessage>,
    done_tx: mpsc::UnboundedSender<String>,
) {
    let mut read_buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(ConnCommand::Data(bytes)) => {
                        if let Err(e) = stream.write_all(&bytes).await {
                            if e.kind() != ErrorKind::ConnectionReset {
                                tracing::warn!("front plane write for {id} failed: {e}");
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
                        if e.kind() != ErrorKind::ConnectionReset {
                            tracing::warn!("front plane read for {id} failed: {e}");
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
