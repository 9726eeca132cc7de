//! Local control socket (§6 "Local control socket", SPEC_FULL §3
//! "Control-socket interface stub")
//!
//! A Unix-domain listener at `/var/run/bhid/daemon[.<instance>].sock` (or a
//! caller-supplied path). Accepts one connection, reads one length-prefixed
//! [`ControlRequest`](crate::wire::control::ControlRequest), writes one
//! length-prefixed [`ControlResponse`](crate::wire::control::ControlResponse),
//! and closes — no session state, no keep-alive. Only the two read-only
//! request kinds that fall directly out of in-memory state already modeled
//! elsewhere in the daemon are wired; the broader CLI subcommand set stays
//! external per spec.md §1.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;

use crate::error::ControlError;
use crate::registry::{ConnectionsRegistry, Role};
use crate::wire::control::{
    control_response, ConnectionEntry, ConnectionsListResponse, ControlResponse, RequestType,
    StatusResponse, TunnelStatus,
};
use crate::wire::framing::{read_frame, write_frame};

/// Resolves the socket path from §6: `/var/run/bhid/daemon[.<instance>].sock`
/// unless `explicit` (a caller-supplied absolute path) is given.
pub fn socket_path(instance: Option<&str>, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match instance {
        Some(instance) => PathBuf::from(format!("/var/run/bhid/daemon.{instance}.sock")),
        None => PathBuf::from("/var/run/bhid/daemon.sock"),
    }
}

/// Runs the control socket accept loop until `shutdown` fires. Each
/// connection is handled to completion inline (one request, one response)
/// rather than spawned, since requests are cheap, non-blocking, in-memory
/// reads — matching the single-flow-of-control model in §5.
pub async fn serve(
    path: PathBuf,
    registry: Arc<Mutex<ConnectionsRegistry>>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), ControlError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).map_err(|e| ControlError::BindFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = handle_connection(stream, &registry).await {
                            tracing::debug!("control connection ended: {e}");
                        }
                    }
                    Err(e) => tracing::warn!("control socket accept failed: {e}"),
                }
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

async fn handle_connection(
    mut stream: UnixStream,
    registry: &Arc<Mutex<ConnectionsRegistry>>,
) -> Result<(), ControlError> {
    let request: crate::wire::control::ControlRequest = read_frame(&mut stream)
        .await
        .map_err(|e| ControlError::Decode { reason: e.to_string() })?;

    let response = match RequestType::try_from(request.r#type) {
        Ok(RequestType::Status) => status_response(registry),
        Ok(RequestType::ConnectionsList) => connections_list_response(registry),
        _ => ControlResponse {
            r#type: RequestType::Unknown as i32,
            ok: false,
            error: format!("unrecognized request type {}", request.r#type),
            payload: None,
        },
    };

    write_frame(&mut stream, &response).await?;
    Ok(())
}

fn status_response(registry: &Arc<Mutex<ConnectionsRegistry>>) -> ControlResponse {
    let guard = registry.lock().unwrap();
    let tunnels = guard
        .get_all()
        .map(|def| TunnelStatus {
            tracker: def.tracker.clone(),
            name: def.name.clone(),
            role: role_name(def.role.role()).to_string(),
            encrypted: def.encrypted,
            connected: def.connected,
        })
        .collect();

    ControlResponse {
        r#type: RequestType::Status as i32,
        ok: true,
        error: String::new(),
        payload: Some(control_response::Payload::Status(StatusResponse { tunnels })),
    }
}

fn connections_list_response(registry: &Arc<Mutex<ConnectionsRegistry>>) -> ControlResponse {
    let guard = registry.lock().unwrap();
    let connections = guard
        .get_all()
        .map(|def| {
            let peer = match &def.role {
                crate::registry::TunnelRole::Server(s) => format!("{}:{}", s.connect_address, s.connect_port),
                crate::registry::TunnelRole::Client(c) => format!("{}:{}", c.listen_address, c.listen_port),
            };
            ConnectionEntry {
                tracker: def.tracker.clone(),
                name: def.name.clone(),
                role: role_name(def.role.role()).to_string(),
                peer,
            }
        })
        .collect();

    ControlResponse {
        r#type: RequestType::ConnectionsList as i32,
        ok: true,
        error: String::new(),
        payload: Some(control_response::Payload::ConnectionsList(ConnectionsListResponse {
            connections,
        })),
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Server => "server",
        Role::Client => "client",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NullPeerEngineHandle;
    use crate::wire::control::ControlRequest;
    use std::sync::Arc;

    fn empty_registry() -> Arc<Mutex<ConnectionsRegistry>> {
        let path = std::env::temp_dir().join(format!("bhid-control-test-{}.conf", std::process::id()));
        Arc::new(Mutex::new(ConnectionsRegistry::new(
            path,
            Arc::new(NullPeerEngineHandle),
        )))
    }

    #[test]
    fn socket_path_uses_instance_suffix() {
        assert_eq!(socket_path(None, None), PathBuf::from("/var/run/bhid/daemon.sock"));
        assert_eq!(
            socket_path(Some("alt"), None),
            PathBuf::from("/var/run/bhid/daemon.alt.sock")
        );
    }

    #[test]
    fn explicit_path_overrides_default() {
        let explicit = PathBuf::from("/tmp/custom.sock");
        assert_eq!(socket_path(Some("alt"), Some(&explicit)), explicit);
    }

    #[test]
    fn status_response_is_empty_for_empty_registry() {
        let registry = empty_registry();
        let response = status_response(&registry);
        assert!(response.ok);
        match response.payload {
            Some(control_response::Payload::Status(StatusResponse { tunnels })) => {
                assert!(tunnels.is_empty());
            }
            _ => panic!("expected a status payload"),
        }
    }

    #[tokio::test]
    async fn serve_answers_one_status_request_then_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let registry = empty_registry();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let server_path = path.clone();
        let handle = tokio::spawn(serve(server_path, registry, shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        write_frame(
            &mut client,
            &ControlRequest {
                r#type: RequestType::Status as i32,
            },
        )
        .await
        .unwrap();
        let response: ControlResponse = read_frame(&mut client).await.unwrap();
        assert!(response.ok);

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
    }
}
