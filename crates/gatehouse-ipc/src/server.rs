//! IPC server implementation

use gatehouse_api::{ClientInfo, ClientRole, Command, ErrorCode, ErrorInfo, Event, Request, Response};
use gatehouse_util::ClientId;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult};

/// Message from a connection task to the service
#[derive(Debug)]
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

/// IPC server
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    event_tx: broadcast::Sender<Event>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    message_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>>,
}

struct ClientHandle {
    info: ClientInfo,
    response_tx: mpsc::UnboundedSender<String>,
    subscribed: bool,
}

/// Role for a peer: the service's own user and root administer, other local
/// users get the shell role, peers without credentials may only observe.
pub fn role_for_uid(uid: Option<u32>, service_uid: u32) -> ClientRole {
    match uid {
        Some(0) => ClientRole::Admin,
        Some(u) if u == service_uid => ClientRole::Admin,
        Some(_) => ClientRole::Shell,
        None => ClientRole::Observer,
    }
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            message_tx,
            message_rx: Arc::new(Mutex::new(Some(message_rx))),
        }
    }

    /// Bind the socket, replacing a stale one
    pub async fn start(&mut self) -> IpcResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Owner only; the service runs as the user it guards
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;

        info!(path = %self.socket_path.display(), "IPC server listening");

        self.listener = Some(listener);

        Ok(())
    }

    /// Take the receiver for connection messages. Only the first call gets it.
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.message_rx.lock().await.take()
    }

    /// Accept connections until the listener fails
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;
        let service_uid = nix::unistd::getuid().as_raw();

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let client_id = ClientId::new();
                    let uid = get_peer_uid(&stream);
                    let role = role_for_uid(uid, service_uid);

                    let info = ClientInfo {
                        client_id: client_id.clone(),
                        role,
                        uid,
                    };

                    debug!(client_id = %client_id, uid = ?uid, role = ?role, "Connection accepted");

                    self.handle_client(stream, client_id, info).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream, client_id: ClientId, info: ClientInfo) {
        let (read_half, write_half) = stream.into_split();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<String>();

        {
            let mut clients = self.clients.write().await;
            clients.insert(
                client_id.clone(),
                ClientHandle {
                    info: info.clone(),
                    response_tx: response_tx.clone(),
                    subscribed: false,
                },
            );
        }

        let _ = self.message_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        let clients = self.clients.clone();
        let message_tx = self.message_tx.clone();
        let reader_id = client_id.clone();

        // Reader: parse requests and forward them to the service
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(client_id = %reader_id, "Client disconnected (EOF)");
                        break;
                    }
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }

                        match serde_json::from_str::<Request>(line) {
                            Ok(request) => {
                                let subscribed = match request.command {
                                    Command::SubscribeEvents => Some(true),
                                    Command::UnsubscribeEvents => Some(false),
                                    _ => None,
                                };
                                if let Some(subscribed) = subscribed {
                                    let mut clients = clients.write().await;
                                    if let Some(handle) = clients.get_mut(&reader_id) {
                                        handle.subscribed = subscribed;
                                    }
                                }

                                let _ = message_tx.send(ServerMessage::Request {
                                    client_id: reader_id.clone(),
                                    request,
                                });
                            }
                            Err(e) => {
                                warn!(client_id = %reader_id, error = %e, "Invalid request");
                                let response = Response::error(
                                    0,
                                    ErrorInfo::new(ErrorCode::InvalidRequest, e.to_string()),
                                );
                                if let Ok(json) = serde_json::to_string(&response) {
                                    let _ = response_tx.send(json);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(client_id = %reader_id, error = %e, "Read error");
                        break;
                    }
                }
            }

            // Dropping the handle closes the writer's response channel
            clients.write().await.remove(&reader_id);
        });

        // Writer: responses, plus events for subscribed clients
        let mut event_rx = self.event_tx.subscribe();
        let clients_writer = self.clients.clone();
        let writer_id = client_id;
        let message_tx_writer = self.message_tx.clone();

        tokio::spawn(async move {
            let mut writer = write_half;

            loop {
                tokio::select! {
                    response = response_rx.recv() => {
                        let Some(mut msg) = response else {
                            break;
                        };
                        msg.push('\n');
                        if let Err(e) = writer.write_all(msg.as_bytes()).await {
                            debug!(client_id = %writer_id, error = %e, "Write error");
                            break;
                        }
                    }

                    Ok(event) = event_rx.recv() => {
                        let is_subscribed = {
                            let clients = clients_writer.read().await;
                            clients.get(&writer_id).map(|h| h.subscribed).unwrap_or(false)
                        };

                        if is_subscribed
                            && let Ok(mut msg) = serde_json::to_string(&event)
                        {
                            msg.push('\n');
                            if let Err(e) = writer.write_all(msg.as_bytes()).await {
                                debug!(client_id = %writer_id, error = %e, "Event write error");
                                break;
                            }
                        }
                    }
                }
            }

            let _ = message_tx_writer.send(ServerMessage::ClientDisconnected {
                client_id: writer_id.clone(),
            });

            clients_writer.write().await.remove(&writer_id);
        });
    }

    /// Send a response to one client
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let json = serde_json::to_string(&response)?;

        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(client_id) {
            handle
                .response_tx
                .send(json)
                .map_err(|_| IpcError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Broadcast an event to all subscribed clients
    pub fn broadcast_event(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|h| h.info.clone())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Remove the socket file
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Peer UID from the socket's credentials
fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    let fd = stream.as_fd();
    nix::sys::socket::getsockopt(&fd, nix::sys::socket::sockopt::PeerCredentials)
        .ok()
        .map(|cred| cred.uid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcClient;
    use gatehouse_api::{EventPayload, ResponsePayload, ResponseResult};
    use tempfile::tempdir;

    /// Start a server that answers every request with `Pong`
    async fn echo_server(socket_path: &Path) -> Arc<IpcServer> {
        let mut server = IpcServer::new(socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);

        let mut messages = server.take_message_receiver().await.unwrap();
        let accept = server.clone();
        tokio::spawn(async move {
            let _ = accept.run().await;
        });

        let responder = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                if let ServerMessage::Request { client_id, request } = msg {
                    let response = Response::success(request.request_id, ResponsePayload::Pong);
                    let _ = responder.send_response(&client_id, response).await;
                }
            }
        });

        server
    }

    #[tokio::test]
    async fn test_server_start() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();

        assert!(socket_path.exists());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(server);
        assert!(!socket_path.exists());
    }

    #[test]
    fn roles_follow_peer_uid() {
        assert_eq!(role_for_uid(Some(0), 1000), ClientRole::Admin);
        assert_eq!(role_for_uid(Some(1000), 1000), ClientRole::Admin);
        assert_eq!(role_for_uid(Some(1001), 1000), ClientRole::Shell);
        assert_eq!(role_for_uid(None, 1000), ClientRole::Observer);
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let _server = echo_server(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let first = client.send(Command::Ping).await.unwrap();
        let second = client.send(Command::GetHealth).await.unwrap();

        assert_eq!(first.request_id, 1);
        assert_eq!(second.request_id, 2);
        assert!(matches!(first.result, ResponseResult::Ok(ResponsePayload::Pong)));
    }

    #[tokio::test]
    async fn malformed_line_gets_invalid_request() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let _server = echo_server(&socket_path).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"{not json}\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(line.trim()).unwrap();

        match response.result {
            ResponseResult::Err(e) => assert_eq!(e.code, ErrorCode::InvalidRequest),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribed_clients_receive_events() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let server = echo_server(&socket_path).await;

        let client = IpcClient::connect(&socket_path).await.unwrap();
        let mut events = client.subscribe().await.unwrap();

        server.broadcast_event(Event::new(EventPayload::PolicyReloaded { monitored_sites: 4 }));

        let event = events.next().await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::PolicyReloaded { monitored_sites: 4 }
        ));
    }
}
