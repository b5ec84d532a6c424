// ===========================================
// Imports
// ===========================================
use crate::config_loader::{LoginConfig, StatusConfig};
use crate::forwarding;
use crate::metrics;
use crate::protocol;
use crate::voicechat::VoiceChatProxy;
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ===========================================
// Server Entry Point
// ===========================================

/// A running mock server: the TCP accept loop plus the optional voice chat
/// UDP relay.
pub struct MockServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    voicechat: Option<Arc<VoiceChatProxy>>,
}

impl MockServer {
    /// Binds the listener and starts serving. Bind failures (TCP or UDP)
    /// are fatal and surface here.
    pub async fn start(
        addr: &str,
        status_cfg: StatusConfig,
        login_cfg: LoginConfig,
    ) -> io::Result<MockServer> {
        let voicechat = VoiceChatProxy::new(
            &login_cfg.voicechat_listen_addr,
            &login_cfg.voicechat_backend_addr,
        )
        .await
        .map_err(|e| {
            io::Error::new(e.kind(), format!("start UDP voice chat proxy: {}", e))
        })?;
        match &voicechat {
            Some(proxy) => {
                tokio::spawn(Arc::clone(proxy).run());
            }
            None => info!("UDP voice chat proxy disabled"),
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let status_cfg = Arc::new(status_cfg);
        let login_cfg = Arc::new(login_cfg);
        let voicechat_handle = voicechat.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let status_cfg = Arc::clone(&status_cfg);
                        let login_cfg = Arc::clone(&login_cfg);
                        let voicechat = voicechat_handle.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, status_cfg, login_cfg, voicechat)
                                .await;
                        });
                    }
                    Err(e) => warn!("Connection error: {}", e),
                }
            }
        });

        Ok(MockServer {
            local_addr,
            accept_task,
            voicechat,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn voicechat_addr(&self) -> Option<SocketAddr> {
        self.voicechat
            .as_ref()
            .and_then(|proxy| proxy.local_addr().ok())
    }

    /// Parks on the accept loop; only returns if the loop is aborted.
    pub async fn wait(self) {
        let _ = self.accept_task.await;
    }

    /// Stops accepting and tears down the voice chat relay.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        if let Some(proxy) = &self.voicechat {
            proxy.close();
        }
    }
}

// ===========================================
// Connection Dispatcher
// ===========================================

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    status_cfg: Arc<StatusConfig>,
    login_cfg: Arc<LoginConfig>,
    voicechat: Option<Arc<VoiceChatProxy>>,
) {
    debug!("New connection from {}", peer);
    metrics::record_connection();

    let handshake_packet = match protocol::read_packet(&mut stream).await {
        Ok(packet) => packet,
        Err(e) => {
            info!("Failed to read handshake from {}: {}", peer, e);
            metrics::record_handshake_failure("read");
            return;
        }
    };

    let next_state = match protocol::read_handshake_next_state(&handshake_packet) {
        Ok(state) => state,
        Err(e) => {
            info!("Failed to parse handshake from {}: {}", peer, e);
            metrics::record_handshake_failure("parse");
            return;
        }
    };

    match next_state {
        1 => handle_status(stream, &status_cfg).await,
        2 => handle_login(stream, peer, handshake_packet, &login_cfg, voicechat).await,
        other => {
            info!("Unsupported next state {} from {}", other, peer);
            metrics::record_handshake_failure("next_state");
        }
    }
}

// ===========================================
// Status Handler
// ===========================================

async fn handle_status(mut stream: TcpStream, cfg: &StatusConfig) {
    let request = match protocol::read_packet(&mut stream).await {
        Ok(packet) => packet,
        Err(e) => {
            info!("Failed to read status request: {}", e);
            return;
        }
    };
    match protocol::split_packet_id(&request) {
        Ok((protocol::STATUS_REQUEST_ID, _)) => {}
        _ => {
            info!("Invalid status request packet");
            return;
        }
    }

    metrics::record_status_request();
    let response = match protocol::build_status_response(
        &cfg.version_name,
        cfg.protocol,
        &cfg.motd,
        cfg.max_players,
        cfg.online_players,
    ) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to build status response: {}", e);
            return;
        }
    };
    if let Err(e) = send_frame(&mut stream, &response).await {
        info!("Failed to send status response: {}", e);
        return;
    }

    let ping = match protocol::read_packet(&mut stream).await {
        Ok(packet) => packet,
        Err(e) => {
            info!("Failed to read ping request: {}", e);
            return;
        }
    };
    let payload = match protocol::split_packet_id(&ping) {
        Ok((protocol::PING_REQUEST_ID, payload)) => payload,
        _ => {
            info!("Invalid ping request packet");
            return;
        }
    };

    if let Err(e) = send_frame(&mut stream, &protocol::build_pong(payload)).await {
        info!("Failed to send pong: {}", e);
    }
}

// ===========================================
// Login Handler
// ===========================================

/// The three mutually exclusive ways a login attempt can end.
enum LoginOutcome {
    /// Whitelisted player with a configured backend: tunnel the connection.
    Proxy,
    /// Reject with a Login Disconnect reason box.
    Disconnect,
    /// Fake Login Success then disconnect in the Play state, so the client
    /// renders the reason as a full-screen "Connection Lost" title.
    ConnectionLostTitle,
}

fn decide_outcome(cfg: &LoginConfig, username: &str) -> LoginOutcome {
    if !cfg.real_server_addr.is_empty() && cfg.is_whitelisted(username) {
        LoginOutcome::Proxy
    } else if cfg.force_connection_lost_title {
        LoginOutcome::ConnectionLostTitle
    } else {
        LoginOutcome::Disconnect
    }
}

async fn handle_login(
    mut stream: TcpStream,
    peer: SocketAddr,
    handshake_packet: Vec<u8>,
    cfg: &LoginConfig,
    voicechat: Option<Arc<VoiceChatProxy>>,
) {
    let login_start_packet = match protocol::read_packet(&mut stream).await {
        Ok(packet) => packet,
        Err(e) => {
            info!("Failed to read login start: {}", e);
            return;
        }
    };
    let username = match protocol::read_login_start_username(&login_start_packet) {
        Ok(username) => username,
        Err(e) => {
            info!("Failed to parse login start username: {}", e);
            return;
        }
    };

    let client_ip = peer.ip().to_string();
    info!("Login attempt: username={:?} ip={}", username, client_ip);
    metrics::record_login_attempt();

    match decide_outcome(cfg, &username) {
        LoginOutcome::Proxy => {
            if let Some(proxy) = &voicechat {
                proxy.authorize_ip(&client_ip);
            }
            metrics::record_login_outcome("proxy");
            if let Err(e) = proxy_to_real_server(
                &mut stream,
                &cfg.real_server_addr,
                &handshake_packet,
                &login_start_packet,
                &username,
            )
            .await
            {
                warn!("Proxy error for {:?}: {}", username, e);
                metrics::record_backend_failure("tunnel");
                send_disconnect(&mut stream, cfg, protocol::build_login_disconnect).await;
            }
        }
        LoginOutcome::Disconnect => {
            if cfg.error_delay > Duration::ZERO {
                sleep(cfg.error_delay).await;
            }
            metrics::record_login_outcome("disconnect");
            send_disconnect(&mut stream, cfg, protocol::build_login_disconnect).await;
        }
        LoginOutcome::ConnectionLostTitle => {
            if cfg.error_delay > Duration::ZERO {
                sleep(cfg.error_delay).await;
            }
            metrics::record_login_outcome("connection_lost_title");
            if let Err(e) = send_frame(&mut stream, &protocol::build_login_success(&username)).await
            {
                info!("Failed to send login success: {}", e);
                return;
            }
            send_disconnect(&mut stream, cfg, protocol::build_play_disconnect).await;
        }
    }
}

// ===========================================
// Backend Tunnel
// ===========================================

/// Opens the tunnel to the real server, replays the two opening frames
/// byte-for-byte, then turns the connection into a transparent pipe.
async fn proxy_to_real_server(
    client: &mut TcpStream,
    backend_addr: &str,
    handshake_packet: &[u8],
    login_start_packet: &[u8],
    username: &str,
) -> io::Result<()> {
    let mut backend = match timeout(CONNECT_TIMEOUT, TcpStream::connect(backend_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(io::Error::new(
                e.kind(),
                format!("connect to real server {}: {}", backend_addr, e),
            ))
        }
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to real server {} timed out", backend_addr),
            ))
        }
    };

    backend
        .write_all(&protocol::wrap_packet(handshake_packet))
        .await?;
    backend
        .write_all(&protocol::wrap_packet(login_start_packet))
        .await?;
    backend.flush().await?;

    info!("Proxy enabled for username={:?} -> {}", username, backend_addr);
    metrics::record_tunnel_opened();
    let result = forwarding::relay(client, &mut backend).await;
    metrics::record_tunnel_closed();
    result
}

// ===========================================
// Write Helpers
// ===========================================

async fn send_frame(stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

async fn send_disconnect(
    stream: &mut TcpStream,
    cfg: &LoginConfig,
    build: fn(&str, &str) -> io::Result<Vec<u8>>,
) {
    let frame = match build(&cfg.error_title, &cfg.error_message) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to build disconnect reason: {}", e);
            return;
        }
    };
    if let Err(e) = send_frame(stream, &frame).await {
        info!("Failed to send disconnect: {}", e);
    }
}
