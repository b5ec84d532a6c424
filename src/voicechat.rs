// ===========================================
// Imports
// ===========================================
use crate::metrics;
use log::{debug, info, warn};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Notify;
use tokio::time::sleep;

const AUTHORIZATION_TTL: Duration = Duration::from_secs(10 * 60);
const SESSION_TTL: Duration = Duration::from_secs(10 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const READ_BUFFER_SIZE: usize = 65535;

// ===========================================
// Voice Chat UDP Relay
// ===========================================

/// Relays the voice chat companion protocol between clients and the real
/// server. Only source IPs that completed a whitelisted TCP login are
/// forwarded; everything else is dropped without a reply.
pub struct VoiceChatProxy {
    listener: UdpSocket,
    backend_addr: SocketAddr,
    // Session and authorization maps share one lock, which is never held
    // across socket I/O.
    state: Mutex<ProxyState>,
    closed: AtomicBool,
    shutdown: Notify,
}

#[derive(Default)]
struct ProxyState {
    // Keyed by the client's `ip:port`.
    sessions: HashMap<String, Arc<UdpSession>>,
    // Client IP -> authorization expiry.
    authorized: HashMap<String, Instant>,
}

struct UdpSession {
    backend: UdpSocket,
    client_addr: SocketAddr,
    last_seen: Mutex<Instant>,
    cancel: Notify,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }
}

impl VoiceChatProxy {
    /// Binds the relay listener. Returns `None` when either address is
    /// unconfigured, which disables the relay entirely.
    pub async fn new(listen_addr: &str, backend_addr: &str) -> io::Result<Option<Arc<Self>>> {
        if listen_addr.trim().is_empty() || backend_addr.trim().is_empty() {
            return Ok(None);
        }

        let backend_addr = lookup_host(backend_addr)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot resolve voice chat backend address {:?}", backend_addr),
                )
            })?;
        let listener = UdpSocket::bind(listen_addr).await?;

        Ok(Some(Arc::new(Self {
            listener,
            backend_addr,
            state: Mutex::new(ProxyState::default()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Main receive loop. Runs until `close` is called.
    pub async fn run(self: Arc<Self>) {
        info!(
            "UDP voice chat proxy listening on {} -> {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            self.backend_addr
        );

        let cleaner = Arc::clone(&self);
        tokio::spawn(async move { cleaner.cleanup_loop().await });

        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = &mut shutdown => return,
                received = self.listener.recv_from(&mut buf) => match received {
                    Ok((n, client_addr)) => {
                        Self::handle_client_datagram(&self, client_addr, &buf[..n]).await;
                    }
                    Err(e) => {
                        if self.closed.load(Ordering::SeqCst) {
                            return;
                        }
                        warn!("UDP proxy read error: {}", e);
                    }
                },
            }
        }
    }

    /// Grants (or extends) voice chat access for a client IP.
    pub fn authorize_ip(&self, client_ip: &str) {
        if client_ip.is_empty() {
            return;
        }
        let expiry = Instant::now() + AUTHORIZATION_TTL;
        self.state
            .lock()
            .unwrap()
            .authorized
            .insert(client_ip.to_string(), expiry);
        metrics::record_voicechat_authorization();
        debug!("Voice chat access granted to {}", client_ip);
    }

    /// Stops the proxy: wakes the receive and cleanup loops and tears down
    /// every session. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let sessions: Vec<Arc<UdpSession>> = {
            let mut state = self.state.lock().unwrap();
            state.authorized.clear();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.cancel.notify_waiters();
            metrics::record_voicechat_session_closed();
        }

        info!("UDP voice chat proxy stopped");
    }

    async fn handle_client_datagram(proxy: &Arc<Self>, client_addr: SocketAddr, payload: &[u8]) {
        if !proxy.is_authorized(&client_addr.ip().to_string()) {
            metrics::record_voicechat_drop("unauthorized");
            return;
        }

        let session = match Self::get_or_create_session(proxy, client_addr).await {
            Ok(session) => session,
            Err(e) => {
                warn!("UDP proxy session error for {}: {}", client_addr, e);
                metrics::record_voicechat_drop("session");
                return;
            }
        };

        if let Err(e) = session.backend.send(payload).await {
            warn!("UDP proxy forward error for {}: {}", client_addr, e);
            proxy.remove_session(&client_addr.to_string());
            return;
        }
        session.touch();
    }

    fn is_authorized(&self, ip: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.authorized.get(ip) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                state.authorized.remove(ip);
                false
            }
            None => false,
        }
    }

    async fn get_or_create_session(
        proxy: &Arc<Self>,
        client_addr: SocketAddr,
    ) -> io::Result<Arc<UdpSession>> {
        let key = client_addr.to_string();

        if let Some(existing) = proxy.state.lock().unwrap().sessions.get(&key) {
            existing.touch();
            return Ok(Arc::clone(existing));
        }

        // Dial outside the lock; a racing creation for the same key wins
        // below and this socket is simply dropped.
        let local = if proxy.backend_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let backend = UdpSocket::bind(local).await?;
        backend.connect(proxy.backend_addr).await?;

        let fresh = Arc::new(UdpSession {
            backend,
            client_addr,
            last_seen: Mutex::new(Instant::now()),
            cancel: Notify::new(),
        });

        let (session, created) = {
            let mut state = proxy.state.lock().unwrap();
            match state.sessions.entry(key.clone()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => (Arc::clone(entry.insert(fresh)), true),
            }
        };

        if created {
            metrics::record_voicechat_session_opened();
            debug!("Voice chat session opened for {}", client_addr);
            let runner = Arc::clone(proxy);
            let receiver = Arc::clone(&session);
            tokio::spawn(async move { runner.relay_backend_to_client(key, receiver).await });
        }
        Ok(session)
    }

    async fn relay_backend_to_client(self: Arc<Self>, key: String, session: Arc<UdpSession>) {
        let shutdown = self.shutdown.notified();
        let cancel = session.cancel.notified();
        tokio::pin!(shutdown, cancel);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = &mut shutdown => return,
                _ = &mut cancel => return,
                received = session.backend.recv(&mut buf) => {
                    let n = match received {
                        Ok(n) => n,
                        Err(e) => {
                            if !self.closed.load(Ordering::SeqCst) {
                                warn!(
                                    "UDP proxy backend read error for {}: {}",
                                    session.client_addr, e
                                );
                            }
                            self.remove_session(&key);
                            return;
                        }
                    };
                    if let Err(e) = self.listener.send_to(&buf[..n], session.client_addr).await {
                        warn!(
                            "UDP proxy write to client error for {}: {}",
                            session.client_addr, e
                        );
                        self.remove_session(&key);
                        return;
                    }
                    session.touch();
                }
            }
        }
    }

    fn remove_session(&self, key: &str) {
        let removed = self.state.lock().unwrap().sessions.remove(key);
        if let Some(session) = removed {
            session.cancel.notify_waiters();
            metrics::record_voicechat_session_closed();
            debug!("Voice chat session removed for {}", key);
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = sleep(CLEANUP_INTERVAL) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    let stale = {
                        let mut state = self.state.lock().unwrap();
                        state.collect_expired(Instant::now())
                    };
                    // Wake receivers only after the lock is released.
                    for session in stale {
                        session.cancel.notify_waiters();
                        metrics::record_voicechat_session_closed();
                        debug!("Voice chat session expired for {}", session.client_addr);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }
}

impl ProxyState {
    /// Drops expired authorizations and idle sessions, returning the removed
    /// sessions so the caller can tear them down outside the lock.
    fn collect_expired(&mut self, now: Instant) -> Vec<Arc<UdpSession>> {
        self.authorized.retain(|_, expiry| now < *expiry);

        let stale_keys: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                let last_seen = *session.last_seen.lock().unwrap();
                now.saturating_duration_since(last_seen) > SESSION_TTL
            })
            .map(|(key, _)| key.clone())
            .collect();

        stale_keys
            .into_iter()
            .filter_map(|key| self.sessions.remove(&key))
            .collect()
    }
}
