//! Peer-to-peer TCP transport between the two sites.
//!
//! One side binds and listens (`server`), the other dials (`client`); apart
//! from who initiates, the link is symmetric. All application traffic is
//! encrypted by [`SecureChannel`] and framed as base64 lines; inbound frames
//! are dispatched through a command-handler registry.
//!
//! ## State machine
//! ```text
//! DISCONNECTED ──start()──► HANDSHAKING ──auth ok──► AUTHENTICATED
//!        ▲                       │                        │
//!        └── auth fail/timeout ──┘      silence 15 s or send error
//!        ▲                                               │
//!        └───────────────────────────────────────────────┘
//! ```

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::protocol::{self, Handshake};
use crate::secure::SecureChannel;

/// Who listens and who dials. Nothing else differs between the sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub mode: PeerMode,
    /// Server mode: address to bind (usually 0.0.0.0). Client mode: the
    /// server's address to dial.
    pub server_ip: String,
    pub port: u16,
    pub psk: String,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub connect_retries: u32,
}

impl PeerConfig {
    /// Inbound silence beyond this declares the peer dead.
    fn dead_after(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

type Handler = Box<dyn Fn(&serde_json::Value) + Send + Sync>;
type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

struct Shared {
    config: PeerConfig,
    stop: AtomicBool,
    connected: AtomicBool,
    /// Bumped on every successful handshake. Threads of an older session
    /// must not tear down a newer one when their dead socket finally errors.
    generation: AtomicU64,
    writer: Mutex<Option<TcpStream>>,
    channel: RwLock<Option<SecureChannel>>,
    last_inbound: Mutex<Instant>,
    handlers: RwLock<HashMap<String, Handler>>,
    status_cb: Mutex<Option<StatusCallback>>,
    peer_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn status(&self, text: &str) {
        if let Some(cb) = self.status_cb.lock().unwrap().as_ref() {
            cb(text);
        }
    }

    fn session_live(&self, generation: u64) -> bool {
        self.connected.load(Ordering::Acquire)
            && self.generation.load(Ordering::Acquire) == generation
    }

    fn mark_dead(&self, generation: u64, why: &str) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!("peer link down: {}", why);
            self.status(&format!("peer disconnected: {}", why));
        }
    }

    fn touch_inbound(&self) {
        *self.last_inbound.lock().unwrap() = Instant::now();
    }
}

pub struct PeerConnection {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                stop: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
                channel: RwLock::new(None),
                last_inbound: Mutex::new(Instant::now()),
                handlers: RwLock::new(HashMap::new()),
                status_cb: Mutex::new(None),
                peer_addr: Mutex::new(None),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a closure for one command. Registration happens once at
    /// boot, before `start()`; later registrations replace earlier ones.
    pub fn register_handler<F>(&self, command: &str, handler: F)
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap()
            .insert(command.to_string(), Box::new(handler));
    }

    pub fn set_status_callback<F>(&self, cb: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.shared.status_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.shared.peer_addr.lock().unwrap()
    }

    /// Server mode: bind and spawn the acceptor, returning immediately.
    /// Client mode: dial with retries and complete the handshake before
    /// returning. A port that cannot be bound is fatal.
    pub fn start(&self) -> Result<()> {
        match self.shared.config.mode {
            PeerMode::Server => self.start_server(),
            PeerMode::Client => self.connect_to_server(),
        }
    }

    fn start_server(&self) -> Result<()> {
        let cfg = &self.shared.config;
        let addr: SocketAddr = format!("{}:{}", cfg.server_ip, cfg.port)
            .parse()
            .with_context(|| format!("bad listen address {}:{}", cfg.server_ip, cfg.port))?;
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_keepalive(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind {}", addr))?;
        socket.listen(1)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();

        tracing::info!("listening on {} (waiting for peer)", addr);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("peer-accept".into())
            .spawn(move || accept_loop(shared, listener))
            .expect("failed to spawn acceptor");
        self.handles.lock().unwrap().push(handle);
        Ok(())
    }

    fn connect_to_server(&self) -> Result<()> {
        let cfg = self.shared.config.clone();
        let addr: SocketAddr = format!("{}:{}", cfg.server_ip, cfg.port)
            .parse()
            .with_context(|| format!("bad server address {}:{}", cfg.server_ip, cfg.port))?;

        for attempt in 0..cfg.connect_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(attempt as u64);
                tracing::info!("retrying connect in {:?} ({}/{})", delay, attempt + 1, cfg.connect_retries);
                std::thread::sleep(delay);
            }
            if self.shared.stop.load(Ordering::Acquire) {
                bail!("connection cancelled");
            }
            match TcpStream::connect_timeout(&addr, cfg.connect_timeout) {
                Ok(stream) => {
                    configure_stream(&stream);
                    match run_handshake(&self.shared, &stream, PeerMode::Client) {
                        Ok(channel) => {
                            self.attach_session(stream, channel, addr);
                            tracing::info!("connected to server at {} (encrypted)", addr);
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::warn!("handshake failed on attempt {}: {:#}", attempt + 1, e);
                            let _ = stream.shutdown(Shutdown::Both);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("connect attempt {} failed: {}", attempt + 1, e);
                }
            }
        }
        bail!("failed to connect to {} after {} attempts", addr, cfg.connect_retries)
    }

    /// Store the authenticated session and spawn its receiver and heartbeat
    /// threads.
    fn attach_session(&self, stream: TcpStream, channel: SecureChannel, addr: SocketAddr) {
        attach_session(&self.shared, &self.handles, stream, channel, addr);
    }

    /// Encrypt and send one command. Returns false (and marks the link dead
    /// on write errors) instead of propagating: callers treat a lost peer as
    /// a state, not an exception.
    pub fn send_command(&self, command: &str, payload: serde_json::Value) -> bool {
        send_command(&self.shared, command, payload)
    }

    /// Stop all threads and close the sockets. Threads observe the flag
    /// within their poll timeout; stragglers are left detached.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);
        if let Some(stream) = self.shared.writer.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        let deadline = Instant::now() + Duration::from_secs(2);
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
            // Anything still running is detached and will exit on its next
            // stop-flag poll.
        }
        tracing::info!("peer connection closed");
    }
}

fn configure_stream(stream: &TcpStream) {
    let _ = SockRef::from(stream).set_keepalive(true);
    let _ = stream.set_nodelay(true);
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let handles = Mutex::new(Vec::new());
    while !shared.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if shared.connected.load(Ordering::Acquire) {
                    tracing::debug!("rejecting extra connection from {}", addr);
                    drop(stream);
                    continue;
                }
                let _ = stream.set_nonblocking(false);
                configure_stream(&stream);
                match run_handshake(&shared, &stream, PeerMode::Server) {
                    Ok(channel) => {
                        tracing::info!("peer connected from {} (encrypted)", addr);
                        attach_session(&shared, &handles, stream, channel, addr);
                    }
                    Err(e) => {
                        tracing::warn!("handshake with {} failed: {:#}", addr, e);
                        shared.status("peer authentication failed");
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                if !shared.stop.load(Ordering::Acquire) {
                    tracing::error!("accept error: {}", e);
                }
                break;
            }
        }
    }
}

fn attach_session(
    shared: &Arc<Shared>,
    handles: &Mutex<Vec<JoinHandle<()>>>,
    stream: TcpStream,
    channel: SecureChannel,
    addr: SocketAddr,
) {
    *shared.channel.write().unwrap() = Some(channel);
    *shared.peer_addr.lock().unwrap() = Some(addr);
    shared.touch_inbound();

    let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
    let reader = stream.try_clone().expect("failed to clone peer socket");
    *shared.writer.lock().unwrap() = Some(stream);
    shared.connected.store(true, Ordering::Release);
    shared.status("peer connected");

    let recv_shared = shared.clone();
    let recv = std::thread::Builder::new()
        .name("peer-recv".into())
        .spawn(move || receiver_loop(recv_shared, reader, generation))
        .expect("failed to spawn receiver");

    let hb_shared = shared.clone();
    let hb = std::thread::Builder::new()
        .name("peer-heartbeat".into())
        .spawn(move || heartbeat_loop(hb_shared, generation))
        .expect("failed to spawn heartbeat");

    let mut guard = handles.lock().unwrap();
    guard.push(recv);
    guard.push(hb);
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Newline-framed reads with a shared deadline (handshake) or a fixed poll
/// timeout (receiver loop).
struct LineReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(stream: TcpStream) -> Self {
        Self { stream, buf: Vec::new() }
    }

    /// Blocking read of one line, bounded by `deadline`.
    fn read_line_until(&mut self, deadline: Instant) -> Result<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .context("timed out waiting for peer message")?;
            self.stream.set_read_timeout(Some(remaining.max(Duration::from_millis(10))))?;
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => bail!("connection closed by peer"),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    bail!("timed out waiting for peer message")
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One poll-interval read. `Ok(None)` means no complete line yet.
    fn poll_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        let mut chunk = [0u8; 65536];
        match self.stream.read(&mut chunk) {
            Ok(0) => bail!("connection closed by peer"),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(self.take_line())
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned())
    }
}

fn send_plain(stream: &TcpStream, msg: &Handshake) -> Result<()> {
    let mut text = serde_json::to_string(msg)?;
    text.push('\n');
    (&*stream).write_all(text.as_bytes())?;
    Ok(())
}

fn read_plain(reader: &mut LineReader, deadline: Instant) -> Result<Handshake> {
    let line = reader.read_line_until(deadline)?;
    serde_json::from_str(line.trim()).context("malformed handshake message")
}

/// Run the five-step handshake. The whole sequence shares one deadline.
fn run_handshake(shared: &Shared, stream: &TcpStream, mode: PeerMode) -> Result<SecureChannel> {
    let deadline = Instant::now() + shared.config.handshake_timeout;
    let mut channel = SecureChannel::new(&shared.config.psk)?;
    let mut reader = LineReader::new(stream.try_clone()?);

    match mode {
        PeerMode::Server => {
            // Client key first, then ours back.
            let Handshake::PublicKey { public_key } = read_plain(&mut reader, deadline)? else {
                bail!("expected PUBLIC_KEY");
            };
            channel.set_peer_public_key(&public_key)?;
            send_plain(stream, &Handshake::PublicKey { public_key: channel.public_key_pem()? })?;

            let encrypted_key = channel.generate_session_key()?;
            send_plain(stream, &Handshake::SessionKey { encrypted_key })?;
            let Handshake::SessionKeyAck {} = read_plain(&mut reader, deadline)? else {
                bail!("expected SESSION_KEY_ACK");
            };

            let challenge = channel.create_auth_challenge();
            send_plain(stream, &Handshake::AuthChallenge { challenge })?;
            let Handshake::AuthResponse { response } = read_plain(&mut reader, deadline)? else {
                bail!("expected AUTH_RESPONSE");
            };
            if !channel.verify_auth_response(&response)? {
                bail!("authentication failed: wrong pre-shared key");
            }
        }
        PeerMode::Client => {
            send_plain(stream, &Handshake::PublicKey { public_key: channel.public_key_pem()? })?;
            let Handshake::PublicKey { public_key } = read_plain(&mut reader, deadline)? else {
                bail!("expected PUBLIC_KEY");
            };
            channel.set_peer_public_key(&public_key)?;

            let Handshake::SessionKey { encrypted_key } = read_plain(&mut reader, deadline)? else {
                bail!("expected SESSION_KEY");
            };
            channel.receive_session_key(&encrypted_key)?;
            send_plain(stream, &Handshake::SessionKeyAck {})?;

            let Handshake::AuthChallenge { challenge } = read_plain(&mut reader, deadline)? else {
                bail!("expected AUTH_CHALLENGE");
            };
            let response = channel.create_auth_response(&challenge)?;
            send_plain(stream, &Handshake::AuthResponse { response })?;
            channel.mark_authenticated();
        }
    }
    Ok(channel)
}

// ---------------------------------------------------------------------------
// Post-handshake threads
// ---------------------------------------------------------------------------

fn receiver_loop(shared: Arc<Shared>, stream: TcpStream, generation: u64) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
    let mut reader = LineReader::new(stream);
    while !shared.stop.load(Ordering::Acquire) && shared.session_live(generation) {
        match reader.poll_line() {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                shared.touch_inbound();
                dispatch_frame(&shared, line.trim(), generation);
            }
            Ok(None) => continue,
            Err(e) => {
                shared.mark_dead(generation, &format!("receive error: {}", e));
                break;
            }
        }
    }
    tracing::debug!("receiver thread exiting");
}

fn dispatch_frame(shared: &Shared, frame: &str, generation: u64) {
    let plaintext = {
        let guard = shared.channel.read().unwrap();
        let Some(channel) = guard.as_ref() else {
            tracing::warn!("frame received before session established");
            return;
        };
        match channel.decrypt(frame) {
            Ok(p) => p,
            Err(e) => {
                // A failed tag check means the session key is corrupt; the
                // link cannot be trusted any further.
                shared.mark_dead(generation, &format!("decrypt failure: {:#}", e));
                return;
            }
        }
    };

    let value: serde_json::Value = match serde_json::from_slice(&plaintext) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dropping malformed message: {}", e);
            return;
        }
    };
    let Some(command) = value.get("command").and_then(|c| c.as_str()) else {
        tracing::warn!("dropping message without command field");
        return;
    };
    if command == protocol::HEARTBEAT {
        return;
    }
    let handlers = shared.handlers.read().unwrap();
    match handlers.get(command) {
        Some(handler) => handler(&value),
        None => tracing::warn!("no handler for command {}", command),
    }
}

fn heartbeat_loop(shared: Arc<Shared>, generation: u64) {
    let interval = shared.config.heartbeat_interval;
    let dead_after = shared.config.dead_after();
    while !shared.stop.load(Ordering::Acquire) && shared.session_live(generation) {
        if !send_command(&shared, protocol::HEARTBEAT, serde_json::json!({})) {
            break;
        }
        // Sleep in short slices so close() is observed promptly.
        let wake = Instant::now() + interval;
        while Instant::now() < wake && !shared.stop.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(100));
        }
        let silent_for = shared.last_inbound.lock().unwrap().elapsed();
        if silent_for > dead_after {
            shared.mark_dead(generation, &format!("peer silent for {:.0?}", silent_for));
            break;
        }
    }
    tracing::debug!("heartbeat thread exiting");
}

fn send_command(shared: &Shared, command: &str, payload: serde_json::Value) -> bool {
    if !shared.connected.load(Ordering::Acquire) {
        return false;
    }
    let frame = {
        let guard = shared.channel.read().unwrap();
        let Some(channel) = guard.as_ref() else {
            return false;
        };
        let env = protocol::envelope(command, payload);
        let text = match serde_json::to_string(&env) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("failed to serialize {}: {}", command, e);
                return false;
            }
        };
        match channel.encrypt(text.as_bytes()) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("failed to encrypt {}: {:#}", command, e);
                return false;
            }
        }
    };

    let guard = shared.writer.lock().unwrap();
    let Some(stream) = guard.as_ref() else {
        return false;
    };
    let _ = stream.set_write_timeout(Some(shared.config.send_timeout));
    let mut wire = frame.into_bytes();
    wire.push(b'\n');
    match (&*stream).write_all(&wire) {
        Ok(()) => true,
        Err(e) => {
            drop(guard);
            let generation = shared.generation.load(Ordering::Acquire);
            shared.mark_dead(generation, &format!("send error on {}: {}", command, e));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU16;
    use std::sync::mpsc;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(41500);

    fn test_config(mode: PeerMode, port: u16, psk: &str) -> PeerConfig {
        PeerConfig {
            mode,
            server_ip: "127.0.0.1".into(),
            port,
            psk: psk.into(),
            heartbeat_interval: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(3),
            connect_retries: 5,
        }
    }

    #[test]
    fn test_handshake_and_command_round_trip() {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let server = PeerConnection::new(test_config(PeerMode::Server, port, "swap"));
        let client = PeerConnection::new(test_config(PeerMode::Client, port, "swap"));

        let (tx, rx) = mpsc::channel::<serde_json::Value>();
        server.register_handler(protocol::STREAMING_START, move |v| {
            tx.send(v.clone()).unwrap();
        });

        server.start().unwrap();
        client.start().unwrap();
        assert!(client.is_connected());

        // Server side flips connected from the acceptor thread.
        for _ in 0..100 {
            if server.is_connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(server.is_connected());

        assert!(client.send_command(
            protocol::STREAMING_START,
            serde_json::json!({"duration_sec": 5.0, "local_save_channels": [1, 3]}),
        ));
        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received["command"], "STREAMING_START");
        assert_eq!(received["local_save_channels"][1], 3);

        client.close();
        server.close();
    }

    #[test]
    fn test_wrong_psk_fails_authentication() {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let server = PeerConnection::new(test_config(PeerMode::Server, port, "right"));
        let client = PeerConnection::new(test_config(PeerMode::Client, port, "wrong"));

        server.start().unwrap();
        // Client-side handshake succeeds mechanically (it cannot see the
        // server's verdict), but the server must refuse the session.
        let _ = client.start();
        std::thread::sleep(Duration::from_millis(500));
        assert!(!server.is_connected());

        client.close();
        server.close();
    }

    #[test]
    fn test_send_while_disconnected_returns_false() {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let server = PeerConnection::new(test_config(PeerMode::Server, port, "x"));
        assert!(!server.send_command(protocol::HEARTBEAT, serde_json::json!({})));
        server.close();
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let server = PeerConnection::new(test_config(PeerMode::Server, port, "swap"));
        let client = PeerConnection::new(test_config(PeerMode::Client, port, "swap"));
        server.start().unwrap();
        client.start().unwrap();

        assert!(client.send_command("NO_SUCH_COMMAND", serde_json::json!({"x": 1})));
        // The link must stay healthy after an unknown command.
        std::thread::sleep(Duration::from_millis(300));
        assert!(client.is_connected());

        client.close();
        server.close();
    }
}
