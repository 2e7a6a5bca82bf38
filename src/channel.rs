//! The single shared connection to the injected agent.
//!
//! One `ControlChannel` exists per process. Every request/reply exchange holds
//! the connection mutex for the whole round trip, so at most one logical
//! request is in flight at a time. Timeouts and peer close yield empty
//! replies; hard transport errors drop the connection so the next call can
//! reconnect.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::{ArtscopeError, Result};

const READ_CHUNK: usize = 4096;

struct Connection {
    stream: TcpStream,
    target: SocketAddr,
}

pub struct ControlChannel {
    conn: Mutex<Option<Connection>>,
    config: ChannelConfig,
}

/// Outcome of one timed read.
enum Poll {
    Data(usize),
    Idle,
    Closed,
}

impl ControlChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            conn: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect to `host:port`, replacing any existing connection.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let target = (host, port)
            .to_socket_addrs()
            .map_err(|err| ArtscopeError::transport(format!("{host}:{port}"), err))?
            .next()
            .ok_or_else(|| ArtscopeError::Config(format!("{host}:{port} did not resolve")))?;
        self.connect_addr(target)
    }

    pub fn connect_addr(&self, target: SocketAddr) -> Result<()> {
        let mut conn = self.lock();
        *conn = None;
        *conn = Some(open(target, self.config.receive_timeout)?);
        Ok(())
    }

    /// Reconnect only when not already connected to `target`.
    pub fn ensure_connection(&self, target: SocketAddr) -> Result<()> {
        let mut conn = self.lock();
        ensure(&mut conn, target, self.config.receive_timeout)
    }

    pub fn disconnect(&self) {
        if self.lock().take().is_some() {
            info!("disconnected from agent");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        send_on(&mut self.lock(), data)
    }

    /// Up to one chunk of reply. Empty on timeout or when the peer closed.
    pub fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.exclusive().receive(timeout)
    }

    /// Send one command line and wait for the first chunk of its reply.
    pub fn request(&self, target: SocketAddr, line: &str, timeout: Duration) -> Result<Vec<u8>> {
        let mut held = self.exclusive();
        held.ensure_connection(target)?;
        held.send(terminated(line).as_bytes())?;
        held.receive(timeout)
    }

    /// Hold the connection until the returned handle drops, so a request and
    /// its reply cannot interleave with another caller's.
    pub fn exclusive(&self) -> ChannelLock<'_> {
        ChannelLock {
            conn: self.lock(),
            config: &self.config,
        }
    }

    /// Send one command line and stream the reply into `out` as it arrives.
    ///
    /// Stops after `idle_polls` consecutive empty polls or when the peer
    /// closes. Returns the number of bytes relayed.
    pub fn relay(&self, target: SocketAddr, line: &str, out: &mut dyn Write) -> Result<usize> {
        let mut conn = self.lock();
        ensure(&mut conn, target, self.config.receive_timeout)?;
        send_on(&mut conn, terminated(line).as_bytes())?;

        let mut buf = vec![0u8; READ_CHUNK];
        let mut relayed = 0usize;
        let mut idle = 0u32;
        while idle < self.config.idle_polls {
            match poll_on(&mut conn, &mut buf, self.config.poll_interval)? {
                Poll::Data(n) => {
                    out.write_all(&buf[..n])
                        .map_err(|err| ArtscopeError::transport("client", err))?;
                    relayed += n;
                    idle = 0;
                }
                Poll::Idle => idle += 1,
                Poll::Closed => break,
            }
        }
        debug!(relayed, "relay finished");
        Ok(relayed)
    }
}

/// Exclusive use of the shared connection.
pub struct ChannelLock<'c> {
    conn: MutexGuard<'c, Option<Connection>>,
    config: &'c ChannelConfig,
}

impl ChannelLock<'_> {
    pub fn ensure_connection(&mut self, target: SocketAddr) -> Result<()> {
        ensure(&mut self.conn, target, self.config.receive_timeout)
    }

    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        send_on(&mut self.conn, data)
    }

    pub fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_CHUNK];
        match poll_on(&mut self.conn, &mut buf, timeout)? {
            Poll::Data(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Poll::Idle | Poll::Closed => Ok(Vec::new()),
        }
    }
}

fn terminated(line: &str) -> String {
    if line.ends_with('\n') {
        line.to_string()
    } else {
        format!("{line}\n")
    }
}

fn open(target: SocketAddr, timeout: Duration) -> Result<Connection> {
    let stream = TcpStream::connect_timeout(&target, timeout)
        .map_err(|err| ArtscopeError::transport(target.to_string(), err))?;
    stream.set_nodelay(true).ok();
    info!(agent = %target, "connected to agent");
    Ok(Connection { stream, target })
}

fn ensure(conn: &mut Option<Connection>, target: SocketAddr, timeout: Duration) -> Result<()> {
    if conn.as_ref().is_some_and(|c| c.target == target) {
        return Ok(());
    }
    *conn = None;
    *conn = Some(open(target, timeout)?);
    Ok(())
}

fn send_on(conn: &mut Option<Connection>, data: &[u8]) -> Result<()> {
    let c = conn.as_mut().ok_or(ArtscopeError::NotConnected)?;
    if let Err(err) = c.stream.write_all(data).and_then(|_| c.stream.flush()) {
        let target = c.target.to_string();
        warn!(agent = %target, "send failed: {err}");
        *conn = None;
        return Err(ArtscopeError::transport(target, err));
    }
    Ok(())
}

fn poll_on(conn: &mut Option<Connection>, buf: &mut [u8], timeout: Duration) -> Result<Poll> {
    let c = conn.as_mut().ok_or(ArtscopeError::NotConnected)?;
    // A zero read timeout means "block forever" to the socket layer.
    let timeout = timeout.max(Duration::from_millis(1));
    c.stream
        .set_read_timeout(Some(timeout))
        .map_err(|err| ArtscopeError::transport(c.target.to_string(), err))?;

    match c.stream.read(buf) {
        Ok(0) => {
            debug!(agent = %c.target, "peer closed connection");
            *conn = None;
            Ok(Poll::Closed)
        }
        Ok(n) => Ok(Poll::Data(n)),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(Poll::Idle)
        }
        Err(err) => {
            let target = c.target.to_string();
            warn!(agent = %target, "receive failed: {err}");
            *conn = None;
            Err(ArtscopeError::transport(target, err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn quick_config() -> ChannelConfig {
        ChannelConfig {
            poll_interval: Duration::from_millis(20),
            idle_polls: 5,
            receive_timeout: Duration::from_millis(500),
            ..ChannelConfig::default()
        }
    }

    /// Answers `ping` with `pong` for every line of every accepted connection.
    fn pong_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    let mut writer = stream.try_clone().unwrap();
                    for line in io::BufReader::new(stream).lines() {
                        let Ok(line) = line else { break };
                        if line == "ping" {
                            let _ = writer.write_all(b"pong\n");
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    #[test]
    fn ping_round_trip() {
        let (addr, _) = pong_server();
        let channel = ControlChannel::new(quick_config());
        channel.connect(&addr.ip().to_string(), addr.port()).unwrap();
        channel.send(b"ping\n").unwrap();
        let reply = channel.receive(Duration::from_secs(2)).unwrap();
        assert_eq!(reply, b"pong\n");
    }

    #[test]
    fn idle_receive_returns_empty_after_timeout() {
        let (addr, _) = pong_server();
        let channel = ControlChannel::new(quick_config());
        channel.connect_addr(addr).unwrap();

        let started = Instant::now();
        let reply = channel.receive(Duration::from_millis(100)).unwrap();
        assert!(reply.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(channel.is_connected());
    }

    #[test]
    fn ensure_connection_reuses_same_target() {
        let (addr, accepted) = pong_server();
        let channel = ControlChannel::new(quick_config());
        channel.ensure_connection(addr).unwrap();
        channel.ensure_connection(addr).unwrap();
        let reply = channel
            .request(addr, "ping", Duration::from_secs(2))
            .unwrap();
        assert_eq!(reply, b"pong\n");
        // Give the accept loop a moment to count anything extra.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_without_connection_fails() {
        let channel = ControlChannel::new(quick_config());
        assert!(matches!(channel.send(b"ping\n"), Err(ArtscopeError::NotConnected)));
        assert!(matches!(
            channel.receive(Duration::from_millis(10)),
            Err(ArtscopeError::NotConnected)
        ));
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = ControlChannel::new(quick_config());
        let err = channel.connect_addr(addr).unwrap_err();
        assert!(matches!(err, ArtscopeError::Transport { .. }));
        assert!(!channel.is_connected());
    }

    #[test]
    fn peer_close_yields_empty_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let channel = ControlChannel::new(quick_config());
        channel.connect_addr(addr).unwrap();
        let reply = channel.receive(Duration::from_secs(2)).unwrap();
        assert!(reply.is_empty());
        assert!(!channel.is_connected());
    }

    #[test]
    fn relay_streams_until_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut line = String::new();
            io::BufReader::new(stream).read_line(&mut line).unwrap();
            assert_eq!(line, "sec libc.so\n");
            writer.write_all(b"first\n").unwrap();
            thread::sleep(Duration::from_millis(40));
            writer.write_all(b"second\n").unwrap();
            // keep the socket open so the relay ends on idleness
            thread::sleep(Duration::from_millis(500));
        });

        let channel = ControlChannel::new(quick_config());
        let mut out = Vec::new();
        let relayed = channel.relay(addr, "sec libc.so", &mut out).unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "first\nsecond\n");
        assert_eq!(relayed, out.len());
        assert!(channel.is_connected());
    }

    #[test]
    fn relay_stops_on_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut line = String::new();
            io::BufReader::new(stream).read_line(&mut line).unwrap();
            writer.write_all(b"bye\n").unwrap();
        });

        let channel = ControlChannel::new(quick_config());
        let mut out = Vec::new();
        channel.relay(addr, "anything", &mut out).unwrap();
        assert_eq!(out, b"bye\n");
        assert!(!channel.is_connected());
    }
}
