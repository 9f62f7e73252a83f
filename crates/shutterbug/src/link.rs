//! Control link - one TCP connection to the coordinator
//!
//! A dedicated receive thread reads the socket, cuts messages with a
//! [`MessageDecoder`] and hands each one to a [`MessageHandler`], writing
//! back whatever reply it returns. Messages are handled strictly one at a
//! time, in arrival order.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::framing::{self, Framing, MessageDecoder};
use shutterconf::LinkConfig;

/// Handler trait for inbound control messages
///
/// Returns the reply to send, if any.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &str) -> Option<String>;
}

const READ_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub framing: Framing,
    pub connect_timeout: Duration,
}

impl LinkOptions {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            framing: config.framing,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("cannot resolve coordinator address '{addr}': {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("coordinator address '{0}' resolved to nothing")]
    NoAddress(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("control link I/O: {0}")]
    Io(#[from] io::Error),

    #[error("control link is already running")]
    AlreadySpawned,
}

/// Cloneable write half of the link.
#[derive(Clone)]
pub struct LinkSender {
    framing: Framing,
    stream: Arc<Mutex<TcpStream>>,
}

impl LinkSender {
    pub fn send(&self, text: &str) -> io::Result<()> {
        let bytes = framing::encode(self.framing, text);
        let mut stream = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        stream.write_all(&bytes)?;
        stream.flush()
    }
}

pub struct ControlLink {
    peer: SocketAddr,
    framing: Framing,
    stream: TcpStream,
    sender: LinkSender,
    alive: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
}

impl ControlLink {
    /// Open the connection. Tries every resolved address in turn.
    pub fn connect(addr: &str, options: &LinkOptions) -> Result<Self, LinkError> {
        let candidates: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|source| LinkError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .collect();

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, options.connect_timeout) {
                Ok(stream) => {
                    info!("control link connected to {}", candidate);
                    return Self::from_stream(stream, options.framing);
                }
                Err(source) => {
                    debug!("connect to {} failed: {}", candidate, source);
                    last_err = Some(LinkError::Connect {
                        addr: candidate,
                        source,
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| LinkError::NoAddress(addr.to_string())))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, framing: Framing) -> Result<Self, LinkError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let sender = LinkSender {
            framing,
            stream: Arc::new(Mutex::new(stream.try_clone()?)),
        };
        Ok(Self {
            peer,
            framing,
            stream,
            sender,
            alive: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            rx_thread: None,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// True while the receive thread is reading.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Start the receive thread.
    pub fn spawn<H: MessageHandler>(&mut self, handler: Arc<H>) -> Result<(), LinkError> {
        if self.rx_thread.is_some() {
            return Err(LinkError::AlreadySpawned);
        }

        let reader = self.stream.try_clone()?;
        let rx = Receiver {
            reader,
            decoder: MessageDecoder::new(self.framing),
            sender: self.sender.clone(),
            alive: Arc::clone(&self.alive),
            stopping: Arc::clone(&self.stopping),
            peer: self.peer,
        };

        self.alive.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name("control-link-rx".to_string())
            .spawn(move || rx.run(handler.as_ref()));
        match handle {
            Ok(handle) => {
                self.rx_thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.alive.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Close the connection and join the receive thread. Safe to call twice.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        // Wakes a read blocked in the receive thread
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("shutdown of control link: {}", e);
            }
        }
        if let Some(handle) = self.rx_thread.take() {
            if handle.join().is_err() {
                error!("control link receive thread panicked");
            }
        }
        self.alive.store(false, Ordering::Release);
    }
}

impl Drop for ControlLink {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Receiver {
    reader: TcpStream,
    decoder: MessageDecoder,
    sender: LinkSender,
    alive: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl Receiver {
    fn run(mut self, handler: &dyn MessageHandler) {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    if !self.stopping.load(Ordering::Acquire) {
                        info!("coordinator {} closed the control link", self.peer);
                    }
                    if let Some(tail) = self.decoder.finish() {
                        self.deliver(handler, &tail);
                    }
                    break;
                }
                Ok(n) => {
                    for message in self.decoder.push(&buf[..n]) {
                        self.deliver(handler, &message);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.stopping.load(Ordering::Acquire) {
                        warn!("control link read failed: {}", e);
                    }
                    break;
                }
            }
        }
        self.alive.store(false, Ordering::Release);
        debug!("control link receive thread exiting");
    }

    fn deliver(&self, handler: &dyn MessageHandler, message: &str) {
        debug!("received {:?}", message);
        if let Some(reply) = handler.handle(message) {
            if let Err(e) = self.sender.send(&reply) {
                warn!("failed to send reply {:?}: {}", reply, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    struct Echo;

    impl MessageHandler for Echo {
        fn handle(&self, message: &str) -> Option<String> {
            Some(format!("echo:{message}"))
        }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let options = LinkOptions {
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let err = ControlLink::connect(&addr.to_string(), &options).err();
        assert!(matches!(err, Some(LinkError::Connect { .. })));
    }

    #[test]
    fn test_unresolvable_address() {
        let err = ControlLink::connect("not an address", &LinkOptions::default()).err();
        assert!(matches!(err, Some(LinkError::Resolve { .. })));
    }

    #[test]
    fn test_stop_wakes_blocked_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut link = ControlLink::connect(&addr, &LinkOptions::default()).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        link.spawn(Arc::new(Echo)).unwrap();
        assert!(link.is_alive());
        assert!(matches!(
            link.spawn(Arc::new(Echo)),
            Err(LinkError::AlreadySpawned)
        ));

        link.stop();
        assert!(!link.is_alive());
        link.stop();
    }

    #[test]
    fn test_peer_close_ends_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut link = ControlLink::connect(&addr, &LinkOptions::default()).unwrap();
        let (peer, _) = listener.accept().unwrap();

        link.spawn(Arc::new(Echo)).unwrap();
        drop(peer);
        assert!(wait_for(|| !link.is_alive()));
    }
}
