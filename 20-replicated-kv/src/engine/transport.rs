//! Peer-to-peer raft transport.
//!
//! Every message travels on its own TCP connection as one frame:
//!
//! - 4 bytes: frame length (big-endian u32)
//! - N bytes: bincode [`Frame`] holding the sender's advertised address and the
//!   prost-encoded raft `Message`
//!
//! Carrying the sender address lets a node that has not yet applied any conf
//! change still answer the leader that is replicating to it.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError, bounded};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const IO_TIMEOUT: Duration = Duration::from_secs(2);
const PEER_QUEUE: usize = 1024;
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    from: String,
    payload: Vec<u8>,
}

/// A raft message received from a peer.
#[derive(Debug)]
pub struct Inbound {
    /// Address the sender advertises for raft traffic.
    pub from: String,
    pub message: Message,
}

/// Accepts peer connections and forwards decoded messages to the worker.
pub struct Listener {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `addr` and starts accepting on a background thread.
    pub fn bind(addr: &str, tx: Sender<Inbound>) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
        let local = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("raft-net-listener-{local}"))
            .spawn(move || accept_loop(listener, tx, flag))
            .context("failed to spawn network listener")?;

        Ok(Self {
            addr: local,
            stop,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and waits for the accept thread to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        // accept() has no timeout, so wake it with a throwaway connection.
        let _ = TcpStream::connect_timeout(&wake_addr(self.addr), CONNECT_TIMEOUT);
        if handle.join().is_err() {
            warn!(addr = %self.addr, "network listener panicked");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

fn accept_loop(listener: TcpListener, tx: Sender<Inbound>, stop: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name("raft-net-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, tx) {
                            debug!(error = %err, "peer connection error");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn connection handler");
                }
            }
            Err(err) => warn!(error = %err, "accept error"),
        }
    }
}

fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> io::Result<()> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let inbound = decode_frame(&buf)?;
    tx.send(inbound)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
    Ok(())
}

fn encode_frame(from: &str, msg: &Message) -> Result<Vec<u8>> {
    let frame = Frame {
        from: from.to_string(),
        payload: msg.encode_to_vec(),
    };
    let body = bincode::serialize(&frame).context("failed to encode frame")?;
    let mut bytes = Vec::with_capacity(body.len() + 4);
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode_frame(body: &[u8]) -> io::Result<Inbound> {
    let frame: Frame = bincode::deserialize(body)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let message = Message::decode(&frame.payload[..])
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Inbound {
        from: frame.from,
        message,
    })
}

/// Outbound side: one sender thread per peer address.
///
/// Raft tolerates lost messages, so a full queue or a dead peer only drops.
pub struct Outbox {
    from: String,
    peers: HashMap<String, Sender<Vec<u8>>>,
}

impl Outbox {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            peers: HashMap::new(),
        }
    }

    pub fn send(&mut self, addr: &str, msg: &Message) {
        let frame = match encode_frame(&self.from, msg) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping unencodable message");
                return;
            }
        };

        if let Some(queue) = self.peers.get(addr) {
            match queue.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    debug!(peer = addr, "peer queue full, dropping message");
                    return;
                }
                Err(TrySendError::Disconnected(frame)) => {
                    self.peers.remove(addr);
                    self.spawn_peer(addr, frame);
                }
            }
        } else {
            self.spawn_peer(addr, frame);
        }
    }

    fn spawn_peer(&mut self, addr: &str, first: Vec<u8>) {
        let (tx, rx) = bounded::<Vec<u8>>(PEER_QUEUE);
        let peer = addr.to_string();
        let spawned = thread::Builder::new()
            .name(format!("raft-send-{peer}"))
            .spawn(move || {
                for frame in rx {
                    if let Err(err) = try_send(&peer, &frame) {
                        debug!(peer = %peer, error = %err, "failed to send message");
                    }
                }
            });
        match spawned {
            Ok(_) => {
                let _ = tx.try_send(first);
                self.peers.insert(addr.to_string(), tx);
            }
            Err(err) => warn!(peer = addr, error = %err, "failed to spawn peer sender"),
        }
    }
}

fn try_send(addr: &str, bytes: &[u8]) -> io::Result<()> {
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve"))?;
    let mut stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.write_all(bytes)?;
    Ok(())
}
