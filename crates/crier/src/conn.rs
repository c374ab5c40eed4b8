use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use crier_wire::{FRAME_LEN, Frame};
use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::{debug, warn};

/// Response type for all stream operations.
///
/// `Alive` means the stream is still usable.
/// `Disconnected` means the peer is gone and the stream must be torn down.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// Protocol phase of a subscriber stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted; the first frame (the identity) has not arrived yet.
    AwaitingIdentity,
    /// Identity accepted and bound in the registry.
    Registered,
}

/// Single mio-backed subscriber stream.
///
/// Every message, in either direction, is a fixed [`FRAME_LEN`]-byte
/// envelope, so the receive side is a plain accumulator: bytes are read
/// until the envelope is complete, across as many readable events as the
/// transport needs.
///
/// Outbound:
///   - `write_or_enqueue` attempts a non-blocking write of the whole
///     envelope; any unwritten remainder is queued.
///   - Queued bytes are flushed whenever the socket becomes writable.
///   - WRITABLE interest is registered only while the queue is non-empty.
pub struct SubscriberConn {
    stream: TcpStream,
    token: Token,
    peer_addr: SocketAddr,
    phase: Phase,

    rx_buf: Box<[u8; FRAME_LEN]>,
    rx_have: usize,

    /// Filled when a send would block. The first entry may be the partially
    /// written tail of an envelope.
    send_backlog: VecDeque<Vec<u8>>,
    /// True if WRITABLE interest is currently registered.
    /// Invariant: `writable_armed == !send_backlog.is_empty()`
    writable_armed: bool,
}

impl SubscriberConn {
    pub fn new(stream: TcpStream, token: Token, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            token,
            peer_addr,
            phase: Phase::AwaitingIdentity,
            rx_buf: Box::new([0; FRAME_LEN]),
            rx_have: 0,
            send_backlog: VecDeque::new(),
            writable_armed: false,
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_registered(&mut self) {
        self.phase = Phase::Registered;
    }

    /// Reads every complete envelope currently available, pushing each onto
    /// `frames`, until the read would block.
    pub fn poll_readable(&mut self, frames: &mut Vec<Frame>) -> ConnState {
        loop {
            match self.stream.read(&mut self.rx_buf[self.rx_have..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.rx_have += n;
                    if self.rx_have == FRAME_LEN {
                        frames.push(Frame::from_wire(*self.rx_buf));
                        self.rx_have = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "stream read failed");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Happy path: writes the whole envelope to the socket. If the kernel
    /// takes only part of it, or we are already backlogged, the remainder is
    /// queued and flushed on the next writable event.
    pub fn write_or_enqueue(&mut self, registry: &Registry, frame: &Frame) -> ConnState {
        let bytes = frame.as_bytes();

        if !self.send_backlog.is_empty() {
            return self.enqueue(registry, bytes.to_vec());
        }

        match self.stream.write(bytes) {
            Ok(0) => {
                warn!("stream refused the write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == FRAME_LEN => ConnState::Alive,
            Ok(n) => self.enqueue(registry, bytes[n..].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue(registry, bytes.to_vec())
            }
            Err(err) => {
                warn!(?err, "stream write failed");
                ConnState::Disconnected
            }
        }
    }

    /// Flushes queued bytes until the kernel blocks or the queue is empty.
    pub fn poll_writable(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "flushing send queue failed");
                    return ConnState::Disconnected;
                }
            }
        }

        // Drop WRITABLE interest only when fully drained.
        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "reregister to drop writable failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    #[inline]
    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    /// Arms WRITABLE notifications when transitioning from an empty to a
    /// non-empty queue.
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "reregister to arm writable failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) {
        debug!(peer = %self.peer_addr, "closing subscriber stream");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
