// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crier::{Broker, BrokerConfig, BrokerError, ShutdownHandle};
use crier_wire::{FRAME_LEN, Frame, PayloadValue, encode_datagram};

/// Grace period for the broker thread to observe socket events.
pub const SETTLE: Duration = Duration::from_millis(200);
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn settle() {
    thread::sleep(SETTLE);
}

/// Capturing sink for the operator contract lines.
#[derive(Clone, Default)]
pub struct Console(Arc<Mutex<Vec<u8>>>);

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Console {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap()).lines().map(str::to_owned).collect()
    }
}

/// A broker running on loopback in a background thread.
pub struct TestBroker {
    pub stream_addr: SocketAddr,
    pub dgram_addr: SocketAddr,
    pub console: Console,
    handle: ShutdownHandle,
    thread: Option<thread::JoinHandle<Result<(), BrokerError>>>,
}

impl TestBroker {
    pub fn start() -> Self {
        let mut broker =
            Broker::bind(BrokerConfig::new(0).with_operator_input(false)).expect("broker bind");
        let console = Console::default();
        broker.set_console(Box::new(console.clone()));

        let stream_addr = localhost(broker.stream_addr().unwrap());
        let dgram_addr = localhost(broker.datagram_addr().unwrap());
        let handle = broker.shutdown_handle();
        let thread = thread::spawn(move || broker.run());

        Self { stream_addr, dgram_addr, console, handle, thread: Some(thread) }
    }

    /// Requests shutdown and hands back the loop's result.
    pub fn stop(mut self) -> Result<(), BrokerError> {
        self.handle.shutdown();
        self.thread.take().unwrap().join().expect("broker thread panicked")
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn localhost(bound: SocketAddr) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, bound.port()))
}

/// Datagram publisher with a stable source address.
pub struct Publisher {
    socket: UdpSocket,
    target: SocketAddr,
}

impl Publisher {
    pub fn new(target: SocketAddr) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("publisher bind");
        Self { socket, target }
    }

    /// The source address subscribers will see in delivery lines.
    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn publish(&self, topic: &str, value: &PayloadValue) {
        let datagram = encode_datagram(topic, value).expect("encode datagram");
        self.socket.send_to(&datagram, self.target).expect("publish");
    }
}

/// Blocking subscriber client speaking the stream wire contract.
pub struct Subscriber {
    stream: TcpStream,
}

impl Subscriber {
    /// Wraps an already-connected stream that has spoken (or will speak)
    /// the identity handshake itself.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn connect(addr: SocketAddr, id: &str) -> Self {
        let stream = TcpStream::connect(addr).expect("subscriber connect");
        stream.set_nodelay(true).unwrap();
        let mut subscriber = Self { stream };

        let mut payload = id.as_bytes().to_vec();
        payload.push(0);
        subscriber.send_payload(&payload);
        subscriber
    }

    pub fn send_payload(&mut self, payload: &[u8]) {
        let frame = Frame::for_payload(payload).expect("frame payload");
        self.stream.write_all(frame.as_bytes()).expect("frame write");
    }

    pub fn subscribe(&mut self, topic: &str, store_forward: bool) {
        let mut payload = b"subscribe\0".to_vec();
        payload.extend_from_slice(topic.as_bytes());
        payload.push(0);
        payload.push(u8::from(store_forward));
        self.send_payload(&payload);
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        let mut payload = b"unsubscribe\0".to_vec();
        payload.extend_from_slice(topic.as_bytes());
        payload.push(0);
        self.send_payload(&payload);
    }

    /// Receives one full envelope and returns its payload as text.
    pub fn recv_line(&mut self, timeout: Duration) -> io::Result<String> {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let mut buf = [0u8; FRAME_LEN];
        self.stream.read_exact(&mut buf)?;
        let frame = Frame::from_wire(buf);
        Ok(String::from_utf8_lossy(frame.payload().expect("frame length")).into_owned())
    }

    /// Asserts nothing is delivered within `timeout`.
    pub fn expect_silence(&mut self, timeout: Duration) {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => panic!("stream closed while expecting silence"),
            Ok(_) => panic!("unexpected delivery while expecting silence"),
            Err(e) => assert!(
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                "unexpected read error: {e}"
            ),
        }
    }

    /// Asserts the broker closed this stream.
    pub fn expect_closed(&mut self, timeout: Duration) {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => {}
            Ok(_) => panic!("expected close, got data"),
            Err(e) => panic!("expected close, got error: {e}"),
        }
    }

    /// Raw access for fragmented/batched wire tests.
    pub fn raw_stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
