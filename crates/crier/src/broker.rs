use std::{
    io::{self, Write},
    net::{Ipv4Addr, SocketAddr},
};

use crier_wire::{Control, Frame, MAX_DATAGRAM, Publication, parse_control, parse_identity};
use mio::{
    Events, Interest, Token,
    event::Event,
    net::{TcpListener, TcpStream, UdpSocket},
};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::BrokerConfig,
    conn::{ConnState, Phase, SubscriberConn},
    poll::{DATAGRAM, LISTENER, OPERATOR, PollSet, SHUTDOWN},
    registry::{Attachment, Registered, RegistryError, SubscriberRegistry},
    shutdown::{OperatorInput, ShutdownHandle},
    store::{PubId, PublicationStore},
};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("datagram socket bind failed: {0}")]
    UdpBind(io::Error),
    #[error("stream listener bind failed: {0}")]
    TcpBind(io::Error),
    #[error("no port with both a free datagram and a free stream endpoint")]
    NoFreePort,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Topic publish/subscribe broker.
///
/// A single thread owns all state and multiplexes four event sources:
/// publisher datagrams, new subscriber connections, subscriber control
/// frames, and operator shutdown. Publications fan out to interested ACTIVE
/// subscribers immediately; for DEAD subscribers with store-and-forward on
/// the matching topic, a reference is queued and flushed on reconnect.
pub struct Broker {
    events: Events,
    core: Core,
}

struct Core {
    poll: PollSet,
    udp: UdpSocket,
    listener: TcpListener,
    conns: Vec<SubscriberConn>,
    registry: SubscriberRegistry,
    store: PublicationStore,
    operator: Option<OperatorInput>,
    shutdown: ShutdownHandle,
    /// Sink for the operator-facing contract lines; stdout in production.
    console: Box<dyn Write + Send>,
    dgram_buf: Box<[u8]>,
}

impl Broker {
    /// Binds both ingress endpoints and assembles the runtime. Bind
    /// failures here are fatal misconfiguration.
    pub fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        let poll = PollSet::new()?;
        let (mut udp, mut listener) = bind_endpoints(config.port, config.listen_backlog)?;

        poll.registry().register(&mut udp, DATAGRAM, Interest::READABLE)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let shutdown = ShutdownHandle::attach(poll.registry())?;

        let operator = if config.operator_input {
            match OperatorInput::register(poll.registry()) {
                Ok(operator) => Some(operator),
                Err(err) => {
                    warn!(?err, "operator input unavailable, use the shutdown handle");
                    None
                }
            }
        } else {
            None
        };

        info!(port = listener.local_addr()?.port(), "broker listening");

        Ok(Self {
            events: Events::with_capacity(128),
            core: Core {
                poll,
                udp,
                listener,
                conns: Vec::new(),
                registry: SubscriberRegistry::new(),
                store: PublicationStore::new(),
                operator,
                shutdown,
                console: Box::new(io::stdout()),
                dgram_buf: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
            },
        })
    }

    /// Address of the stream listener (useful when bound to port 0).
    pub fn stream_addr(&self) -> io::Result<SocketAddr> {
        self.core.listener.local_addr()
    }

    /// Address of the datagram socket.
    pub fn datagram_addr(&self) -> io::Result<SocketAddr> {
        self.core.udp.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.core.shutdown.clone()
    }

    /// Redirects the operator contract lines away from stdout.
    pub fn set_console(&mut self, sink: Box<dyn Write + Send>) {
        self.core.console = sink;
    }

    /// Runs the event loop until shutdown is requested. Consumes the
    /// broker; every endpoint closes when it returns.
    pub fn run(mut self) -> Result<(), BrokerError> {
        while !self.core.shutdown.requested() {
            self.core.poll.wait(&mut self.events)?;
            for event in self.events.iter() {
                self.core.handle_event(event);
            }
            // Operator input only sets the flag; it is honoured here, after
            // the batch, so publications already received stay ordered.
        }
        debug!("broker loop terminated");
        Ok(())
    }
}

impl Core {
    fn handle_event(&mut self, event: &Event) {
        match event.token() {
            OPERATOR => {
                if event.is_readable()
                    && let Some(operator) = &mut self.operator
                    && operator.saw_exit()
                {
                    info!("operator requested shutdown");
                    self.shutdown.request();
                }
            }
            SHUTDOWN => {} // Waker fired; the loop condition sees the flag.
            DATAGRAM => {
                if event.is_readable() {
                    self.ingest_datagrams();
                }
            }
            LISTENER => {
                if event.is_readable() {
                    self.accept_streams();
                }
            }
            token => self.drive_stream(token, event),
        }
    }

    /// Receives every queued publisher datagram and fans each publication
    /// out in arrival order.
    fn ingest_datagrams(&mut self) {
        loop {
            match self.udp.recv_from(&mut self.dgram_buf) {
                // Datagram transports do not signal closure; an empty
                // datagram is just ignored.
                Ok((0, source)) => debug!(%source, "empty datagram ignored"),
                Ok((len, source)) => match Publication::parse(source, &self.dgram_buf[..len]) {
                    Ok(publication) => {
                        debug!(%publication, "publication received");
                        let id = self.store.append(publication);
                        self.fan_out(id);
                    }
                    Err(err) => warn!(%source, "dropping malformed datagram: {err}"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "datagram receive failed");
                    break;
                }
            }
        }
    }

    /// Delivers one stored publication to every interested subscriber: sent
    /// immediately when ACTIVE, queued when DEAD with store-and-forward on
    /// the matching topic, dropped otherwise.
    fn fan_out(&mut self, id: PubId) {
        let Core { store, registry, conns, poll, .. } = self;
        let publication = store.get(id);
        let frame = match Frame::for_payload(publication.to_string().as_bytes()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(topic = %publication.topic, "publication does not fit a frame: {err}");
                return;
            }
        };

        for record in registry.iter_mut() {
            // Topics are unique within a record, so the first match is the
            // only one.
            let Some(store_forward) =
                record.subscriptions.find(&publication.topic).map(|s| s.store_forward)
            else {
                continue;
            };
            match record.attachment() {
                Attachment::Active(token) => {
                    let Some(conn) = conns.iter_mut().find(|c| c.token() == token) else {
                        continue;
                    };
                    if conn.write_or_enqueue(poll.registry(), &frame) == ConnState::Disconnected {
                        // Subscriber state is untouched here; the failed
                        // stream reports on its next readable event and the
                        // DEAD transition happens there.
                        warn!(id = record.id(), "delivery failed");
                    }
                }
                Attachment::Dead if store_forward => record.push_backlog(id),
                Attachment::Dead => {}
            }
        }
    }

    /// Accepts every pending subscriber connection. The stream stays in the
    /// awaiting-identity phase until its first frame arrives.
    fn accept_streams(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.install_stream(stream, peer) {
                        warn!(%peer, "could not install subscriber stream: {err}");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn install_stream(&mut self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let token = self.poll.add_stream(&mut stream)?;
        debug!(%peer, ?token, "stream accepted");
        self.conns.push(SubscriberConn::new(stream, token, peer));
        Ok(())
    }

    /// Drives readable/writable readiness on one subscriber stream.
    fn drive_stream(&mut self, token: Token, event: &Event) {
        let Some(idx) = self.conn_index(token) else {
            debug!(?token, "event for unknown stream");
            return;
        };

        let mut frames = Vec::new();
        if event.is_readable()
            && self.conns[idx].poll_readable(&mut frames) == ConnState::Disconnected
        {
            for frame in &frames {
                self.handle_frame(token, frame);
            }
            self.drop_stream(token);
            return;
        }

        for frame in &frames {
            // A rejected identity closes the stream mid-batch; later frames
            // have no owner and are dropped.
            if self.conn_index(token).is_none() {
                return;
            }
            self.handle_frame(token, frame);
        }

        if event.is_writable()
            && let Some(idx) = self.conn_index(token)
            && self.conns[idx].poll_writable(self.poll.registry()) == ConnState::Disconnected
        {
            self.drop_stream(token);
        }
    }

    fn handle_frame(&mut self, token: Token, frame: &Frame) {
        let payload = match frame.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(?token, "dropping malformed frame: {err}");
                return;
            }
        };
        let Some(idx) = self.conn_index(token) else { return };
        match self.conns[idx].phase() {
            Phase::AwaitingIdentity => self.bind_identity(token, idx, payload),
            Phase::Registered => self.apply_control(token, payload),
        }
    }

    /// Handles the first frame of a stream: the subscriber identity.
    fn bind_identity(&mut self, token: Token, idx: usize, payload: &[u8]) {
        let id = match parse_identity(payload) {
            Ok(id) => id,
            Err(err) => {
                warn!(?token, "rejecting stream with bad identity: {err}");
                self.drop_stream(token);
                return;
            }
        };
        let peer = self.conns[idx].peer_addr();

        match self.registry.register(&id, token) {
            Err(RegistryError::AlreadyConnected(id)) => {
                self.console_line(&format!("Client {id} already connected."));
                self.drop_stream(token);
            }
            Err(err) => {
                warn!(?token, %id, "registration failed: {err}");
                self.drop_stream(token);
            }
            Ok((record_idx, outcome)) => {
                self.conns[idx].set_registered();
                self.console_line(&format!("New client {id} connected from {peer}."));
                if outcome == Registered::Reconnected {
                    self.flush_backlog(record_idx, token);
                }
            }
        }
    }

    /// Delivers the backlog accumulated while the subscriber was DEAD,
    /// newest first. A stream failure mid-flush leaves the undelivered
    /// entries queued for the next reconnect.
    fn flush_backlog(&mut self, record_idx: usize, token: Token) {
        let Core { store, registry, conns, poll, .. } = self;
        let Some(conn) = conns.iter_mut().find(|c| c.token() == token) else { return };
        let record = registry.get_mut(record_idx);

        while let Some(id) = record.last_backlog() {
            let line = store.get(id).to_string();
            let frame = match Frame::for_payload(line.as_bytes()) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("queued publication does not fit a frame: {err}");
                    record.pop_backlog();
                    continue;
                }
            };
            if conn.write_or_enqueue(poll.registry(), &frame) == ConnState::Disconnected {
                warn!(id = record.id(), left = record.backlog().len(), "reconnect flush cut short");
                return;
            }
            record.pop_backlog();
        }
    }

    fn apply_control(&mut self, token: Token, payload: &[u8]) {
        match parse_control(payload) {
            Ok(Control::Subscribe { topic, store_forward }) => {
                match self.registry.subscribe(token, &topic, store_forward) {
                    Ok(()) => debug!(?token, %topic, store_forward, "subscribed"),
                    Err(err) => warn!(?token, %topic, "subscribe failed: {err}"),
                }
            }
            Ok(Control::Unsubscribe { topic }) => {
                match self.registry.unsubscribe(token, &topic) {
                    Ok(()) => debug!(?token, %topic, "unsubscribed"),
                    Err(err) => warn!(?token, %topic, "unsubscribe failed: {err}"),
                }
            }
            // Unknown commands are dropped without touching the stream.
            Err(err) => warn!(?token, "ignoring control frame: {err}"),
        }
    }

    /// Removes a stream from the poll set and, when it belonged to a
    /// registered subscriber, transitions the record to DEAD.
    fn drop_stream(&mut self, token: Token) {
        let Some(idx) = self.conn_index(token) else { return };
        let mut conn = self.conns.swap_remove(idx);
        conn.close(self.poll.registry());

        match self.registry.close(token) {
            Ok(record_idx) => {
                let id = self.registry.get(record_idx).id().to_owned();
                self.console_line(&format!("Client {id} disconnected."));
            }
            // Streams that never completed registration have no record.
            Err(RegistryError::NotFound) => debug!(?token, "stream closed before registration"),
            Err(err) => debug!(?token, "close failed: {err}"),
        }
    }

    fn conn_index(&self, token: Token) -> Option<usize> {
        self.conns.iter().position(|c| c.token() == token)
    }

    /// Operator contract lines are flushed immediately so tooling reading
    /// stdout sees them as they happen.
    fn console_line(&mut self, line: &str) {
        let _ = writeln!(self.console, "{line}");
        let _ = self.console.flush();
    }
}

fn any_interface(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

fn bind_endpoints(port: u16, backlog: i32) -> Result<(UdpSocket, TcpListener), BrokerError> {
    if port != 0 {
        let udp = UdpSocket::bind(any_interface(port)).map_err(BrokerError::UdpBind)?;
        let listener =
            listen_with_backlog(any_interface(port), backlog).map_err(BrokerError::TcpBind)?;
        return Ok((udp, listener));
    }

    // Ephemeral mode: both protocols must share a port number, so take
    // whatever the datagram bind yields and try its stream twin.
    for _ in 0..16 {
        let udp = UdpSocket::bind(any_interface(0)).map_err(BrokerError::UdpBind)?;
        let port = udp.local_addr()?.port();
        if let Ok(listener) = listen_with_backlog(any_interface(port), backlog) {
            return Ok((udp, listener));
        }
    }
    Err(BrokerError::NoFreePort)
}

/// mio's listener bind hardcodes its queue depth, so the listener is built
/// with socket2 to honour the configured backlog.
fn listen_with_backlog(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}
