use std::io;

use mio::{Events, Interest, Poll, Registry, Token, net::TcpStream};

/// Operator standard input.
pub const OPERATOR: Token = Token(0);
/// Publisher datagram socket.
pub const DATAGRAM: Token = Token(1);
/// Subscriber stream listener.
pub const LISTENER: Token = Token(2);
/// Shutdown waker.
pub const SHUTDOWN: Token = Token(3);

const FIRST_STREAM_TOKEN: usize = 4;

/// Readiness multiplexer for everything the broker owns: operator input,
/// the datagram socket, the listener, and one entry per subscriber stream.
///
/// Fixed endpoints register under the constant tokens above; subscriber
/// streams draw from a monotonically increasing counter so a token is never
/// reused within a broker lifetime.
pub struct PollSet {
    poll: Poll,
    next_stream_token: usize,
}

impl PollSet {
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, next_stream_token: FIRST_STREAM_TOKEN })
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Registers a freshly accepted subscriber stream with read interest
    /// and hands back its token.
    pub fn add_stream(&mut self, stream: &mut TcpStream) -> io::Result<Token> {
        let token = Token(self.next_stream_token);
        self.poll.registry().register(stream, token, Interest::READABLE)?;
        self.next_stream_token += 1;
        Ok(token)
    }

    /// Blocks until at least one endpoint is ready. A signal-interrupted
    /// wait yields an empty event set instead of an error; the caller just
    /// waits again.
    pub fn wait(&mut self, events: &mut Events) -> io::Result<()> {
        match self.poll.poll(events, None) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            other => other,
        }
    }
}
