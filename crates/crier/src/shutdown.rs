use std::{
    io,
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use mio::{Interest, Registry, Waker, unix::SourceFd};
use tracing::warn;

use crate::poll::{OPERATOR, SHUTDOWN};

const STDIN_FD: RawFd = 0;

/// Cooperative termination signal shared between the broker loop, the
/// operator input watcher, and embedders.
///
/// `shutdown` wakes the loop out of its poll wait, so it works from any
/// thread; the broker checks the flag after every batch of events.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn attach(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Waker::new(registry, SHUTDOWN)?),
        })
    }

    /// Requests termination and wakes the broker loop.
    pub fn shutdown(&self) {
        self.request();
        if let Err(err) = self.waker.wake() {
            warn!(?err, "failed to wake broker loop");
        }
    }

    /// Sets the flag without waking; enough when called from inside the
    /// loop itself.
    pub(crate) fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub(crate) fn requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Watches operator standard input for the shutdown command.
///
/// The fd is switched to non-blocking and registered with the poll set;
/// complete lines are scanned as they arrive and a line beginning with
/// `exit` terminates the broker.
pub(crate) struct OperatorInput {
    line_buf: Vec<u8>,
}

impl OperatorInput {
    pub fn register(registry: &Registry) -> io::Result<Self> {
        set_nonblocking(STDIN_FD)?;
        registry.register(&mut SourceFd(&STDIN_FD), OPERATOR, Interest::READABLE)?;
        Ok(Self { line_buf: Vec::new() })
    }

    /// Drains pending operator input; true once an `exit` line arrived.
    pub fn saw_exit(&mut self) -> bool {
        let mut chunk = [0u8; 256];
        loop {
            let n = unsafe { libc::read(STDIN_FD, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n > 0 {
                self.line_buf.extend_from_slice(&chunk[..n as usize]);
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => {}
                _ => {
                    warn!(?err, "operator input read failed");
                    break;
                }
            }
        }
        take_exit_line(&mut self.line_buf)
    }
}

/// Consumes every complete line in `buf`, keeping a partial trailing line
/// for the next read. True if any consumed line begins with `exit`.
fn take_exit_line(buf: &mut Vec<u8>) -> bool {
    let mut saw_exit = false;
    while let Some(nl) = buf.iter().position(|&b| b == b'\n') {
        let starts_with_exit = buf[..nl].starts_with(b"exit");
        buf.drain(..=nl);
        saw_exit |= starts_with_exit;
    }
    saw_exit
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
