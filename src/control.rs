//! The self-pipe "control channel" used to wake the blocked Watcher thread
//! and hand it `Poke`/`Shutdown` messages (spec.md §4.2), grounded on the
//! teacher's `src/sys/unix/selector/poll.rs` `notify_read`/`notify_write`
//! pipe and on the original's `select_poke`/`SELECT_POKE_*` constants.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::fd::{close_fd, set_cloexec, set_nonblocking};

/// One message written down the control pipe. Each message is a fixed
/// 5-byte frame: a one-byte tag followed by a 4-byte fd (big-endian),
/// unused for `Shutdown`/`NoOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlMsg {
    /// Re-scan this fd's interest bits; sent whenever a socket operation
    /// changes what the watcher should wait for.
    Poke(RawFd),
    /// Stop the watcher loop after draining anything already queued.
    Shutdown,
    /// Wake the watcher with no state change (used by tests).
    NoOp,
}

const TAG_POKE: u8 = 1;
const TAG_SHUTDOWN: u8 = 2;
const TAG_NOOP: u8 = 3;
const FRAME_LEN: usize = 5;

pub(crate) struct ControlChannel {
    read_fd: RawFd,
    write_fd: Mutex<RawFd>,
}

impl ControlChannel {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        let [read_fd, write_fd] = fds;
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;
        set_cloexec(read_fd)?;
        set_cloexec(write_fd)?;
        Ok(ControlChannel {
            read_fd,
            write_fd: Mutex::new(write_fd),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Write one message; retries on `EINTR`, treats `EAGAIN` (pipe full) as
    /// success since the watcher will rescan everything on its next wakeup
    /// regardless of which exact message arrives.
    pub(crate) fn poke(&self, msg: ControlMsg) {
        let mut frame = [0u8; FRAME_LEN];
        let fd = match msg {
            ControlMsg::Poke(fd) => {
                frame[0] = TAG_POKE;
                fd
            }
            ControlMsg::Shutdown => {
                frame[0] = TAG_SHUTDOWN;
                0
            }
            ControlMsg::NoOp => {
                frame[0] = TAG_NOOP;
                0
            }
        };
        frame[1..5].copy_from_slice(&fd.to_be_bytes());

        let guard = self.write_fd.lock().unwrap();
        let mut file = unsafe { std::fs::File::from_raw_fd_borrowed(*guard) };
        loop {
            match file.write(&frame) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        std::mem::forget(file);
    }

    /// Drain every complete frame currently sitting in the pipe. Returns the
    /// decoded messages in arrival order; an incomplete trailing frame (rare
    /// under our fixed 5-byte protocol, but possible under `EINTR`) is
    /// simply dropped, consistent with the watcher always treating "woken"
    /// as "rescan everything".
    pub(crate) fn drain(&self, max_frames: usize) -> Vec<ControlMsg> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; FRAME_LEN * max_frames.max(1)];
        let mut file = unsafe { std::fs::File::from_raw_fd_borrowed(self.read_fd) };
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for chunk in buf[..n].chunks_exact(FRAME_LEN) {
                        let fd = RawFd::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
                        let msg = match chunk[0] {
                            TAG_POKE => ControlMsg::Poke(fd),
                            TAG_SHUTDOWN => ControlMsg::Shutdown,
                            _ => ControlMsg::NoOp,
                        };
                        out.push(msg);
                    }
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        std::mem::forget(file);
        out
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        close_fd(self.read_fd);
        close_fd(*self.write_fd.lock().unwrap());
    }
}

/// Minimal stand-in for the unstable `FromRawFd` "borrowed" constructors:
/// builds a `File` that must be `mem::forget`-ten by the caller so it never
/// closes the fd it borrows.
trait FromRawFdBorrowed {
    unsafe fn from_raw_fd_borrowed(fd: RawFd) -> Self;
}

impl FromRawFdBorrowed for std::fs::File {
    unsafe fn from_raw_fd_borrowed(fd: RawFd) -> Self {
        use std::os::unix::io::FromRawFd;
        std::fs::File::from_raw_fd(fd)
    }
}
