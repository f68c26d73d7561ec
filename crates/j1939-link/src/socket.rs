//! The socket abstraction the [crate::link::Link] is generic over.
//!
//! Keeping the link generic over a small trait rather than a concrete OS socket type lets the
//! protocol engine be driven by an in-memory double in tests, with no real CAN interface
//! involved. The demo binary's concrete implementation opens a Linux `SocketCAN` `CAN_RAW`
//! socket directly; see `j1939-node`.

use std::os::unix::io::RawFd;

use crate::frame::CanFrame;

/// A single non-blocking CAN socket, accepting the kernel's 16-byte frame layout.
pub trait CanSocket {
    /// File descriptor the caller's reactor should register read (and conditionally write)
    /// interest on.
    fn as_raw_fd(&self) -> RawFd;

    /// Attempt to send one frame without blocking.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` if the send would block (the caller should
    /// requeue the frame and retry on the next writable edge), and `Err` for a permanent
    /// transport failure.
    fn send_frame(&mut self, frame: &CanFrame) -> eyre::Result<bool>;

    /// Receive one frame without blocking.
    ///
    /// Returns `Ok(None)` if no frame is currently available.
    fn recv_frame(&mut self) -> eyre::Result<Option<CanFrame>>;
}
