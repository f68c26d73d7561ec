//! A Linux `SocketCAN` `CAN_RAW` socket, opened directly with `libc` and `nix` rather than a
//! kernel-module-specific crate.
//!
//! This mirrors the pack's ISO 15765-2 ("ISO-TP") socket implementation one layer down the
//! stack: same `socket`/`bind`/`fcntl` dance via raw `libc` calls, the interface name resolved
//! to an index with `nix::net::if_::if_nametoindex`, non-blocking mode set once at open time
//! since [j1939_link::CanSocket] is only ever driven from readable/writable reactor edges.

use std::io;
use std::os::unix::io::RawFd;

use eyre::WrapErr;
use j1939_link::CanSocket;
use libc::{c_int, c_void};

/// `PF_CAN` / `AF_CAN`: the CAN protocol family (`linux/can.h`).
const PF_CAN: c_int = 29;
const AF_CAN: c_int = 29;
/// `CAN_RAW`: raw-frame socket type for `PF_CAN` (not `CAN_ISOTP`; we want unsegmented access to
/// every frame on the bus, since segmentation is this crate's own job).
const CAN_RAW: c_int = 1;

/// `struct sockaddr_can` (`linux/can.h`). The `can_addr` union is zeroed and unused: `CAN_RAW`
/// bind only consults `can_family`/`can_ifindex`.
#[repr(C)]
struct SockaddrCan {
    can_family: libc::sa_family_t,
    can_ifindex: c_int,
    can_addr: [u8; 16],
}

/// A non-blocking `CAN_RAW` socket on a named interface (e.g. `can0`, `vcan0`).
pub struct CanRawSocket {
    fd: RawFd,
}

impl CanRawSocket {
    /// Open and bind a `CAN_RAW` socket on `ifname`, in non-blocking mode.
    pub fn open(ifname: &str) -> eyre::Result<Self> {
        let if_index = nix::net::if_::if_nametoindex(ifname)
            .wrap_err_with(|| format!("no such CAN interface {ifname:?}"))?;

        let fd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };
        if fd == -1 {
            return Err(io::Error::last_os_error()).wrap_err("failed to open CAN_RAW socket");
        }
        let socket = Self { fd };

        let addr = SockaddrCan {
            can_family: AF_CAN as libc::sa_family_t,
            can_ifindex: if_index as c_int,
            can_addr: [0u8; 16],
        };
        let bind_rv = unsafe {
            libc::bind(
                fd,
                &addr as *const SockaddrCan as *const libc::sockaddr,
                std::mem::size_of::<SockaddrCan>() as libc::socklen_t,
            )
        };
        if bind_rv == -1 {
            let err = io::Error::last_os_error();
            return Err(err).wrap_err(format!("failed to bind to interface {ifname:?}"));
        }

        socket.set_nonblocking()?;
        Ok(socket)
    }

    fn set_nonblocking(&self) -> eyre::Result<()> {
        let oldfl = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if oldfl == -1 {
            return Err(io::Error::last_os_error()).wrap_err("fcntl F_GETFL failed");
        }
        let rv = unsafe { libc::fcntl(self.fd, libc::F_SETFL, oldfl | libc::O_NONBLOCK) };
        if rv == -1 {
            return Err(io::Error::last_os_error()).wrap_err("fcntl F_SETFL O_NONBLOCK failed");
        }
        Ok(())
    }
}

impl CanSocket for CanRawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn send_frame(&mut self, frame: &j1939_link::CanFrame) -> eyre::Result<bool> {
        let buf = frame.encode();
        let rv = unsafe {
            libc::write(self.fd, buf.as_ptr() as *const c_void, buf.len())
        };
        if rv == buf.len() as isize {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(err).wrap_err("CAN_RAW send failed")
    }

    fn recv_frame(&mut self) -> eyre::Result<Option<j1939_link::CanFrame>> {
        let mut buf = [0u8; 16];
        let rv = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if rv == buf.len() as isize {
            return Ok(Some(j1939_link::CanFrame::decode(&buf)?));
        }
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err).wrap_err("CAN_RAW recv failed");
        }
        eyre::bail!("short CAN_RAW read: expected 16 bytes, got {rv}");
    }
}

impl Drop for CanRawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
