use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::{fmt, io, mem};

use nix::errno::Errno;
use nix::net::if_::if_nametoindex;
use nix::unistd::{close, read, write};

use crate::constants::*;
use crate::errors::TransportError;
use crate::filter::CanFilter;
use crate::frame::CanFrame;
use crate::util::{set_nonblocking, set_socket_option, set_socket_option_mult};

/// `struct sockaddr_can` up to and including the interface index, which is
/// all a raw socket bind looks at.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
struct CanAddr {
    _af_can: libc::sa_family_t,
    if_index: libc::c_int,
    rx_id: u32,
    tx_id: u32,
}

/// A raw CAN socket bound to one interface.
///
/// The socket is opened non-blocking: reads return `Ok(None)` and writes
/// return `ErrorKind::WouldBlock` instead of waiting.
pub struct CanSocket {
    fd: RawFd,
}

impl CanSocket {
    /// Open a raw socket on the named interface (e.g. `vcan0`).
    pub fn open(ifname: &str) -> Result<CanSocket, TransportError> {
        if ifname.is_empty() || ifname.len() > IFNAMSIZ_MAX {
            return Err(TransportError::InterfaceNotFound(ifname.to_owned()));
        }

        let if_index = if_nametoindex(ifname).map_err(|e| {
            log::debug!("if_nametoindex({}): {}", ifname, e);
            TransportError::InterfaceNotFound(ifname.to_owned())
        })?;

        let sock = CanSocket::open_if(if_index).map_err(|e| match e {
            OpenError::Socket(e) => TransportError::Socket(e),
            OpenError::Bind(e) => TransportError::Bind(ifname.to_owned(), e),
        })?;
        log::debug!("bound fd {} to {} (index {})", sock.fd, ifname, if_index);

        Ok(sock)
    }

    /// Open a raw socket on an interface given by index.
    fn open_if(if_index: libc::c_uint) -> Result<CanSocket, OpenError> {
        let addr = CanAddr {
            _af_can: libc::AF_CAN as libc::sa_family_t,
            if_index: if_index as libc::c_int,
            rx_id: 0,
            tx_id: 0,
        };

        let fd = unsafe {
            libc::socket(
                libc::PF_CAN,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                CAN_RAW,
            )
        };
        if fd == -1 {
            return Err(OpenError::Socket(io::Error::last_os_error()));
        }

        // bind it
        let bind_rv = unsafe {
            let sockaddr_ptr = &addr as *const CanAddr;
            libc::bind(
                fd,
                sockaddr_ptr as *const libc::sockaddr,
                mem::size_of::<CanAddr>() as libc::socklen_t,
            )
        };

        if bind_rv == -1 {
            let e = io::Error::last_os_error();
            let _ = close(fd);
            return Err(OpenError::Bind(e));
        }

        Ok(CanSocket { fd })
    }

    /// Read one frame if one is queued.
    ///
    /// A record that does not decode is reported as `ErrorKind::InvalidData`;
    /// it has been consumed from the socket either way.
    pub fn read_frame(&self) -> io::Result<Option<CanFrame>> {
        let mut buf = [0u8; CAN_WIRE_LEN];

        let n = loop {
            match read(self.fd, &mut buf) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };

        CanFrame::decode(&buf[..n])
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write a single frame.
    ///
    /// Each frame is one record, so it is either sent completely or not at
    /// all. A full send buffer is reported as `ErrorKind::WouldBlock`.
    pub fn write_frame(&self, frame: &CanFrame) -> io::Result<()> {
        let record = frame.encode();

        loop {
            match write(self.fd, &record) {
                Ok(n) if n == CAN_WIRE_LEN => return Ok(()),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short CAN write ({} of {} bytes)", n, CAN_WIRE_LEN),
                    ))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Change socket to non-blocking mode or back to blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        set_nonblocking(self.fd, nonblocking)?;
        Ok(())
    }

    /// Sets filters on the socket.
    ///
    /// CAN packages received by SocketCAN are matched against these filters,
    /// only matching packets are returned by the interface.
    ///
    /// See `CanFilter` for details on how filtering works. By default, a
    /// single filter matching all incoming frames is installed.
    pub fn set_filters(&self, filters: &[CanFilter]) -> io::Result<()> {
        set_socket_option_mult(self.fd, SOL_CAN_RAW, CAN_RAW_FILTER, filters)
    }

    /// Disable reception of CAN frames.
    ///
    /// Sets a completely empty filter; disabling all CAN frame reception.
    #[inline(always)]
    pub fn filter_drop_all(&self) -> io::Result<()> {
        let filters: [CanFilter; 0] = [];
        self.set_filters(&filters)
    }

    /// Accept all frames, disabling any kind of filtering.
    ///
    /// Replace the current filter with one containing a single rule that
    /// accepts all CAN frames.
    pub fn filter_accept_all(&self) -> io::Result<()> {
        self.set_filters(&[CanFilter::new(0, 0)])
    }

    /// Sets the error mask on the socket.
    ///
    /// By default (`ERR_MASK_NONE`) no error conditions are reported as
    /// special error frames by the socket. Enabling error conditions by
    /// setting `ERR_MASK_ALL` or another non-empty error mask causes the
    /// socket to receive notification about the specified conditions.
    #[inline]
    pub fn set_error_mask(&self, mask: u32) -> io::Result<()> {
        set_socket_option(self.fd, SOL_CAN_RAW, CAN_RAW_ERR_FILTER, &mask)
    }

    /// Enable or disable loopback.
    ///
    /// By default, loopback is enabled, causing other applications that open
    /// the same CAN bus to see frames emitted by different applications on
    /// the same system.
    #[inline]
    pub fn set_loopback(&self, enabled: bool) -> io::Result<()> {
        let loopback: libc::c_int = if enabled { 1 } else { 0 };
        set_socket_option(self.fd, SOL_CAN_RAW, CAN_RAW_LOOPBACK, &loopback)
    }

    /// Enable or disable receiving of own frames.
    ///
    /// When loopback is enabled, this settings controls if CAN frames sent
    /// are received back immediately by sender. Default is off.
    pub fn set_recv_own_msgs(&self, enabled: bool) -> io::Result<()> {
        let recv_own_msgs: libc::c_int = if enabled { 1 } else { 0 };
        set_socket_option(self.fd, SOL_CAN_RAW, CAN_RAW_RECV_OWN_MSGS, &recv_own_msgs)
    }
}

enum OpenError {
    Socket(io::Error),
    Bind(io::Error),
}

impl fmt::Debug for CanSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanSocket").field("fd", &self.fd).finish()
    }
}

impl AsRawFd for CanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for CanSocket {
    unsafe fn from_raw_fd(fd: RawFd) -> CanSocket {
        CanSocket { fd }
    }
}

impl IntoRawFd for CanSocket {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for CanSocket {
    fn drop(&mut self) {
        if let Err(e) = close(self.fd) {
            log::warn!("closing CAN socket {}: {}", self.fd, e);
        }
    }
}
