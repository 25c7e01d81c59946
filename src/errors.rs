use std::os::unix::io::RawFd;
use std::{error, fmt, io};

use nix::errno::Errno;

use crate::event_loop::EvtId;

/// Error constructing or decoding a `CanFrame`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstructionError {
    /// More than 8 bytes of payload, or a wire record claiming more.
    TooMuchData,

    /// The identifier does not fit into 29 bits.
    IdTooLarge,

    /// A remote transmission request was given payload bytes.
    RemoteWithData,

    /// A wire record was shorter than `CAN_WIRE_LEN`. Contains the actual
    /// length.
    ShortRecord(usize),

    /// Text was not in `ID#DATA` form.
    InvalidText,
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ConstructionError::TooMuchData => write!(f, "CAN frame payload exceeds 8 bytes"),
            ConstructionError::IdTooLarge => write!(f, "CAN ID does not fit into 29 bits"),
            ConstructionError::RemoteWithData => write!(f, "remote frame cannot carry data"),
            ConstructionError::ShortRecord(n) => write!(f, "short CAN record ({} bytes)", n),
            ConstructionError::InvalidText => write!(f, "expected ID#DATA"),
        }
    }
}

impl error::Error for ConstructionError {}

/// Failure of an `EventLoop` or `WakeupEvent` operation.
#[derive(Debug)]
pub enum EventLoopError {
    /// The descriptor is not open.
    InvalidDescriptor(RawFd),

    /// The descriptor is already monitored by this loop.
    AlreadyRegistered(RawFd),

    /// An empty interest mask was supplied.
    EmptyInterest,

    /// The handle was never issued by this loop or has already been
    /// deregistered.
    UnknownHandle(EvtId),

    /// The wakeup descriptor has been released.
    Closed,

    /// The epoll primitive (or another system call) rejected the request.
    Sys(Errno),
}

impl fmt::Display for EventLoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EventLoopError::InvalidDescriptor(fd) => write!(f, "descriptor {} is not open", fd),
            EventLoopError::AlreadyRegistered(fd) => write!(f, "descriptor {} is already registered", fd),
            EventLoopError::EmptyInterest => write!(f, "empty interest mask"),
            EventLoopError::UnknownHandle(id) => write!(f, "unknown event handle {}", id),
            EventLoopError::Closed => write!(f, "event descriptor closed"),
            EventLoopError::Sys(errno) => write!(f, "system error: {}", errno),
        }
    }
}

impl error::Error for EventLoopError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            EventLoopError::Sys(ref errno) => Some(errno),
            _ => None,
        }
    }
}

impl From<Errno> for EventLoopError {
    fn from(errno: Errno) -> Self {
        EventLoopError::Sys(errno)
    }
}

/// Failure of a `SocketCanIntf` operation.
#[derive(Debug)]
pub enum TransportError {
    /// The transport has not been bound to an interface.
    Uninitialized,

    /// `init` was called on a transport that is already bound.
    AlreadyInitialized,

    /// The interface name did not resolve to an index.
    InterfaceNotFound(String),

    /// Creating or configuring the raw socket failed.
    Socket(io::Error),

    /// Binding to the named interface failed (absent or down).
    Bind(String, io::Error),

    /// The socket could not be registered with the event loop.
    Register(EventLoopError),

    /// The send queue is full: the socket buffer (`EAGAIN`) or the
    /// interface transmit queue (`ENOBUFS`).
    WouldBlock,

    /// Any other read or write failure.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TransportError::Uninitialized => write!(f, "transport is not initialized"),
            TransportError::AlreadyInitialized => write!(f, "transport is already initialized"),
            TransportError::InterfaceNotFound(ref name) => write!(f, "no such interface: {}", name),
            TransportError::Socket(ref e) => write!(f, "socket error: {}", e),
            TransportError::Bind(ref name, ref e) => write!(f, "cannot bind to {}: {}", name, e),
            TransportError::Register(ref e) => write!(f, "cannot register socket: {}", e),
            TransportError::WouldBlock => write!(f, "send would block"),
            TransportError::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl error::Error for TransportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            TransportError::Socket(ref e) | TransportError::Bind(_, ref e) | TransportError::Io(ref e) => Some(e),
            TransportError::Register(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<EventLoopError> for TransportError {
    fn from(e: EventLoopError) -> Self {
        TransportError::Register(e)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        // CAN drivers report a full tx queue as ENOBUFS rather than EAGAIN
        if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::ENOBUFS) {
            TransportError::WouldBlock
        } else {
            TransportError::Io(e)
        }
    }
}
