use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use nix::sys::epoll::EpollFlags;

use crate::errors::TransportError;
use crate::event_loop::{EventLoop, EvtId};
use crate::filter::CanFilter;
use crate::frame::CanFrame;
use crate::socket::CanSocket;

/// Receives every frame a transport decodes.
pub type FrameCallback = Box<dyn FnMut(CanFrame)>;

const DEFAULT_READ_BATCH: usize = 64;

/// Socket options applied by `SocketCanIntf::init_with` before the socket
/// is registered. Options left unset keep the kernel defaults.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    interface: String,
    filters: Option<Vec<CanFilter>>,
    loopback: Option<bool>,
    recv_own_msgs: Option<bool>,
    error_mask: Option<u32>,
    read_batch: usize,
}

impl TransportConfig {
    pub fn new(interface: &str) -> TransportConfig {
        TransportConfig {
            interface: interface.to_owned(),
            filters: None,
            loopback: None,
            recv_own_msgs: None,
            error_mask: None,
            read_batch: DEFAULT_READ_BATCH,
        }
    }

    pub fn with_filters(mut self, filters: &[CanFilter]) -> TransportConfig {
        self.filters = Some(filters.to_vec());
        self
    }

    pub fn with_loopback(mut self, enabled: bool) -> TransportConfig {
        self.loopback = Some(enabled);
        self
    }

    pub fn with_recv_own_msgs(mut self, enabled: bool) -> TransportConfig {
        self.recv_own_msgs = Some(enabled);
        self
    }

    pub fn with_error_mask(mut self, mask: u32) -> TransportConfig {
        self.error_mask = Some(mask);
        self
    }

    /// Upper bound on frames `read_nonblocking` drains per call.
    pub fn with_read_batch(mut self, read_batch: usize) -> TransportConfig {
        self.read_batch = read_batch.max(1);
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn apply(&self, socket: &CanSocket) -> io::Result<()> {
        if let Some(ref filters) = self.filters {
            socket.set_filters(filters)?;
        }
        if let Some(enabled) = self.loopback {
            socket.set_loopback(enabled)?;
        }
        if let Some(enabled) = self.recv_own_msgs {
            socket.set_recv_own_msgs(enabled)?;
        }
        if let Some(mask) = self.error_mask {
            socket.set_error_mask(mask)?;
        }
        socket.set_nonblocking(true)
    }
}

struct Bound<'a> {
    event_loop: &'a EventLoop,
    socket: Rc<CanSocket>,
    interface: String,
    evt_id: EvtId,
    on_frame: Rc<RefCell<FrameCallback>>,
    read_batch: usize,
}

/// CAN transport on one interface, driven by an `EventLoop`.
///
/// Starts out uninitialized. `init` binds it to an interface and registers
/// the socket for read readiness; from then on every frame that arrives while
/// the loop dispatches is passed to the frame callback. The same callback is
/// used by `read_nonblocking` for callers that poll instead.
///
/// The transport borrows the loop, so the loop outlives the registration.
pub struct SocketCanIntf<'a> {
    state: Option<Bound<'a>>,
}

impl<'a> SocketCanIntf<'a> {
    pub fn new() -> SocketCanIntf<'a> {
        SocketCanIntf { state: None }
    }

    /// Bind to `interface` and register with `event_loop`.
    ///
    /// On failure nothing stays open or registered and the transport remains
    /// uninitialized. A missing interface and one that is down both end up
    /// as an error here; which variant depends on where the kernel rejects it.
    pub fn init<F>(&mut self, interface: &str, event_loop: &'a EventLoop, on_frame: F) -> Result<(), TransportError>
    where
        F: FnMut(CanFrame) + 'static,
    {
        self.init_with(&TransportConfig::new(interface), event_loop, on_frame)
    }

    /// Like `init`, applying the socket options in `config` first.
    pub fn init_with<F>(
        &mut self,
        config: &TransportConfig,
        event_loop: &'a EventLoop,
        on_frame: F,
    ) -> Result<(), TransportError>
    where
        F: FnMut(CanFrame) + 'static,
    {
        if self.state.is_some() {
            return Err(TransportError::AlreadyInitialized);
        }

        let socket = CanSocket::open(config.interface())?;
        config.apply(&socket).map_err(TransportError::Socket)?;

        let socket = Rc::new(socket);
        let callback: FrameCallback = Box::new(on_frame);
        let on_frame = Rc::new(RefCell::new(callback));

        let evt_id = event_loop.register_event(
            socket.as_raw_fd(),
            EpollFlags::EPOLLIN,
            readable_handler(config.interface().to_owned(), socket.clone(), on_frame.clone()),
        )?;

        log::debug!("{}: transport registered as {}", config.interface(), evt_id);
        self.state = Some(Bound {
            event_loop,
            socket,
            interface: config.interface().to_owned(),
            evt_id,
            on_frame,
            read_batch: config.read_batch,
        });

        Ok(())
    }

    /// Deliver whatever frames are queued right now, without waiting.
    ///
    /// Returns the number of frames passed to the callback; zero when none
    /// were pending. Records that fail to decode are skipped.
    pub fn read_nonblocking(&self) -> Result<usize, TransportError> {
        let bound = self.state.as_ref().ok_or(TransportError::Uninitialized)?;

        let mut delivered = 0;
        for _ in 0..bound.read_batch {
            match bound.socket.read_frame() {
                Ok(Some(frame)) => {
                    deliver(&bound.interface, &bound.on_frame, frame);
                    delivered += 1;
                }
                Ok(None) => break,
                Err(ref e) if e.kind() == io::ErrorKind::InvalidData => {
                    log::warn!("{}: dropping malformed record: {}", bound.interface, e);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        Ok(delivered)
    }

    /// Queue one frame for transmission without blocking.
    ///
    /// A full send buffer yields `TransportError::WouldBlock`; the frame is
    /// not retried.
    pub fn send_can_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let bound = self.state.as_ref().ok_or(TransportError::Uninitialized)?;

        bound.socket.write_frame(frame)?;
        log::trace!("{}: sent {:X}", bound.interface, frame);
        Ok(())
    }

    /// Deregister and close the socket. Does nothing when uninitialized.
    pub fn deinit(&mut self) {
        if let Some(bound) = self.state.take() {
            if let Err(e) = bound.event_loop.deregister_event(bound.evt_id) {
                log::warn!("{}: deregistering {}: {}", bound.interface, bound.evt_id, e);
            }
            log::debug!("{}: transport closed", bound.interface);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Name of the bound interface.
    pub fn interface(&self) -> Option<&str> {
        self.state.as_ref().map(|bound| bound.interface.as_str())
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.state.as_ref().map(|bound| bound.socket.as_raw_fd())
    }

    /// The underlying socket, for adjusting options after `init`.
    pub fn socket(&self) -> Option<&CanSocket> {
        self.state.as_ref().map(|bound| &*bound.socket)
    }
}

impl<'a> Default for SocketCanIntf<'a> {
    fn default() -> Self {
        SocketCanIntf::new()
    }
}

impl<'a> Drop for SocketCanIntf<'a> {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// Loop callback: decode one record per readiness notification. The loop is
/// level triggered, so frames still queued are reported on the next cycle.
fn readable_handler(
    interface: String,
    socket: Rc<CanSocket>,
    on_frame: Rc<RefCell<FrameCallback>>,
) -> impl FnMut(EpollFlags) + 'static {
    move |mask| {
        if mask.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            log::warn!("{}: socket reported {:?}", interface, mask);
        }
        if !mask.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR) {
            return;
        }

        match socket.read_frame() {
            Ok(Some(frame)) => deliver(&interface, &on_frame, frame),
            Ok(None) => {}
            Err(e) => log::warn!("{}: read failed: {}", interface, e),
        }
    }
}

fn deliver(interface: &str, on_frame: &RefCell<FrameCallback>, frame: CanFrame) {
    log::trace!("{}: received {:X}", interface, frame);
    match on_frame.try_borrow_mut() {
        Ok(mut callback) => (&mut *callback)(frame),
        Err(_) => log::warn!("{}: frame callback re-entered, dropping {:X}", interface, frame),
    }
}
