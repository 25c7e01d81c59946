//! Single-threaded readiness dispatch on top of epoll.
//!
//! An `EventLoop` keeps a table of registrations, each one a descriptor, an
//! interest mask and a callback. `run_once` waits for readiness and calls the
//! callback of every descriptor that became ready, passing the mask epoll
//! reported (which may include `EPOLLERR`/`EPOLLHUP` on top of the interest).
//!
//! All methods take `&self`, so callbacks are free to register and
//! deregister descriptors while a dispatch cycle is in progress. A
//! registration removed during a cycle is never called again, even if
//! readiness for it was already collected by the same `epoll_wait`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use std::{fmt, mem};

use nix::errno::Errno;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::unistd::close;

use crate::errors::EventLoopError;
use crate::shutdown::ShutdownFlag;
use crate::util;

/// Callback invoked with the readiness mask observed for a descriptor.
pub type ReadyCallback = Box<dyn FnMut(EpollFlags)>;

const DEFAULT_MAX_EVENTS: usize = 64;

/// Opaque handle to one registration.
///
/// Slots are reused after deregistration; the generation makes handles to a
/// previous occupant of the slot unusable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EvtId {
    index: u32,
    generation: u32,
}

impl EvtId {
    fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    fn from_token(token: u64) -> EvtId {
        EvtId {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Display for EvtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Registration {
    fd: RawFd,
    interest: EpollFlags,
    // None while the callback is running
    callback: Option<ReadyCallback>,
}

struct Slot {
    generation: u32,
    entry: Option<Registration>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_fd: HashMap<RawFd, EvtId>,
}

impl Table {
    fn live(&self, id: EvtId) -> Option<&Registration> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn live_mut(&mut self, id: EvtId) -> Option<&mut Registration> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn next_id(&self) -> EvtId {
        match self.free.last() {
            Some(&index) => EvtId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => EvtId {
                index: self.slots.len() as u32,
                generation: 0,
            },
        }
    }

    fn insert(&mut self, id: EvtId, registration: Registration) {
        if self.free.last() == Some(&id.index) {
            self.free.pop();
        } else {
            self.slots.push(Slot {
                generation: id.generation,
                entry: None,
            });
        }
        self.by_fd.insert(registration.fd, id);
        self.slots[id.index as usize].entry = Some(registration);
    }

    fn remove(&mut self, id: EvtId) -> Option<Registration> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let registration = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.by_fd.remove(&registration.fd);
        Some(registration)
    }
}

/// Readiness-based event loop.
pub struct EventLoop {
    epfd: RawFd,
    table: RefCell<Table>,
    events: RefCell<Vec<EpollEvent>>,
    max_events: usize,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop, EventLoopError> {
        EventLoop::with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// Create a loop that collects at most `max_events` ready descriptors
    /// per `epoll_wait`. Remaining ones are reported on the next cycle.
    pub fn with_capacity(max_events: usize) -> Result<EventLoop, EventLoopError> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        log::debug!("created epoll context {}", epfd);

        Ok(EventLoop {
            epfd,
            table: RefCell::new(Table::default()),
            events: RefCell::new(Vec::new()),
            max_events: max_events.max(1),
        })
    }

    /// Start monitoring `fd` for `interest`.
    ///
    /// Fails without side effects if `fd` is closed, already registered on
    /// this loop, `interest` is empty or epoll rejects the descriptor.
    pub fn register_event<F>(&self, fd: RawFd, interest: EpollFlags, callback: F) -> Result<EvtId, EventLoopError>
    where
        F: FnMut(EpollFlags) + 'static,
    {
        if interest.is_empty() {
            return Err(EventLoopError::EmptyInterest);
        }
        if !util::is_open(fd) {
            return Err(EventLoopError::InvalidDescriptor(fd));
        }

        let mut table = self.table.borrow_mut();
        if table.by_fd.contains_key(&fd) {
            return Err(EventLoopError::AlreadyRegistered(fd));
        }

        let id = table.next_id();
        let mut event = EpollEvent::new(interest, id.token());
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event)?;

        table.insert(
            id,
            Registration {
                fd,
                interest,
                callback: Some(Box::new(callback)),
            },
        );
        log::debug!("registered fd {} as {} ({:?})", fd, id, interest);

        Ok(id)
    }

    /// Stop monitoring the descriptor behind `id` and drop its callback.
    ///
    /// The handle is invalid afterwards; deregistering it again fails with
    /// `UnknownHandle`.
    pub fn deregister_event(&self, id: EvtId) -> Result<(), EventLoopError> {
        let removed = {
            let mut table = self.table.borrow_mut();
            let fd = match table.live(id) {
                Some(registration) => registration.fd,
                None => return Err(EventLoopError::UnknownHandle(id)),
            };

            match epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None) {
                Ok(()) => {}
                // closing a descriptor already removed it from the epoll set
                Err(Errno::EBADF) | Err(Errno::ENOENT) => {
                    log::debug!("fd {} of {} was closed before deregistration", fd, id);
                }
                Err(e) => return Err(e.into()),
            }

            table.remove(id)
        };

        if let Some(registration) = removed {
            log::debug!("deregistered fd {} ({})", registration.fd, id);
        }
        Ok(())
    }

    /// Change the interest mask of an existing registration.
    pub fn modify_event(&self, id: EvtId, interest: EpollFlags) -> Result<(), EventLoopError> {
        if interest.is_empty() {
            return Err(EventLoopError::EmptyInterest);
        }

        let mut table = self.table.borrow_mut();
        let registration = table.live_mut(id).ok_or(EventLoopError::UnknownHandle(id))?;
        let mut event = EpollEvent::new(interest, id.token());
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, registration.fd, &mut event)?;
        registration.interest = interest;
        Ok(())
    }

    pub fn is_registered(&self, id: EvtId) -> bool {
        self.table.borrow().live(id).is_some()
    }

    /// Interest mask `id` was registered with.
    pub fn interest(&self, id: EvtId) -> Option<EpollFlags> {
        self.table.borrow().live(id).map(|registration| registration.interest)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.table.borrow().by_fd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a single dispatch cycle.
    ///
    /// Blocks until at least one descriptor is ready or `timeout` elapses
    /// (`None` waits indefinitely), then invokes the callback of every ready
    /// registration. Returns the number of callbacks invoked. An interrupted
    /// wait is restarted with whatever is left of the timeout.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize, EventLoopError> {
        let mut events = mem::take(&mut *self.events.borrow_mut());
        events.resize(self.max_events, EpollEvent::empty());

        let result = self.wait(&mut events, timeout).map(|n| self.dispatch(&events[..n]));

        *self.events.borrow_mut() = events;
        result
    }

    /// Dispatch cycles until no registrations remain.
    pub fn run_until_empty(&self) -> Result<(), EventLoopError> {
        while !self.is_empty() {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Dispatch cycles until `shutdown` is triggered or the table is empty.
    ///
    /// Each wait is bounded by `tick`, which is how long a trigger from
    /// another thread can go unnoticed unless it also sets a `WakeupEvent`.
    /// Returns the total number of callbacks invoked.
    pub fn run_until(&self, shutdown: &ShutdownFlag, tick: Duration) -> Result<usize, EventLoopError> {
        let mut dispatched = 0;
        while !shutdown.is_triggered() && !self.is_empty() {
            dispatched += self.run_once(Some(tick))?;
        }
        Ok(dispatched)
    }

    fn wait(&self, events: &mut [EpollEvent], timeout: Option<Duration>) -> Result<usize, EventLoopError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => duration_to_ms(deadline.saturating_duration_since(Instant::now())),
            };

            match epoll_wait(self.epfd, events, timeout_ms) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => {
                    log::trace!("epoll_wait interrupted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch(&self, ready: &[EpollEvent]) -> usize {
        let mut invoked = 0;

        for event in ready {
            let id = EvtId::from_token(event.data());
            let mask = event.events();

            let callback = match self.table.borrow_mut().live_mut(id) {
                Some(registration) => registration.callback.take(),
                // deregistered earlier in this cycle
                None => None,
            };
            let mut callback = match callback {
                Some(callback) => callback,
                None => continue,
            };

            log::trace!("dispatching {} with {:?}", id, mask);
            callback(mask);
            invoked += 1;

            // the callback may have deregistered itself; then it is dropped
            // here, outside of the table borrow
            let orphaned = {
                let mut table = self.table.borrow_mut();
                match table.live_mut(id) {
                    Some(registration) => {
                        registration.callback = Some(callback);
                        None
                    }
                    None => Some(callback),
                }
            };
            drop(orphaned);
        }

        invoked
    }
}

fn duration_to_ms(d: Duration) -> isize {
    let mut ms = d.as_millis();
    // round up so short timeouts do not degrade into a busy poll
    if Duration::from_millis(ms as u64) < d {
        ms += 1;
    }
    if ms > isize::MAX as u128 {
        isize::MAX
    } else {
        ms as isize
    }
}

impl AsRawFd for EventLoop {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let table = mem::take(self.table.get_mut());
        for (fd, id) in table.by_fd.iter() {
            log::warn!("event loop dropped with fd {} still registered ({})", fd, id);
            if let Err(e) = epoll_ctl(self.epfd, EpollOp::EpollCtlDel, *fd, None) {
                log::debug!("removing fd {} from epoll context {}: {}", fd, self.epfd, e);
            }
        }
        drop(table);

        if let Err(e) = close(self.epfd) {
            log::warn!("closing epoll context {}: {}", self.epfd, e);
        }
    }
}
