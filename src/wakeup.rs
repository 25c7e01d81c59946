use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, RwLock};

use nix::errno::Errno;
use nix::sys::epoll::EpollFlags;
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{read, write};

use crate::errors::EventLoopError;
use crate::event_loop::{EventLoop, EvtId};

type SharedFd = Arc<RwLock<Option<OwnedFd>>>;

/// Signal that makes an `EventLoop` call back on its own thread.
///
/// Backed by an eventfd. Any number of `set` calls between two dispatch
/// cycles result in a single callback.
pub struct WakeupEvent<'a> {
    event_loop: Option<&'a EventLoop>,
    evt_id: Option<EvtId>,
    fd: SharedFd,
}

/// Cloneable, thread-safe handle that signals a `WakeupEvent`.
#[derive(Clone)]
pub struct Waker {
    fd: SharedFd,
}

impl<'a> WakeupEvent<'a> {
    /// An event that is not yet attached to any loop.
    pub fn new() -> WakeupEvent<'a> {
        WakeupEvent {
            event_loop: None,
            evt_id: None,
            fd: Arc::new(RwLock::new(None)),
        }
    }

    /// Create the eventfd and register it on `event_loop`.
    ///
    /// `callback` receives the readiness mask, like any other registration.
    pub fn init<F>(&mut self, event_loop: &'a EventLoop, mut callback: F) -> Result<(), EventLoopError>
    where
        F: FnMut(EpollFlags) + 'static,
    {
        if let Some(fd) = self.raw_fd() {
            return Err(EventLoopError::AlreadyRegistered(fd));
        }

        let raw = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        // Safety: eventfd just returned this descriptor and nothing else owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };

        // wakers handed out before init share this slot
        store(&self.fd, Some(owned));

        let drain_fd = self.fd.clone();
        let evt_id = match event_loop.register_event(raw, EpollFlags::EPOLLIN, move |mask| {
            drain(&drain_fd);
            callback(mask);
        }) {
            Ok(evt_id) => evt_id,
            Err(e) => {
                store(&self.fd, None);
                return Err(e);
            }
        };

        self.event_loop = Some(event_loop);
        self.evt_id = Some(evt_id);
        log::debug!("wakeup event on fd {} registered as {}", raw, evt_id);

        Ok(())
    }

    /// Mark the event as signaled.
    pub fn set(&self) -> Result<(), EventLoopError> {
        signal(&self.fd)
    }

    /// A handle for signaling from other threads.
    pub fn waker(&self) -> Waker {
        Waker { fd: self.fd.clone() }
    }

    pub fn is_initialized(&self) -> bool {
        self.evt_id.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.read().ok()?.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Deregister and close the eventfd. Does nothing when not initialized.
    pub fn deinit(&mut self) {
        if let (Some(event_loop), Some(evt_id)) = (self.event_loop.take(), self.evt_id.take()) {
            if let Err(e) = event_loop.deregister_event(evt_id) {
                log::warn!("deregistering wakeup event {}: {}", evt_id, e);
            }
        }

        if let Some(fd) = store(&self.fd, None) {
            log::debug!("wakeup event on fd {} released", fd.as_raw_fd());
        }
    }
}

impl<'a> Default for WakeupEvent<'a> {
    fn default() -> Self {
        WakeupEvent::new()
    }
}

impl<'a> Drop for WakeupEvent<'a> {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl Waker {
    /// Mark the event as signaled. Safe to call from any thread.
    pub fn set(&self) -> Result<(), EventLoopError> {
        signal(&self.fd)
    }
}

/// Replace the shared descriptor, returning the previous one.
fn store(fd: &SharedFd, value: Option<OwnedFd>) -> Option<OwnedFd> {
    match fd.write() {
        Ok(mut guard) => std::mem::replace(&mut *guard, value),
        Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), value),
    }
}

fn signal(fd: &SharedFd) -> Result<(), EventLoopError> {
    let guard = fd.read().map_err(|_| EventLoopError::Closed)?;
    let fd = guard.as_ref().ok_or(EventLoopError::Closed)?;

    match write(fd.as_raw_fd(), &1u64.to_ne_bytes()) {
        Ok(_) => Ok(()),
        // counter saturated, the event is signaled anyway
        Err(Errno::EAGAIN) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn drain(fd: &SharedFd) {
    let guard = match fd.read() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    if let Some(fd) = guard.as_ref() {
        let mut counter = [0u8; 8];
        match read(fd.as_raw_fd(), &mut counter) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => log::warn!("draining wakeup event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_before_init_fails() {
        let event = WakeupEvent::new();
        assert!(matches!(event.set(), Err(EventLoopError::Closed)));
        assert!(!event.is_initialized());
    }

    #[test]
    fn coalesces_multiple_sets() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();

        let mut event = WakeupEvent::new();
        event.init(&event_loop, move |mask| {
            assert!(mask.contains(EpollFlags::EPOLLIN));
            counter.set(counter.get() + 1);
        }).unwrap();

        for _ in 0..5 {
            event.set().unwrap();
        }

        assert_eq!(event_loop.run_once(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(fired.get(), 1);

        // drained: nothing left to report
        assert_eq!(event_loop.run_once(Some(Duration::from_millis(10))).unwrap(), 0);
        assert_eq!(fired.get(), 1);

        event.deinit();
        assert!(event_loop.is_empty());
    }

    #[test]
    fn waker_signals_from_another_thread() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();

        let mut event = WakeupEvent::new();
        event.init(&event_loop, move |_| flag.set(true)).unwrap();

        let waker = event.waker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.set().unwrap();
        });

        assert_eq!(event_loop.run_once(Some(Duration::from_secs(5))).unwrap(), 1);
        assert!(fired.get());
        handle.join().unwrap();
    }

    #[test]
    fn deinit_is_idempotent_and_closes_wakers() {
        let event_loop = EventLoop::new().unwrap();
        let mut event = WakeupEvent::new();
        event.init(&event_loop, |_| {}).unwrap();
        let waker = event.waker();
        assert_eq!(event_loop.len(), 1);

        event.deinit();
        event.deinit();

        assert!(event_loop.is_empty());
        assert!(event.raw_fd().is_none());
        assert!(matches!(waker.set(), Err(EventLoopError::Closed)));
        assert!(matches!(event.set(), Err(EventLoopError::Closed)));
    }

    #[test]
    fn waker_taken_before_init_signals_after_init() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();

        let mut event = WakeupEvent::new();
        let early = event.waker();
        assert!(matches!(early.set(), Err(EventLoopError::Closed)));

        event.init(&event_loop, move |_| counter.set(counter.get() + 1)).unwrap();
        early.set().unwrap();

        assert_eq!(event_loop.run_once(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(fired.get(), 1);

        event.deinit();
        assert!(matches!(early.set(), Err(EventLoopError::Closed)));
    }

    #[test]
    fn double_init_is_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let mut event = WakeupEvent::new();
        event.init(&event_loop, |_| {}).unwrap();
        assert!(matches!(
            event.init(&event_loop, |_| {}),
            Err(EventLoopError::AlreadyRegistered(_))
        ));
        assert_eq!(event_loop.len(), 1);
    }
}
