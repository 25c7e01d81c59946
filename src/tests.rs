use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::sys::epoll::EpollFlags;
use nix::unistd::{close, pipe, write};

use crate::*;

const SHORT: Duration = Duration::from_millis(50);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Pipe {
    rd: RawFd,
    wr: RawFd,
}

impl Pipe {
    fn new() -> Pipe {
        let (rd, wr) = pipe().unwrap();
        Pipe { rd, wr }
    }

    fn poke(&self) {
        write(self.wr, b"x").unwrap();
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let _ = close(self.rd);
        let _ = close(self.wr);
    }
}

#[test]
fn register_then_deregister_leaves_table_empty() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let p = Pipe::new();

    let id = event_loop.register_event(p.rd, EpollFlags::EPOLLIN, |_| {}).unwrap();
    assert_eq!(event_loop.len(), 1);
    assert!(event_loop.is_registered(id));
    assert_eq!(event_loop.interest(id), Some(EpollFlags::EPOLLIN));

    event_loop.deregister_event(id).unwrap();
    assert!(event_loop.is_empty());
    assert!(!event_loop.is_registered(id));
}

#[test]
fn double_registration_keeps_first() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let p = Pipe::new();
    let fired = Rc::new(Cell::new(0));

    let counter = fired.clone();
    let first = event_loop
        .register_event(p.rd, EpollFlags::EPOLLIN, move |_| counter.set(counter.get() + 1))
        .unwrap();

    match event_loop.register_event(p.rd, EpollFlags::EPOLLIN, |_| panic!("second callback")) {
        Err(EventLoopError::AlreadyRegistered(fd)) => assert_eq!(fd, p.rd),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(event_loop.len(), 1);
    assert!(event_loop.is_registered(first));

    p.poke();
    assert_eq!(event_loop.run_once(Some(SHORT)).unwrap(), 1);
    assert_eq!(fired.get(), 1);

    event_loop.deregister_event(first).unwrap();
}

#[test]
fn rejects_bad_registrations() {
    let event_loop = EventLoop::new().unwrap();
    let p = Pipe::new();

    assert!(matches!(
        event_loop.register_event(p.rd, EpollFlags::empty(), |_| {}),
        Err(EventLoopError::EmptyInterest)
    ));
    assert!(matches!(
        event_loop.register_event(-1, EpollFlags::EPOLLIN, |_| {}),
        Err(EventLoopError::InvalidDescriptor(-1))
    ));
    assert!(event_loop.is_empty());
}

#[test]
fn stale_handles_are_rejected() {
    let event_loop = EventLoop::new().unwrap();
    let a = Pipe::new();
    let b = Pipe::new();

    let old = event_loop.register_event(a.rd, EpollFlags::EPOLLIN, |_| {}).unwrap();
    event_loop.deregister_event(old).unwrap();
    assert!(matches!(
        event_loop.deregister_event(old),
        Err(EventLoopError::UnknownHandle(id)) if id == old
    ));

    // same slot, new generation
    let new = event_loop.register_event(b.rd, EpollFlags::EPOLLIN, |_| {}).unwrap();
    assert_ne!(old, new);
    assert!(event_loop.deregister_event(old).is_err());
    assert!(event_loop.is_registered(new));
    assert!(event_loop.modify_event(old, EpollFlags::EPOLLOUT).is_err());

    event_loop.deregister_event(new).unwrap();
}

#[test]
fn handles_from_another_loop_are_unknown() {
    let first = EventLoop::new().unwrap();
    let second = EventLoop::new().unwrap();
    let p = Pipe::new();

    let id = first.register_event(p.rd, EpollFlags::EPOLLIN, |_| {}).unwrap();
    assert!(second.deregister_event(id).is_err());
    assert_eq!(first.len(), 1);
    first.deregister_event(id).unwrap();
}

#[test]
fn only_ready_descriptors_fire() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let pipes: Vec<Pipe> = (0..3).map(|_| Pipe::new()).collect();
    let seen: Rc<RefCell<Vec<(usize, EpollFlags)>>> = Rc::new(RefCell::new(Vec::new()));

    let ids: Vec<EvtId> = pipes
        .iter()
        .enumerate()
        .map(|(n, p)| {
            let seen = seen.clone();
            event_loop
                .register_event(p.rd, EpollFlags::EPOLLIN, move |mask| seen.borrow_mut().push((n, mask)))
                .unwrap()
        })
        .collect();

    pipes[0].poke();
    pipes[2].poke();

    assert_eq!(event_loop.run_once(Some(SHORT)).unwrap(), 2);

    let mut fired: Vec<usize> = seen.borrow().iter().map(|&(n, _)| n).collect();
    fired.sort();
    assert_eq!(fired, vec![0, 2]);
    assert!(seen.borrow().iter().all(|&(_, mask)| mask.contains(EpollFlags::EPOLLIN)));

    for id in ids {
        event_loop.deregister_event(id).unwrap();
    }
}

#[test]
fn idle_cycle_times_out() {
    let event_loop = EventLoop::new().unwrap();
    let p = Pipe::new();
    let id = event_loop.register_event(p.rd, EpollFlags::EPOLLIN, |_| panic!("not ready")).unwrap();

    assert_eq!(event_loop.run_once(Some(Duration::from_millis(10))).unwrap(), 0);
    assert_eq!(event_loop.run_once(Some(Duration::from_millis(0))).unwrap(), 0);

    event_loop.deregister_event(id).unwrap();
}

#[test]
fn observed_mask_may_exceed_interest() {
    let event_loop = EventLoop::new().unwrap();
    let (rd, wr) = pipe().unwrap();
    let observed = Rc::new(Cell::new(EpollFlags::empty()));

    let sink = observed.clone();
    let id = event_loop.register_event(rd, EpollFlags::EPOLLIN, move |mask| sink.set(mask)).unwrap();

    close(wr).unwrap();
    assert_eq!(event_loop.run_once(Some(SHORT)).unwrap(), 1);
    assert!(observed.get().contains(EpollFlags::EPOLLHUP));

    event_loop.deregister_event(id).unwrap();
    close(rd).unwrap();
}

#[test]
fn deregistered_mid_cycle_does_not_fire() {
    init_logging();
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let a = Pipe::new();
    let b = Pipe::new();
    let fired = Rc::new(Cell::new(0));
    let handles: Rc<RefCell<Vec<EvtId>>> = Rc::new(RefCell::new(Vec::new()));

    for p in &[&a, &b] {
        let weak: Weak<EventLoop> = Rc::downgrade(&event_loop);
        let fired = fired.clone();
        let all = handles.clone();
        let id = event_loop
            .register_event(p.rd, EpollFlags::EPOLLIN, move |_| {
                fired.set(fired.get() + 1);
                let event_loop = weak.upgrade().unwrap();
                // drop both registrations, the other one included
                for id in all.borrow().iter() {
                    let _ = event_loop.deregister_event(*id);
                }
            })
            .unwrap();
        handles.borrow_mut().push(id);
    }

    a.poke();
    b.poke();

    assert_eq!(event_loop.run_once(Some(SHORT)).unwrap(), 1);
    assert_eq!(fired.get(), 1);
    assert!(event_loop.is_empty());
}

#[test]
fn callback_can_register_during_dispatch() {
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let a = Pipe::new();
    let b = Rc::new(Pipe::new());
    let late_fired = Rc::new(Cell::new(false));

    let weak = Rc::downgrade(&event_loop);
    let late = b.clone();
    let flag = late_fired.clone();
    let first = event_loop
        .register_event(a.rd, EpollFlags::EPOLLIN, move |_| {
            let event_loop = weak.upgrade().unwrap();
            let flag = flag.clone();
            if event_loop.len() == 1 {
                event_loop
                    .register_event(late.rd, EpollFlags::EPOLLIN, move |_| flag.set(true))
                    .unwrap();
            }
        })
        .unwrap();

    a.poke();
    b.poke();
    assert_eq!(event_loop.run_once(Some(SHORT)).unwrap(), 1);
    assert_eq!(event_loop.len(), 2);
    assert!(!late_fired.get());

    event_loop.deregister_event(first).unwrap();
    assert_eq!(event_loop.run_once(Some(SHORT)).unwrap(), 1);
    assert!(late_fired.get());
}

#[test]
fn run_until_empty_stops_after_self_deregistration() {
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let p = Pipe::new();
    let handle: Rc<Cell<Option<EvtId>>> = Rc::new(Cell::new(None));

    let weak = Rc::downgrade(&event_loop);
    let own = handle.clone();
    let id = event_loop
        .register_event(p.rd, EpollFlags::EPOLLIN, move |_| {
            if let (Some(event_loop), Some(id)) = (weak.upgrade(), own.get()) {
                event_loop.deregister_event(id).unwrap();
            }
        })
        .unwrap();
    handle.set(Some(id));

    p.poke();
    event_loop.run_until_empty().unwrap();
    assert!(event_loop.is_empty());
}

#[test]
fn run_until_honours_shutdown_flag() {
    let event_loop = EventLoop::new().unwrap();
    let shutdown = ShutdownFlag::new();
    let fired = Rc::new(Cell::new(0));

    let mut wakeup = WakeupEvent::new();
    let stop = shutdown.clone();
    let counter = fired.clone();
    wakeup
        .init(&event_loop, move |_| {
            counter.set(counter.get() + 1);
            stop.trigger();
        })
        .unwrap();

    let waker = wakeup.waker();
    let worker = std::thread::spawn(move || waker.set().unwrap());

    let dispatched = event_loop.run_until(&shutdown, Duration::from_secs(5)).unwrap();
    worker.join().unwrap();

    assert_eq!(dispatched, 1);
    assert_eq!(fired.get(), 1);
    assert!(shutdown.is_triggered());
    wakeup.deinit();
}

#[test]
fn interrupted_wait_runs_to_full_timeout() {
    use nix::sys::pthread::{pthread_kill, pthread_self};
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::thread;
    use std::time::Instant;

    extern "C" fn ignore(_: libc::c_int) {}

    init_logging();
    // no SA_RESTART, so the signal makes epoll_wait fail with EINTR
    let action = SigAction::new(SigHandler::Handler(ignore), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGUSR1, &action) }.unwrap();

    let event_loop = EventLoop::new().unwrap();
    let p = Pipe::new();
    let id = event_loop.register_event(p.rd, EpollFlags::EPOLLIN, |_| panic!("not ready")).unwrap();

    let target = pthread_self();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        pthread_kill(target, Signal::SIGUSR1).unwrap();
    });

    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    assert_eq!(event_loop.run_once(Some(timeout)).unwrap(), 0);
    assert!(started.elapsed() >= timeout);

    interrupter.join().unwrap();
    event_loop.deregister_event(id).unwrap();
}

#[test]
fn send_before_init_fails() {
    let bus = SocketCanIntf::new();
    let frame = CanFrame::new(0x123, &[0, 1, 2, 3, 4, 5, 6, 7], false, false).unwrap();

    assert!(matches!(bus.send_can_frame(&frame), Err(TransportError::Uninitialized)));
    assert!(matches!(bus.read_nonblocking(), Err(TransportError::Uninitialized)));
    assert!(!bus.is_initialized());
    assert!(bus.raw_fd().is_none());
}

#[test]
fn init_with_missing_interface_fails_cleanly() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let mut bus = SocketCanIntf::new();

    let result = bus.init("invalid_interface", &event_loop, |_| {});
    assert!(matches!(result, Err(TransportError::InterfaceNotFound(_))));
    assert!(!bus.is_initialized());
    assert!(event_loop.is_empty());

    bus.deinit();
    bus.deinit();
    assert!(!bus.is_initialized());
}

#[test]
fn init_on_non_can_interface_fails_cleanly() {
    let event_loop = EventLoop::new().unwrap();
    let mut bus = SocketCanIntf::new();

    // "lo" exists everywhere but is not a CAN device; depending on whether
    // the can module is loaded this fails at socket() or at bind()
    let result = bus.init("lo", &event_loop, |_| {});
    assert!(matches!(
        result,
        Err(TransportError::Socket(_)) | Err(TransportError::Bind(_, _))
    ));
    assert!(!bus.is_initialized());
    assert!(event_loop.is_empty());
    bus.deinit();
}

#[cfg(feature = "vcan_tests")]
mod vcan {
    //! Needs a live `vcan0`:
    //!
    //! ```text
    //! sudo modprobe vcan
    //! sudo ip link add dev vcan0 type vcan
    //! sudo ip link set up vcan0
    //! ```

    use super::*;

    const IFACE: &str = "vcan0";

    fn collector() -> (Rc<RefCell<Vec<CanFrame>>>, impl FnMut(CanFrame) + 'static) {
        let frames = Rc::new(RefCell::new(Vec::new()));
        let sink = frames.clone();
        (frames, move |frame| sink.borrow_mut().push(frame))
    }

    #[test]
    fn loop_delivers_frames_in_order() {
        init_logging();
        let event_loop = EventLoop::new().unwrap();
        let (received, on_frame) = collector();

        let mut rx = SocketCanIntf::new();
        rx.init(IFACE, &event_loop, on_frame).unwrap();
        let mut tx = SocketCanIntf::new();
        tx.init(IFACE, &event_loop, |_| {}).unwrap();
        assert_eq!(rx.interface(), Some(IFACE));

        for n in 0..5u8 {
            let frame = CanFrame::new(0x300 + u32::from(n), &[0x10 + n, 0x20 + n], false, false).unwrap();
            tx.send_can_frame(&frame).unwrap();
        }

        let mut cycles = 0;
        while received.borrow().len() < 5 && cycles < 50 {
            event_loop.run_once(Some(SHORT)).unwrap();
            cycles += 1;
        }

        let ids: Vec<u32> = received.borrow().iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![0x300, 0x301, 0x302, 0x303, 0x304]);
        assert_eq!(received.borrow()[2].data(), &[0x12, 0x22]);

        tx.deinit();
        rx.deinit();
        assert!(event_loop.is_empty());
    }

    #[test]
    fn manual_polling_on_registered_socket() {
        let event_loop = EventLoop::new().unwrap();
        let (received, on_frame) = collector();

        let mut rx = SocketCanIntf::new();
        rx.init(IFACE, &event_loop, on_frame).unwrap();
        let mut tx = SocketCanIntf::new();
        tx.init(IFACE, &event_loop, |_| {}).unwrap();

        assert_eq!(rx.read_nonblocking().unwrap(), 0);

        let ext = CanFrame::from_raw_id(0x12345678 | constants::EFF_FLAG, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        let rtr = CanFrame::new(0x123, &[], true, false).unwrap();
        tx.send_can_frame(&ext).unwrap();
        tx.send_can_frame(&rtr).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(rx.read_nonblocking().unwrap(), 2);
        let frames = received.borrow();
        assert!(frames[0].is_extended());
        assert_eq!(frames[0].id(), 0x12345678);
        assert!(frames[1].is_rtr());
        assert!(frames[1].is_empty());
    }

    #[test]
    fn own_messages_and_filters() {
        let event_loop = EventLoop::new().unwrap();
        let (received, on_frame) = collector();

        let config = TransportConfig::new(IFACE)
            .with_recv_own_msgs(true)
            .with_filters(&[CanFilter::standard(0x42)]);
        let mut bus = SocketCanIntf::new();
        bus.init_with(&config, &event_loop, on_frame).unwrap();

        bus.send_can_frame(&CanFrame::new(0x41, &[1], false, false).unwrap()).unwrap();
        bus.send_can_frame(&CanFrame::new(0x42, &[2], false, false).unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(bus.read_nonblocking().unwrap(), 1);
        assert_eq!(received.borrow()[0].id(), 0x42);
    }

    #[test]
    fn second_init_is_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let mut bus = SocketCanIntf::new();
        bus.init(IFACE, &event_loop, |_| {}).unwrap();
        let fd = bus.raw_fd();

        assert!(matches!(
            bus.init(IFACE, &event_loop, |_| {}),
            Err(TransportError::AlreadyInitialized)
        ));
        assert_eq!(bus.raw_fd(), fd);
        assert_eq!(event_loop.len(), 1);
    }
}
