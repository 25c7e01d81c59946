extern crate env_logger;
extern crate log;
extern crate socketcan_evloop;

use socketcan_evloop::{EventLoop, ShutdownFlag, SocketCanIntf, WakeupEvent};
use std::thread;
use std::time::Duration;

/// Poll an interface with `read_nonblocking` for a few seconds.
///
/// A timer thread raises the shutdown flag and nudges the loop through a
/// wakeup event, so the wait ends right away instead of on the next tick.
fn main() {
    env_logger::init();
    let iface = std::env::args().nth(1).unwrap_or_else(|| "vcan0".to_owned());

    let event_loop = EventLoop::new().unwrap();
    let shutdown = ShutdownFlag::new();

    let mut bus = SocketCanIntf::new();
    bus.init(&iface, &event_loop, |frame| println!("{:#X}", frame)).unwrap();

    let mut wakeup = WakeupEvent::new();
    wakeup.init(&event_loop, |_| log::debug!("woken up")).unwrap();

    let timer = {
        let shutdown = shutdown.clone();
        let waker = wakeup.waker();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(5));
            shutdown.trigger();
            if let Err(e) = waker.set() {
                log::warn!("wake: {}", e);
            }
        })
    };

    while !shutdown.is_triggered() {
        match bus.read_nonblocking() {
            Ok(0) => thread::sleep(Duration::from_millis(10)),
            Ok(n) => log::trace!("{} frames", n),
            Err(e) => {
                log::error!("{}", e);
                break;
            }
        }
    }

    // consume the wakeup so its callback runs once before teardown
    event_loop.run_once(Some(Duration::from_millis(100))).unwrap();

    timer.join().unwrap();
    wakeup.deinit();
    bus.deinit();
}
