extern crate env_logger;
extern crate log;
extern crate socketcan_evloop;

use socketcan_evloop::{EventLoop, ShutdownFlag, SocketCanIntf};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

/// Print every frame seen on an interface until 100 have arrived.
fn main() {
    env_logger::init();
    let iface = std::env::args().nth(1).unwrap_or_else(|| "vcan0".to_owned());

    let event_loop = EventLoop::new().unwrap();
    let shutdown = ShutdownFlag::new();
    let count = Rc::new(Cell::new(0u32));

    let mut bus = SocketCanIntf::new();
    let stop = shutdown.clone();
    let seen = count.clone();
    if let Err(e) = bus.init(&iface, &event_loop, move |frame| {
        seen.set(seen.get() + 1);
        let kind = if frame.is_extended() { "EXT" } else { "STD" };
        println!("#{:<6} {} {:X}", seen.get(), kind, frame);
        if seen.get() >= 100 {
            stop.trigger();
        }
    }) {
        log::error!("{}: {}", iface, e);
        eprintln!("Make sure the interface exists: ip link show {}", iface);
        std::process::exit(1);
    }

    event_loop.run_until(&shutdown, Duration::from_millis(500)).unwrap();
    bus.deinit();
    log::debug!("{} frames received", count.get());
}
