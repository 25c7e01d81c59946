extern crate log;
extern crate env_logger;
extern crate socketcan_evloop;

use socketcan_evloop::{CanFrame, EventLoop, SocketCanIntf};

/// Send one frame, `write_once [iface] [ID#DATA]`.
fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let iface = args.next().unwrap_or_else(|| "vcan0".to_owned());
    let text = args.next().unwrap_or_else(|| "07B#DEADBEEF".to_owned());

    let event_loop = EventLoop::new().unwrap();
    let mut bus = SocketCanIntf::new();
    bus.init(&iface, &event_loop, |_| {}).unwrap();

    let frame: CanFrame = text.parse().unwrap();
    match bus.send_can_frame(&frame) {
        Ok(()) => log::debug!("Frame Send Success"),
        Err(e) => log::debug!("Frame Send Error {}", e),
    }
}
