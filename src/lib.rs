//! SocketCAN on an epoll event loop.
//!
//! The Linux kernel supports using CAN-devices through a network-like API
//! (see https://www.kernel.org/doc/Documentation/networking/can.txt). This
//! crate binds raw CAN sockets to interfaces and drives them from a single
//! thread through a readiness-based event loop, so receiving from any number
//! of buses never ties up a thread in a blocking read.
//!
//! # An introduction to CAN
//!
//! The CAN bus was originally designed to allow microcontrollers inside a
//! vehicle to communicate over a single shared bus. Messages called
//! *frames* are multicast to all devices on the bus.
//!
//! Every frame consists of an ID and a payload of up to 8 bytes. If two
//! devices attempt to send a frame at the same time, the device with the
//! higher ID will notice the conflict, stop sending and reattempt to sent its
//! frame in the next time slot. This means that the lower the ID, the higher
//! the priority.
//!
//! The Linux socketcan subsystem makes the CAN bus available as a regular
//! networking device. Opening an network interface allows receiving all CAN
//! messages received on it. A device CAN be opened multiple times, every
//! client will receive all CAN frames simultaneously.
//!
//! # Pieces
//!
//! * [`EventLoop`] multiplexes descriptors and calls back when they are
//!   ready. It owns no sockets.
//! * [`WakeupEvent`] lets another thread poke the loop through an eventfd.
//! * [`SocketCanIntf`] binds a [`CanSocket`] to an interface, registers it
//!   with a loop and hands decoded [`CanFrame`]s to a callback. It can also
//!   be polled with `read_nonblocking` and sends with `send_can_frame`.
//!
//! ```no_run
//! use socketcan_evloop::{CanFrame, EventLoop, SocketCanIntf};
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let mut bus = SocketCanIntf::new();
//! bus.init("vcan0", &event_loop, |frame| println!("{:X}", frame)).unwrap();
//!
//! bus.send_can_frame(&"123#DEADBEEF".parse::<CanFrame>().unwrap()).unwrap();
//! event_loop.run_once(Some(Duration::from_millis(100))).unwrap();
//! bus.deinit();
//! ```
//!
//! # RawFd
//!
//! Raw access to the underlying file descriptor and construction through
//! is available through the `AsRawFd`, `IntoRawFd` and `FromRawFd`
//! implementations of `CanSocket`.

pub extern crate libc;
pub extern crate log;
pub extern crate nix;

pub mod constants;
mod errors;
mod event_loop;
mod filter;
mod frame;
mod shutdown;
mod socket;
mod transport;
mod util;
mod wakeup;

pub use errors::{ConstructionError, EventLoopError, TransportError};
pub use event_loop::{EventLoop, EvtId, ReadyCallback};
pub use filter::CanFilter;
pub use frame::CanFrame;
pub use nix::sys::epoll::EpollFlags;
pub use shutdown::ShutdownFlag;
pub use socket::CanSocket;
pub use transport::{FrameCallback, SocketCanIntf, TransportConfig};
pub use wakeup::{WakeupEvent, Waker};

#[cfg(test)]
mod tests;
