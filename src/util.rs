use std::os::unix::io::RawFd;
use std::{io, mem, ptr};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// `setsockopt` wrapper
///
/// The libc `setsockopt` function is set to set various options on a socket.
/// `set_socket_option` offers a somewhat type-safe wrapper that does not
/// require messing around with `*const c_void`s.
///
/// A proper `std::io::Error` will be returned on failure.
///
/// Example use:
///
/// ```text
/// let fd = ...;  // a raw CAN socket
/// set_socket_option(fd, SOL_CAN_RAW, CAN_RAW_LOOPBACK, &(0 as c_int))
/// ```
///
/// Note that the `val` parameter must be specified correctly; if an option
/// expects an integer, it is advisable to pass in a `c_int`, not the default
/// of `i32`.
pub fn set_socket_option<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, val: &T) -> io::Result<()> {
    let r = unsafe {
        let val_ptr: *const T = val as *const T;
        libc::setsockopt(
            fd,
            level,
            name,
            val_ptr as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };

    if r != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

pub fn set_socket_option_mult<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, values: &[T]) -> io::Result<()> {
    let r = if values.is_empty() {
        // can't pass in a pointer to the first element if a 0-length slice,
        // pass a nullpointer instead
        unsafe { libc::setsockopt(fd, level, name, ptr::null(), 0) }
    } else {
        unsafe {
            let val_ptr = values.as_ptr();

            libc::setsockopt(
                fd,
                level,
                name,
                val_ptr as *const libc::c_void,
                (mem::size_of::<T>() * values.len()) as libc::socklen_t,
            )
        }
    };

    if r != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Toggle `O_NONBLOCK`. Returns whether the descriptor was non-blocking
/// before the call.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> nix::Result<bool> {
    let previous = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let mut flags = previous;
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    if flags != previous {
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
    }
    Ok(previous.contains(OFlag::O_NONBLOCK))
}

/// Check that `fd` refers to an open descriptor.
pub fn is_open(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    match fcntl(fd, FcntlArg::F_GETFD) {
        Ok(_) => true,
        Err(Errno::EBADF) => false,
        Err(_) => true,
    }
}
