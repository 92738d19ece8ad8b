//! Socket options std and tokio do not expose.

use std::io;
use std::time::Duration;

#[cfg(unix)]
mod imp {
    use std::io;
    use std::mem::size_of;
    use std::os::fd::AsRawFd;

    pub(super) fn set<T>(socket: &impl AsRawFd, name: libc::c_int, value: &T) -> io::Result<()> {
        // SAFETY: `value` points at a live `T` and the length passed is its size.
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                name,
                value as *const T as *const libc::c_void,
                size_of::<T>() as libc::socklen_t,
            )
        };

        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Sets `SO_RCVBUF` and `SO_SNDBUF`. Zero leaves a size alone.
#[cfg(unix)]
pub(crate) fn set_buffer_sizes(
    socket: &impl std::os::fd::AsRawFd,
    recv: usize,
    send: usize,
) -> io::Result<()> {
    let clamp = |size: usize| size.min(libc::c_int::MAX as usize) as libc::c_int;
    if recv > 0 {
        imp::set(socket, libc::SO_RCVBUF, &clamp(recv))?;
    }
    if send > 0 {
        imp::set(socket, libc::SO_SNDBUF, &clamp(send))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_buffer_sizes<S>(_socket: &S, _recv: usize, _send: usize) -> io::Result<()> {
    Ok(())
}

/// Enables `SO_LINGER` with the given timeout, in whole seconds.
#[cfg(unix)]
pub(crate) fn set_linger(socket: &impl std::os::fd::AsRawFd, linger: Duration) -> io::Result<()> {
    let value = libc::linger {
        l_onoff: 1,
        l_linger: linger.as_secs().min(libc::c_int::MAX as u64) as libc::c_int,
    };
    imp::set(socket, libc::SO_LINGER, &value)
}

#[cfg(not(unix))]
pub(crate) fn set_linger<S>(_socket: &S, _linger: Duration) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_LINGER is not supported on this platform",
    ))
}
