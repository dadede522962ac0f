//! Graceful handling of termination signals.
use std::io;
use std::sync::OnceLock;

use crossbeam_channel as chan;

/// A termination signal. An interrupt at the terminal means the same
/// thing as end-of-file on stdin: the user wants out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `SIGINT`.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
}

/// Where notifications are sent. Set once at install time, read from the
/// signal handler.
static NOTIFY: OnceLock<chan::Sender<Signal>> = OnceLock::new();

/// Route `SIGINT` and `SIGTERM` to the given channel. Can only be done
/// once per process.
pub fn install(notify: chan::Sender<Signal>) -> io::Result<()> {
    if NOTIFY.set(notify).is_err() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "signal handler is already installed",
        ));
    }
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: `receive` doesn't block: it only inspects the signal
        // number and does a non-blocking send.
        if unsafe { libc::signal(signal, receive as libc::sighandler_t) } == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Called by the operating system when a signal is delivered.
extern "C" fn receive(signal: libc::c_int) {
    let signal = match signal {
        libc::SIGINT => Signal::Interrupt,
        libc::SIGTERM => Signal::Terminate,
        _ => return,
    };
    if let Some(notify) = NOTIFY.get() {
        notify.try_send(signal).ok();
    }
}
