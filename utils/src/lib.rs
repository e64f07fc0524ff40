//! Small cross-cutting helpers shared by the datastore and server crates:
//! the request-facing error taxonomy and a signal-aware shutdown channel.

pub mod error;

pub use error::{Error, ErrorKind, ResultExt};

use std::panic;

/// Bounded rendezvous channel used to request process shutdown. Installs a
/// panic hook that also raises `SIGINT` so a panicking background task still
/// triggers graceful shutdown instead of leaving the process half-alive.
pub fn make_signal_channel() -> (async_channel::Sender<()>, async_channel::Receiver<()>) {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        default_hook(info);
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
    }));
    async_channel::bounded(1)
}
