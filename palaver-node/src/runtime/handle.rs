use std::net;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use crossbeam_channel as chan;
use thiserror::Error;

use crate::runtime::Input;
use crate::service::membership::Peer;
use crate::service::message::Entry;
use crate::service::Command;

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The node is no longer running.
    #[error("node is not running")]
    NotConnected,
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::NotConnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::NotConnected
    }
}

/// A handle for communicating with the running node.
#[derive(Debug, Clone)]
pub struct Handle {
    pub(crate) inputs: chan::Sender<Input>,
    pub(crate) local_addr: net::SocketAddr,
    /// Whether a shutdown was initiated or not. Prevents shutting down
    /// twice.
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl Handle {
    /// Queue a chat line for replication.
    pub fn submit(&self, line: impl ToString) -> Result<(), Error> {
        self.inputs
            .send(Input::Command(Command::Submit(line.to_string())))?;

        Ok(())
    }

    /// The committed log, in order.
    pub fn history(&self) -> Result<Vec<Entry>, Error> {
        let (sender, receiver) = chan::bounded(1);
        self.inputs.send(Input::Command(Command::History(sender)))?;
        receiver.recv().map_err(Error::from)
    }

    /// The live peer set.
    pub fn peers(&self) -> Result<Vec<Peer>, Error> {
        let (sender, receiver) = chan::bounded(1);
        self.inputs.send(Input::Command(Command::Peers(sender)))?;
        receiver.recv().map_err(Error::from)
    }

    /// Shut the node down. Idempotent.
    pub fn shutdown(&self) -> Result<(), Error> {
        // If the current value is `false`, set it to `true`, otherwise
        // we've already shut down.
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.inputs.send(Input::Shutdown)?;

        // A throwaway connection to our own listener unblocks its accept
        // loop so it can observe the flag.
        let addr = if self.local_addr.ip().is_unspecified() {
            net::SocketAddr::new(net::Ipv4Addr::LOCALHOST.into(), self.local_addr.port())
        } else {
            self.local_addr
        };
        TcpStream::connect_timeout(&addr, time::Duration::from_secs(1)).ok();

        Ok(())
    }
}
