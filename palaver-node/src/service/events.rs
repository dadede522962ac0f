use std::ops::Deref;
use std::time;

use crossbeam_channel as chan;

use crate::service::message::Nickname;

/// An event emitted by the node for its UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Something the user should know about.
    Info(String),
    /// Something went wrong.
    Error(String),
    /// A chat message was committed to the log.
    Message { sender: Nickname, content: String },
    /// A peer confirmed delivery of one of our messages.
    Ack { sender: Nickname, message: String },
}

/// Create a connected emitter/feed pair.
pub fn channel() -> (Emitter, Events) {
    let (sender, receiver) = chan::unbounded();
    (Emitter(sender), Events(receiver))
}

/// The emitting end of the event bridge.
#[derive(Debug, Clone)]
pub struct Emitter(chan::Sender<Event>);

impl Emitter {
    /// Emit an event. A send failure means the UI is gone, which is not
    /// the node's problem.
    pub fn emit(&self, event: Event) {
        self.0.send(event).ok();
    }

    pub fn info(&self, msg: impl ToString) {
        self.emit(Event::Info(msg.to_string()));
    }

    pub fn error(&self, msg: impl ToString) {
        self.emit(Event::Error(msg.to_string()));
    }
}

/// Events feed.
pub struct Events(chan::Receiver<Event>);

impl From<chan::Receiver<Event>> for Events {
    fn from(value: chan::Receiver<Event>) -> Self {
        Self(value)
    }
}

impl Deref for Events {
    type Target = chan::Receiver<Event>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Events {
    /// Listen for events, and wait for the given predicate to return something,
    /// or timeout if the specified amount of time has elapsed.
    pub fn wait<F>(
        &self,
        mut f: F,
        timeout: time::Duration,
    ) -> Result<Event, chan::RecvTimeoutError>
    where
        F: FnMut(&Event) -> bool,
    {
        let start = time::Instant::now();

        loop {
            if let Some(timeout) = timeout.checked_sub(start.elapsed()) {
                match self.recv_timeout(timeout) {
                    Ok(event) => {
                        if f(&event) {
                            return Ok(event);
                        }
                    }
                    Err(err @ chan::RecvTimeoutError::Disconnected) => {
                        return Err(err);
                    }
                    Err(chan::RecvTimeoutError::Timeout) => {
                        // Keep trying until our timeout reaches zero.
                        continue;
                    }
                }
            } else {
                return Err(chan::RecvTimeoutError::Timeout);
            }
        }
    }
}
