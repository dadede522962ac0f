//! Fallback line-oriented user interface.
//!
//! A pure consumer of node events and producer of user-typed lines:
//! stdin lines are submitted for replication, events are printed to
//! stdout. Anything fancier (scrollback, colors, input editing) belongs
//! to a richer frontend implementing the same contract.
use std::io;
use std::io::prelude::*;
use std::thread;

use crossbeam_channel as chan;

use crate::runtime::Handle;
use crate::service::events::{Event, Events};
use crate::signals::Signal;

/// Run the UI until the user quits (end-of-file or an interrupt signal)
/// or the node goes away.
pub fn run(handle: &Handle, events: &Events, signals: &chan::Receiver<Signal>) -> io::Result<()> {
    let (sender, lines) = chan::unbounded();

    // Stdin has no non-blocking read; give it its own thread.
    thread::Builder::new().name("stdin".to_owned()).spawn({
        move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            // Dropping the sender disconnects the channel, which reads as
            // end-of-input below.
        }
    })?;

    let events: &chan::Receiver<Event> = events;
    loop {
        chan::select! {
            recv(events) -> event => match event {
                Ok(Event::Info(msg)) => println!("* {msg}"),
                Ok(Event::Error(msg)) => println!("! {msg}"),
                Ok(Event::Message { sender, content }) => println!("<{sender}> {content}"),
                Ok(Event::Ack { sender, message }) => {
                    log::debug!(target: "ui", "{sender} acknowledged {message:?}");
                }
                Err(_) => break,
            },
            recv(lines) -> line => match line {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() && handle.submit(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(signals) -> signal => {
                if let Ok(signal) = signal {
                    log::debug!(target: "ui", "Received {signal:?}; exiting");
                }
                break;
            }
        }
    }
    io::stdout().flush()
}
