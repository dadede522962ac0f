//! Node runtime: binds the listener, spawns the threads, owns shutdown.
//!
//! The service runs as an actor on its own thread. The listener accepts
//! and decodes inbound requests, then hands them over with the connection
//! still open; the service replies once it has made its state transition.
pub mod handle;

use std::io;
use std::net;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{thread, time};

use crossbeam_channel as chan;
use localtime::LocalTime;
use socket2::{Domain, Socket, Type};
use thiserror::Error;

use crate::client;
use crate::service::events::{self, Emitter, Events};
use crate::service::message::Request;
use crate::service::{Command, Config, Service};
use crate::wire;

pub use handle::Handle;

/// An input for the service loop.
pub(crate) enum Input {
    /// A decoded inbound request, with its connection still open.
    Request {
        remote: net::SocketAddr,
        request: Request,
        stream: TcpStream,
    },
    /// An operator command.
    Command(Command),
    /// Stop the service loop.
    Shutdown,
}

/// A runtime error.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Holds join handles to the node threads, as well as a node handle.
pub struct Runtime {
    /// The address the listener is bound to.
    pub local_addr: net::SocketAddr,
    /// Handle for driving the node.
    pub handle: Handle,
    /// Event feed for the UI collaborator.
    pub events: Events,
    listener: thread::JoinHandle<()>,
    service: thread::JoinHandle<()>,
}

impl Runtime {
    /// Initialize the runtime.
    ///
    /// This function spawns threads.
    pub fn init(config: Config) -> Result<Runtime, Error> {
        let listener = listener(&config.listen)?;
        let local_addr = listener.local_addr()?;
        let external = config.external.unwrap_or_else(|| {
            let ip = if config.listen.ip().is_unspecified() {
                local_ip().unwrap_or_else(|| net::Ipv4Addr::LOCALHOST.into())
            } else {
                config.listen.ip()
            };
            net::SocketAddr::new(ip, local_addr.port())
        });

        log::info!(target: "node", "Listening on {local_addr}..");
        log::info!(target: "node", "Advertising ourselves as {external}");

        let (inputs, mailbox) = chan::unbounded::<Input>();
        let (emitter, events) = events::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = Handle {
            inputs: inputs.clone(),
            local_addr,
            shutdown: shutdown.clone(),
        };

        let listener = thread::Builder::new().name("listener".to_owned()).spawn({
            let emitter = emitter.clone();
            move || accept_loop(listener, inputs, emitter, shutdown)
        })?;
        let service = thread::Builder::new()
            .name("service".to_owned())
            .spawn(move || {
                let mut service = Service::new(
                    config,
                    external,
                    LocalTime::now(),
                    fastrand::Rng::new(),
                    emitter,
                );
                service.initialize();
                service_loop(service, mailbox);
            })?;

        Ok(Runtime {
            local_addr,
            handle,
            events,
            listener,
            service,
        })
    }

    /// Block until the node has shut down.
    pub fn join(self) -> Result<(), Error> {
        self.service
            .join()
            .map_err(|_| io::Error::other("service thread panicked"))?;
        self.listener
            .join()
            .map_err(|_| io::Error::other("listener thread panicked"))?;

        log::debug!(target: "node", "Node shutdown completed");

        Ok(())
    }
}

/// Bind a TCP listener with address reuse, so a restarted node can take
/// the port back immediately.
fn listener(addr: &net::SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(64)?;

    Ok(socket.into())
}

/// Accept inbound connections, decode one request each, and queue them for
/// the service. Connection-level failures are logged and surfaced as
/// `error` events; only an accept failure stops the loop.
fn accept_loop(
    listener: TcpListener,
    inputs: chan::Sender<Input>,
    emitter: Emitter,
    shutdown: Arc<AtomicBool>,
) {
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match incoming {
            Ok(mut stream) => {
                let remote = match stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        log::warn!(target: "node", "Connection vanished before it was read: {e}");
                        continue;
                    }
                };
                stream.set_read_timeout(Some(client::IO_TIMEOUT)).ok();
                stream.set_write_timeout(Some(client::IO_TIMEOUT)).ok();

                match wire::recv::<Request>(&mut stream) {
                    Ok(request) => {
                        if inputs
                            .send(Input::Request {
                                remote,
                                request,
                                stream,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!(target: "node", "Bad request from {remote}: {e}");
                        emitter.error(format!("bad request from {remote}: {e}"));
                    }
                }
            }
            Err(e) => {
                log::error!(target: "node", "Accept failed: {e}");
                emitter.error(format!("server thread error: {e}"));
                break;
            }
        }
    }
    log::debug!(target: "node", "Listener loop exited");
}

/// Drain the mailbox, letting the service block on the channel until its
/// next deadline when it has one.
fn service_loop(mut service: Service, mailbox: chan::Receiver<Input>) {
    loop {
        let input = match service.next_wakeup() {
            Some(deadline) => {
                let now = LocalTime::now();
                let timeout = if deadline > now {
                    // Round up so we don't spin on a sub-millisecond rest.
                    time::Duration::from_millis((deadline - now).as_millis() as u64 + 1)
                } else {
                    time::Duration::ZERO
                };
                match mailbox.recv_timeout(timeout) {
                    Ok(input) => Some(input),
                    Err(chan::RecvTimeoutError::Timeout) => None,
                    Err(chan::RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match mailbox.recv() {
                Ok(input) => Some(input),
                Err(_) => break,
            },
        };
        service.tick(LocalTime::now());
        service.wake();

        match input {
            Some(Input::Request {
                remote,
                request,
                stream,
            }) => {
                if let Some(reply) = service.received(remote.ip(), request) {
                    if let Err(e) = wire::send(&stream, &reply) {
                        log::warn!(target: "node", "Failed to reply to {remote}: {e}");
                    }
                }
                // Dropping the stream closes the connection, framing the
                // reply.
            }
            Some(Input::Command(cmd)) => service.command(cmd),
            Some(Input::Shutdown) => break,
            // Woke up for a deadline; `wake` already handled it.
            None => {}
        }
    }
    log::debug!(target: "node", "Service loop exited");
}

/// Best-effort discovery of the address peers can reach us on: the local
/// address of a UDP socket "connected" to a public one. No traffic is
/// sent.
fn local_ip() -> Option<net::IpAddr> {
    let socket = net::UdpSocket::bind((net::Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("8.8.8.8", 53)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
