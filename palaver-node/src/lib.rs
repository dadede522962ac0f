pub mod client;
pub mod logger;
pub mod runtime;
pub mod service;
pub mod signals;
#[cfg(test)]
mod tests;
pub mod ui;
pub mod wire;

pub use localtime::{LocalDuration, LocalTime};

pub mod prelude {
    pub use crate::service::events::{Event, Events};
    pub use crate::service::membership::{Membership, Peer};
    pub use crate::service::message::{Entry, Nickname, Reply, Request, Response, Vote};
    pub use crate::service::{Command, Config, Service};
    pub use crate::{LocalDuration, LocalTime};
}
