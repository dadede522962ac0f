use std::fmt;

use serde::{Deserialize, Serialize};

/// A display name chosen by a node's operator. Not unique.
pub type Nickname = String;

/// One slot of the committed message log. Entry `i` lives at position `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Position in the log.
    pub index: u64,
    /// Who committed the message.
    pub sender: Nickname,
    /// The message itself.
    pub message: String,
}

/// A vote cast in reply to a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Ack,
    Reject,
}

/// Requests peers send each other. Exactly one request travels per
/// connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Ask for the receiver's view of the network.
    #[serde(rename = "GET_NODES")]
    GetNodes {
        nickname: Nickname,
        /// The port the caller listens on. Without it, the receiver
        /// assumes the well-known application port.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// Announce ourselves as a new participant.
    #[serde(rename = "NEW_NODE")]
    NewNode {
        nickname: Nickname,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// Ask for the receiver's full commit log.
    #[serde(rename = "GET_HISTORY")]
    GetHistory,
    /// Propose a message for the given slot.
    #[serde(rename = "PROPOSE")]
    Propose {
        index: u64,
        message: String,
        sender: Nickname,
    },
    /// Commit the decided message at the given slot.
    #[serde(rename = "COMMIT")]
    Commit {
        index: u64,
        message: String,
        sender: Nickname,
    },
    /// Anything we don't understand. Logged and dropped.
    #[serde(other)]
    Unknown,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetNodes { nickname, .. } => write!(f, "GetNodes({nickname})"),
            Self::NewNode { nickname, .. } => write!(f, "NewNode({nickname})"),
            Self::GetHistory => write!(f, "GetHistory"),
            Self::Propose {
                index,
                message,
                sender,
            } => write!(f, "Propose({index}, {message:?}, {sender})"),
            Self::Commit {
                index,
                message,
                sender,
            } => write!(f, "Commit({index}, {message:?}, {sender})"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Reply to [`Request::GetNodes`]. The only untagged reply in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeList {
    /// `(address, nickname)` pairs, addresses in canonical string form.
    pub nodes: Vec<(String, Nickname)>,
}

/// Tagged replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// The receiver's next free slot index.
    #[serde(rename = "SYSTEM_INDEX")]
    SystemIndex { index: u64 },
    /// The receiver's full commit log.
    #[serde(rename = "HISTORY")]
    History { history: Vec<Entry> },
    /// A vote on a proposal. `sender` names the voter.
    #[serde(rename = "RESPONSE")]
    Vote {
        value: Vote,
        index: u64,
        sender: Nickname,
    },
    /// Confirmation that a commit was applied. `sender` names the responder.
    #[serde(rename = "ACK_COMMIT")]
    AckCommit { message: String, sender: Nickname },
}

/// Any single reply a node can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Nodes(NodeList),
    Response(Response),
}
