//! Wire framing: one UTF-8 JSON document per direction per connection.
//!
//! The sender writes its document and half-closes the write side; the
//! receiver reads to EOF, bounded by [`MAX_MESSAGE_SIZE`]. Closing the
//! connection after the reply frames the exchange.
use std::io::{self, Read, Write};
use std::net;
use std::net::TcpStream;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Upper bound of a single wire message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum Error {
    /// The message doesn't fit in [`MAX_MESSAGE_SIZE`] bytes.
    #[error("message exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    MessageTooLarge,
    /// The remote sent something that isn't a valid message.
    #[error("invalid message payload: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the remote could not be reached, as opposed to misbehaving.
    /// Timeouts count: an unresponsive peer gets no say in the round.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether the remote simply took too long. Unlike a refused
    /// connection, this is no evidence that the peer is gone: it may be
    /// busy with a fan-out of its own.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        )
    }
}

/// Serialize a message, enforcing the size bound.
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, Error> {
    let buf = serde_json::to_vec(msg)?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge);
    }
    Ok(buf)
}

/// Read one message: consume the reader up to EOF, within the size bound.
pub fn read<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T, Error> {
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0; 256];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if buf.len() + n > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.is_empty() {
        // The remote hung up without saying anything.
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Send one message and half-close the write side, signalling the end of
/// our turn to the remote reader.
pub fn send<T: Serialize>(stream: &TcpStream, msg: &T) -> Result<(), Error> {
    let buf = serialize(msg)?;
    let mut writer = stream;
    writer.write_all(&buf)?;
    stream.shutdown(net::Shutdown::Write)?;
    Ok(())
}

/// Receive one message from the stream.
pub fn recv<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T, Error> {
    read(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::service::message::Request;

    #[test]
    fn test_oversize_message_is_rejected() {
        let request = Request::Propose {
            index: 0,
            message: "x".repeat(MAX_MESSAGE_SIZE),
            sender: "bob".to_owned(),
        };
        assert!(matches!(
            serialize(&request),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn test_oversize_input_is_rejected() {
        let mut input = Cursor::new(vec![b' '; MAX_MESSAGE_SIZE + 1]);
        assert!(matches!(
            read::<Request, _>(&mut input),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn test_read_handles_fragmented_input() {
        // A reader that hands out one byte at a time.
        struct Trickle(Cursor<Vec<u8>>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = 1.min(buf.len());
                self.0.read(&mut buf[..n])
            }
        }

        let request = Request::GetNodes {
            nickname: "bob".to_owned(),
            port: Some(7000),
        };
        let mut input = Trickle(Cursor::new(serialize(&request).unwrap()));
        let decoded: Request = read(&mut input).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn test_empty_input_reads_as_unreachable() {
        let err = read::<Request, _>(&mut Cursor::new(vec![])).unwrap_err();
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_garbage_input_is_invalid() {
        let err = read::<Request, _>(&mut Cursor::new(b"not json".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(!err.is_unreachable());
    }
}
