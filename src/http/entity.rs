use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;

use crate::io::channel::EntityReader;

/// The body of a message.
///
/// Outgoing entities are pulled by the outbound way as the socket accepts
/// bytes. A `Stream` is never read on the reactor thread: the connector
/// moves it into a pipe fed from its worker pool first. Incoming entities
/// are [`EntityReader`]s fed by the inbound way while the application reads
/// them, and may be sent on as they are.
pub enum Entity {
    Empty,
    Bytes(Bytes),
    /// A streamed entity; `size: None` is sent with chunked coding
    Stream {
        reader: Box<dyn Read + Send>,
        size: Option<u64>,
    },
    Inbound(EntityReader),
}

impl Entity {
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Entity::Bytes(Bytes::from_static(bytes))
    }

    pub fn stream(reader: impl Read + Send + 'static, size: Option<u64>) -> Self {
        Entity::Stream {
            reader: Box::new(reader),
            size,
        }
    }

    /// Number of bytes, when known up front.
    pub fn size(&self) -> Option<u64> {
        match self {
            Entity::Empty => Some(0),
            Entity::Bytes(b) => Some(b.len() as u64),
            Entity::Stream { size, .. } => *size,
            Entity::Inbound(reader) => reader.size(),
        }
    }

    /// Whether there is nothing to send or read.
    pub fn is_empty(&self) -> bool {
        self.size() == Some(0)
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            Entity::Empty => Box::new(io::empty()),
            Entity::Bytes(b) => Box::new(io::Cursor::new(b)),
            Entity::Stream { reader, .. } => reader,
            Entity::Inbound(reader) => Box::new(reader),
        }
    }

    /// Reads the whole entity in memory, blocking on incoming entities until
    /// the peer finished sending.
    pub fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Entity::Empty => Ok(Bytes::new()),
            Entity::Bytes(b) => Ok(b),
            other => {
                let mut out = Vec::new();
                other.into_reader().read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
        }
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::Empty
    }
}

impl From<Bytes> for Entity {
    fn from(bytes: Bytes) -> Self {
        Entity::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Entity {
    fn from(bytes: Vec<u8>) -> Self {
        Entity::Bytes(Bytes::from(bytes))
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Empty => f.write_str("Empty"),
            Entity::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Entity::Stream { size, .. } => f.debug_struct("Stream").field("size", size).finish(),
            Entity::Inbound(reader) => f
                .debug_struct("Inbound")
                .field("size", &reader.size())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_without_size_is_unknown() {
        let entity = Entity::stream(io::Cursor::new(vec![1, 2, 3]), None);
        assert_eq!(entity.size(), None);
        assert_eq!(entity.into_bytes().unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn empty_entity_has_zero_size() {
        assert!(Entity::Empty.is_empty());
        assert!(!Entity::from_static(b"x").is_empty());
    }
}
