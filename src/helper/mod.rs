//! Connector helpers: the application-facing half of a connector.
//!
//! A helper owns the queues shared with application threads and decides
//! which connection carries which message. The reactor thread calls it
//! through the [`Helper`](crate::reactor::Helper) trait; application
//! threads only ever touch lock-free queues and the controller's waker.

pub mod client;
pub mod server;

use std::io::{self, Read};

use tokio::runtime::Handle;

use crate::http::entity::Entity;
use crate::http::message::{MessageHead, StartLine};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::io::channel::{EntityPipe, EntityReader, entity_pipe};

/// Largest slice read from an application stream at once.
const STREAM_CHUNK: usize = 8 * 1024;

pub use client::ClientConnector;
pub use server::{Handler, Server};

/// Builds the response handed to a client caller from a received head.
pub(crate) fn response_from_head(head: MessageHead, entity: Option<EntityReader>) -> Response {
    let (version, status, reason) = match head.start {
        StartLine::Status {
            version,
            status,
            reason,
        } => (version, status, reason),
        // Never produced by the client role
        StartLine::Request { version, .. } => (version, StatusCode::OK, String::new()),
    };
    Response {
        reason: (!reason.is_empty() && reason != status.reason_phrase()).then_some(reason),
        status,
        version,
        headers: head.headers,
        entity: entity.map_or(Entity::Empty, Entity::Inbound),
        description: None,
    }
}

/// Builds the request handed to a server handler from a received head.
pub(crate) fn request_from_head(head: MessageHead, entity: Option<EntityReader>) -> Request {
    let (method, target, version) = match head.start {
        StartLine::Request {
            method,
            target,
            version,
        } => (method, target, version),
        // Never produced by the server role
        StartLine::Status { version, .. } => (Method::GET, String::from("/"), version),
    };
    Request {
        method,
        target,
        url: None,
        version,
        headers: head.headers,
        entity: entity.map_or(Entity::Empty, Entity::Inbound),
    }
}

/// Moves an application stream off the reactor: a blocking task on
/// `runtime` pulls the reader into a bounded pipe the outbound way polls.
/// Other entities come back untouched.
pub(crate) fn detach_stream(entity: Entity, runtime: &Handle, capacity: usize) -> Entity {
    let Entity::Stream { reader, size } = entity else {
        return entity;
    };
    let (pipe, pipe_reader) = entity_pipe(capacity, size, None);
    runtime.spawn_blocking(move || pump(reader, &pipe));
    Entity::Inbound(pipe_reader)
}

fn pump(mut reader: Box<dyn Read + Send>, pipe: &EntityPipe) {
    let mut chunk = vec![0u8; STREAM_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => {
                pipe.finish(None);
                return;
            }
            Ok(n) => {
                if !pipe.write_all(&chunk[..n]) {
                    tracing::debug!("Streamed entity abandoned by the connection");
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(error = %e, "Streamed entity failed");
                pipe.fail(e.to_string());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::Headers;
    use crate::http::request::Version;

    #[test]
    fn detached_stream_is_pumped_into_a_pipe() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let source: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let entity = Entity::stream(io::Cursor::new(source.clone()), Some(40_000));

        let detached = detach_stream(entity, runtime.handle(), 1024);
        assert_eq!(detached.size(), Some(40_000));
        let Entity::Inbound(mut reader) = detached else {
            panic!("stream was not detached");
        };
        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, source);
    }

    #[test]
    fn detaching_keeps_other_entities() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let kept = detach_stream(Entity::from_static(b"abc"), runtime.handle(), 1024);
        assert!(matches!(kept, Entity::Bytes(ref b) if &b[..] == b"abc"));
    }

    #[test]
    fn standard_reason_is_not_kept() {
        let head = MessageHead {
            start: StartLine::Status {
                version: Version::HTTP_11,
                status: StatusCode::NOT_FOUND,
                reason: "Not Found".into(),
            },
            headers: Headers::new(),
        };
        let response = response_from_head(head, None);
        assert_eq!(response.reason, None);
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(response.entity.is_empty());
    }

    #[test]
    fn custom_reason_survives() {
        let head = MessageHead::new(StartLine::Status {
            version: Version::HTTP_10,
            status: StatusCode::OK,
            reason: "Fine".into(),
        });
        assert_eq!(response_from_head(head, None).reason_phrase(), "Fine");
    }
}
