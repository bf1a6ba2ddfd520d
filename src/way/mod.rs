//! Per-direction message state machines.
//!
//! Every connection owns one [`InboundWay`] and one [`OutboundWay`]. Both
//! walk the same message states:
//!
//! ```text
//!   IDLE ──► START ──► HEADERS ──┬──► BODY ──► END ──► IDLE
//!                                └──────────────────► END
//! ```
//!
//! What differs between a client and a server (which start line is read or
//! written, which headers the connector adds, how an incoming entity is
//! framed) is delegated to a [`Role`] strategy shared by both ways.

pub mod inbound;
pub mod outbound;
pub mod role;

use std::fmt;

use bytes::BytesMut;

use crate::error::FramingError;
use crate::http::entity::Entity;
use crate::http::headers::Headers;
use crate::http::message::{MessageHead, StartLine};
use crate::http::parser::parse_content_length;
use crate::http::request::{Method, Version};

pub use inbound::InboundWay;
pub use outbound::OutboundWay;
pub use role::{ClientRole, ServerRole};

/// I/O state of a way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// Nothing to do, or unable to progress until someone else acts
    Idle,
    /// Waiting for socket readiness
    Interest,
    /// Moving bytes right now
    Processing,
    /// Able to progress without a new readiness event
    Ready,
    Canceling,
    Cancelled,
}

/// Progress of the message a way is reading or writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Idle,
    Start,
    Headers,
    Body,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// How an entity is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    None,
    Sized(u64),
    Chunked,
    /// Delimited by the sender closing the connection
    UntilEof,
}

/// Role-specific capabilities of the ways of a connection.
pub trait Role: Send + Sync + fmt::Debug {
    fn side(&self) -> Side;

    /// Parses the start line of an incoming message.
    fn read_start_line(&self, line: &str) -> Result<StartLine, FramingError>;

    /// Serializes the start line of an outgoing message.
    fn write_start_line(&self, head: &MessageHead, out: &mut BytesMut) {
        crate::http::writer::write_start_line(&head.start, out);
    }

    /// Adds the headers specific to the kind of message this role sends.
    fn add_headers(&self, message: &OutboundMessage, headers: &mut Headers);

    /// Decides how the entity of an incoming message is framed.
    /// `request_method` is the method of the request a response answers.
    fn inbound_framing(
        &self,
        head: &MessageHead,
        request_method: Option<&Method>,
    ) -> Result<Framing, FramingError>;
}

/// A message queued on an outbound way.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Exchange this message belongs to
    pub id: u64,
    pub head: MessageHead,
    pub entity: Entity,
    /// Method of the request (the one answered, for responses)
    pub method: Method,
    /// Protocol version of the peer, when known
    pub peer_version: Version,
    /// `host[:port]` for the `Host` header of client requests
    pub authority: Option<String>,
    /// The connection closes once this message is written
    pub close: bool,
}

impl OutboundMessage {
    pub fn is_informational(&self) -> bool {
        self.head.is_informational()
    }
}

/// Framing shared by requests and responses: chunked coding wins over a
/// declared length. An `identity` coding leaves the length in charge.
pub(crate) fn declared_framing(headers: &Headers) -> Result<Option<Framing>, FramingError> {
    if let Some(coding) = headers.get_all("Transfer-Encoding").last() {
        let last = coding.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(Some(Framing::Chunked));
        }
        if !last.eq_ignore_ascii_case("identity") {
            return Err(FramingError::UnsupportedCoding(last.to_string()));
        }
    }
    match headers.get("Content-Length") {
        Some(value) => Ok(Some(match parse_content_length(value)? {
            0 => Framing::None,
            n => Framing::Sized(n),
        })),
        None => Ok(None),
    }
}

/// How the entity of an outgoing message goes on the wire, and what the
/// header section announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BodyPlan {
    pub framing: Framing,
    /// `Content-Length` to announce
    pub length: Option<u64>,
    /// Whether entity bytes follow the header section
    pub send: bool,
}

pub(crate) fn plan_body(side: Side, message: &OutboundMessage) -> BodyPlan {
    let size = message.entity.size();
    match side {
        Side::Server => {
            let status = message.head.start.status();
            if status.is_some_and(|s| s.forbids_entity()) {
                return BodyPlan {
                    framing: Framing::None,
                    length: None,
                    send: false,
                };
            }
            if message.method == Method::HEAD {
                return BodyPlan {
                    framing: Framing::None,
                    length: size,
                    send: false,
                };
            }
            match size {
                Some(n) => BodyPlan {
                    framing: if n == 0 { Framing::None } else { Framing::Sized(n) },
                    length: Some(n),
                    send: n > 0,
                },
                None if message.peer_version.persistent_by_default() => BodyPlan {
                    framing: Framing::Chunked,
                    length: None,
                    send: true,
                },
                None => BodyPlan {
                    framing: Framing::UntilEof,
                    length: None,
                    send: true,
                },
            }
        }
        Side::Client => match size {
            Some(0) => BodyPlan {
                framing: Framing::None,
                length: matches!(message.method, Method::POST | Method::PUT | Method::PATCH)
                    .then_some(0),
                send: false,
            },
            Some(n) => BodyPlan {
                framing: Framing::Sized(n),
                length: Some(n),
                send: true,
            },
            None => BodyPlan {
                framing: Framing::Chunked,
                length: None,
                send: true,
            },
        },
    }
}

/// Builds the header section of an outgoing message: general headers
/// first, then the role's message headers and the application's own, and
/// entity headers last.
pub(crate) fn compose_headers(
    role: &dyn Role,
    message: &OutboundMessage,
    persistent: bool,
    plan: &BodyPlan,
) -> Headers {
    let mut headers = Headers::new();
    let own = &message.head.headers;

    if !persistent || message.close || plan.framing == Framing::UntilEof {
        headers.set("Connection", "close");
    } else if !message.peer_version.persistent_by_default() {
        headers.set("Connection", "keep-alive");
    }
    if role.side() == Side::Server && !own.contains("Date") {
        headers.set(
            "Date",
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
    }
    if plan.framing == Framing::Chunked {
        headers.set("Transfer-Encoding", "chunked");
    }

    role.add_headers(message, &mut headers);

    let is_entity_header = |name: &str| {
        name.len() > 8 && name.get(..8).is_some_and(|p| p.eq_ignore_ascii_case("content-"))
    };
    let is_framing_header = |name: &str| {
        ["Connection", "Transfer-Encoding", "Content-Length"]
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
    };

    for (name, value) in own.iter() {
        if !is_framing_header(name) && !is_entity_header(name) {
            headers.add(name, value);
        }
    }
    for (name, value) in own.iter() {
        if !is_framing_header(name) && is_entity_header(name) {
            headers.add(name, value);
        }
    }
    if let Some(length) = plan.length {
        headers.set("Content-Length", length.to_string());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::StatusCode;

    fn response(status: StatusCode, entity: Entity, method: Method) -> OutboundMessage {
        OutboundMessage {
            id: 1,
            head: MessageHead::new(StartLine::Status {
                version: Version::HTTP_11,
                status,
                reason: status.reason_phrase().to_string(),
            }),
            entity,
            method,
            peer_version: Version::HTTP_11,
            authority: None,
            close: false,
        }
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let headers: Headers = [("Content-Length", "10"), ("Transfer-Encoding", "gzip, chunked")]
            .into_iter()
            .collect();
        assert_eq!(declared_framing(&headers), Ok(Some(Framing::Chunked)));
    }

    #[test]
    fn identity_coding_keeps_the_declared_length() {
        let headers: Headers = [("Transfer-Encoding", "identity"), ("Content-Length", "5")]
            .into_iter()
            .collect();
        assert_eq!(declared_framing(&headers), Ok(Some(Framing::Sized(5))));

        let bare: Headers = [("Transfer-Encoding", "identity")].into_iter().collect();
        assert_eq!(declared_framing(&bare), Ok(None));
    }

    #[test]
    fn unknown_coding_is_rejected() {
        let headers: Headers = [("Transfer-Encoding", "gzip")].into_iter().collect();
        assert!(declared_framing(&headers).is_err());
    }

    #[test]
    fn head_response_announces_length_without_body() {
        let message = response(StatusCode::OK, Entity::from_static(b"hello"), Method::HEAD);
        let plan = plan_body(Side::Server, &message);
        assert_eq!(plan.length, Some(5));
        assert!(!plan.send);
    }

    #[test]
    fn not_modified_drops_the_entity() {
        let message = response(StatusCode::NOT_MODIFIED, Entity::from_static(b"x"), Method::GET);
        let plan = plan_body(Side::Server, &message);
        assert_eq!(plan.framing, Framing::None);
        assert_eq!(plan.length, None);
    }

    #[test]
    fn unknown_size_is_chunked_for_http_11_peers() {
        let message = response(
            StatusCode::OK,
            Entity::stream(std::io::empty(), None),
            Method::GET,
        );
        assert_eq!(plan_body(Side::Server, &message).framing, Framing::Chunked);
    }

    #[test]
    fn entity_headers_come_last() {
        let mut message = response(StatusCode::OK, Entity::from_static(b"hi"), Method::GET);
        message.head.headers.add("Content-Type", "text/plain");
        message.head.headers.add("Cache-Control", "no-cache");
        let plan = plan_body(Side::Server, &message);
        let headers = compose_headers(&ServerRole::default(), &message, false, &plan);
        let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();

        assert_eq!(names.first(), Some(&"Connection"));
        assert_eq!(&names[names.len() - 2..], &["Content-Type", "Content-Length"]);
        assert!(names.contains(&"Date"));
        assert!(names.contains(&"Cache-Control"));
    }
}
