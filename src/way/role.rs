use crate::error::FramingError;
use crate::http::headers::Headers;
use crate::http::message::{MessageHead, StartLine};
use crate::http::parser::{parse_request_line, parse_status_line};
use crate::http::request::{Method, wants_close};
use crate::way::{Framing, OutboundMessage, Role, Side, declared_framing};

/// Ways of a client connection: writes requests, reads responses.
#[derive(Debug, Clone)]
pub struct ClientRole {
    user_agent: String,
}

impl ClientRole {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl Default for ClientRole {
    fn default() -> Self {
        Self::new(concat!("nioway/", env!("CARGO_PKG_VERSION")))
    }
}

impl Role for ClientRole {
    fn side(&self) -> Side {
        Side::Client
    }

    fn read_start_line(&self, line: &str) -> Result<StartLine, FramingError> {
        parse_status_line(line)
    }

    fn add_headers(&self, message: &OutboundMessage, headers: &mut Headers) {
        let own = &message.head.headers;
        if !own.contains("Host") {
            if let Some(authority) = &message.authority {
                headers.set("Host", authority.as_str());
            }
        }
        if !own.contains("User-Agent") && !self.user_agent.is_empty() {
            headers.set("User-Agent", self.user_agent.as_str());
        }
    }

    fn inbound_framing(
        &self,
        head: &MessageHead,
        request_method: Option<&Method>,
    ) -> Result<Framing, FramingError> {
        let method = request_method.ok_or(FramingError::UnexpectedMessage)?;
        let status = head.start.status().ok_or(FramingError::UnexpectedMessage)?;

        if *method == Method::HEAD || status.forbids_entity() {
            return Ok(Framing::None);
        }
        if *method == Method::CONNECT && (200..300).contains(&status.as_u16()) {
            return Ok(Framing::None);
        }
        if let Some(framing) = declared_framing(&head.headers)? {
            return Ok(framing);
        }
        if wants_close(head.start.version(), &head.headers) {
            Ok(Framing::UntilEof)
        } else {
            Ok(Framing::None)
        }
    }
}

/// Ways of a server connection: reads requests, writes responses.
#[derive(Debug, Clone)]
pub struct ServerRole {
    server_name: String,
}

impl ServerRole {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

impl Default for ServerRole {
    fn default() -> Self {
        Self::new(concat!("nioway/", env!("CARGO_PKG_VERSION")))
    }
}

impl Role for ServerRole {
    fn side(&self) -> Side {
        Side::Server
    }

    fn read_start_line(&self, line: &str) -> Result<StartLine, FramingError> {
        parse_request_line(line)
    }

    fn add_headers(&self, message: &OutboundMessage, headers: &mut Headers) {
        if !message.head.headers.contains("Server") && !self.server_name.is_empty() {
            headers.set("Server", self.server_name.as_str());
        }
    }

    /// Requests carry an entity only when they declare one; reading until
    /// EOF would leave no way to send the response.
    fn inbound_framing(
        &self,
        head: &MessageHead,
        _request_method: Option<&Method>,
    ) -> Result<Framing, FramingError> {
        Ok(declared_framing(&head.headers)?.unwrap_or(Framing::None))
    }
}
