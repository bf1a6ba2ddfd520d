//! Error taxonomy of the connector.
//!
//! Protocol problems never escape as panics or out-of-band errors to the
//! application: every variant maps onto a connector status that ends up on
//! the affected [`Response`](crate::http::response::Response).

use std::io;

use thiserror::Error;

use crate::http::response::StatusCode;

/// Malformed bytes on the wire. Local to one way, fatal for its connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("start line ended before all of its tokens were read: {0:?}")]
    ShortStartLine(String),
    #[error("invalid HTTP version: {0:?}")]
    InvalidVersion(String),
    #[error("invalid status code: {0:?}")]
    InvalidStatus(String),
    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),
    #[error("invalid content length: {0:?}")]
    InvalidContentLength(String),
    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),
    #[error("missing CRLF after chunk data")]
    MissingChunkDelimiter,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("unsupported transfer coding: {0:?}")]
    UnsupportedCoding(String),
    #[error("response received while no request is outstanding")]
    UnexpectedMessage,
}

/// Everything that can go wrong while moving messages through a connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("unable to connect: {0}")]
    Connect(#[source] io::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("connection idle for more than {0} ms")]
    Timeout(u64),

    #[error("unable to find a connection to send the request")]
    NoConnectionAvailable,

    #[error("unable to resolve the target of the request: {0}")]
    InvalidTarget(String),

    #[error("connector is stopped")]
    Stopped,
}

impl ConnectorError {
    /// Connector status reported on the responses this error affects.
    pub fn status(&self) -> StatusCode {
        match self {
            ConnectorError::Connect(_) => StatusCode::CONNECTOR_ERROR_CONNECTION,
            ConnectorError::Framing(_)
            | ConnectorError::Io(_)
            | ConnectorError::NoConnectionAvailable
            | ConnectorError::InvalidTarget(_) => StatusCode::CONNECTOR_ERROR_COMMUNICATION,
            ConnectorError::Timeout(_) | ConnectorError::Stopped => {
                StatusCode::CONNECTOR_ERROR_INTERNAL
            }
        }
    }
}

/// Extracts a framing error smuggled through an `io::Error` by the entity
/// decoders, which speak `std::io::Read`.
pub fn framing_from_io(err: &io::Error) -> Option<FramingError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<FramingError>())
        .cloned()
}

impl From<FramingError> for io::Error {
    fn from(err: FramingError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_survive_io_round_trip() {
        let io_err: io::Error = FramingError::InvalidChunkSize("zz".into()).into();
        assert_eq!(
            framing_from_io(&io_err),
            Some(FramingError::InvalidChunkSize("zz".into()))
        );
    }

    #[test]
    fn statuses_follow_error_class() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(
            ConnectorError::Connect(refused).status(),
            StatusCode::CONNECTOR_ERROR_CONNECTION
        );
        assert_eq!(
            ConnectorError::from(FramingError::UnexpectedMessage).status(),
            StatusCode::CONNECTOR_ERROR_COMMUNICATION
        );
        assert_eq!(
            ConnectorError::Timeout(10).status(),
            StatusCode::CONNECTOR_ERROR_INTERNAL
        );
    }
}
