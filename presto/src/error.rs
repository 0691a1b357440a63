//! Error taxonomy for the client engine.
//!
//! Failures are classified by [`ErrorKind`], not by concrete types: callers
//! and retry rules branch on the kind (and on [`Error::is_unprocessed`])
//! rather than downcasting source chains.

use std::{error, fmt};

use crate::response::AggregatedResponse;
use crate::BoxError;

/// Classification of a client-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The request was never committed to the wire and is safe to retry.
    /// The root cause is carried as the error source.
    Unprocessed,
    /// TCP connect did not complete within `connect_timeout`.
    ConnectTimeout,
    /// No response completed within `response_timeout`, measured from
    /// request end.
    ResponseTimeout,
    /// A single write did not complete within `write_timeout`.
    WriteTimeout,
    /// DNS resolution did not complete in time.
    DnsTimeout,
    /// DNS resolution failed (NXDOMAIN, SERVFAIL, no usable records).
    DnsFailure,
    /// The session was closed before the exchange could complete.
    ClosedSession,
    /// The stream was closed mid-flight.
    ClosedStream,
    /// The server sent GOAWAY and this stream's id was beyond the last
    /// processed stream id.
    GoAwayReceived,
    /// Marker cause used to abort a request stream once its response has
    /// completed.
    ResponseComplete,
    /// The response could not be interpreted as expected; the aggregated
    /// response, if available, is attached.
    InvalidHttpResponse,
    /// Endpoint selection produced no endpoint.
    EmptyEndpointGroup,
    /// The pending-acquisition budget for the pool key was exhausted.
    TooManyPendingAcquisitions,
    /// Rejected by an open circuit breaker without touching the transport.
    FailFast,
    /// The request URI was malformed or incompatible with the client.
    InvalidUri,
    /// A redirect could not be followed: loop detected, cross-host target
    /// not allowed, or an unusable `Location`.
    InvalidRedirect,
    /// A context was used in a scope it does not belong to.
    IllegalState,
    /// The peer violated the wire protocol.
    Protocol,
    /// TLS configuration or handshake failure.
    Tls,
    /// Underlying socket I/O failure.
    Io,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unprocessed => "request was not processed by the server",
            ErrorKind::ConnectTimeout => "connect timed out",
            ErrorKind::ResponseTimeout => "response timed out",
            ErrorKind::WriteTimeout => "write timed out",
            ErrorKind::DnsTimeout => "DNS resolution timed out",
            ErrorKind::DnsFailure => "DNS resolution failed",
            ErrorKind::ClosedSession => "session closed",
            ErrorKind::ClosedStream => "stream closed",
            ErrorKind::GoAwayReceived => "GOAWAY received",
            ErrorKind::ResponseComplete => "response has completed",
            ErrorKind::InvalidHttpResponse => "invalid HTTP response",
            ErrorKind::EmptyEndpointGroup => "no endpoint available",
            ErrorKind::TooManyPendingAcquisitions => "too many pending acquisitions",
            ErrorKind::FailFast => "circuit breaker is open",
            ErrorKind::InvalidUri => "invalid URI",
            ErrorKind::InvalidRedirect => "unfollowable redirect",
            ErrorKind::IllegalState => "illegal state",
            ErrorKind::Protocol => "protocol violation",
            ErrorKind::Tls => "TLS failure",
            ErrorKind::Io => "I/O failure",
        }
    }
}

/// The error type produced by every operation in this crate.
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
    response: Option<Box<AggregatedResponse>>,
}

impl Error {
    /// An error of the given kind with no source.
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            source: None,
            response: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Wraps `cause` as an unprocessed failure: the request never reached
    /// the server and may be retried without risk of duplication.
    pub fn unprocessed(cause: impl Into<BoxError>) -> Self {
        Error::new(ErrorKind::Unprocessed).with(cause)
    }

    /// An `InvalidHttpResponse` carrying the offending aggregated response.
    pub fn invalid_response(response: AggregatedResponse, cause: impl Into<BoxError>) -> Self {
        let mut e = Error::new(ErrorKind::InvalidHttpResponse).with(cause);
        e.response = Some(Box::new(response));
        e
    }

    /// The classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether this failure (or the failure it wraps) is any timeout kind.
    pub fn is_timeout(&self) -> bool {
        match self.kind {
            ErrorKind::ConnectTimeout
            | ErrorKind::ResponseTimeout
            | ErrorKind::WriteTimeout
            | ErrorKind::DnsTimeout => true,
            ErrorKind::Unprocessed => self.wrapped().is_some_and(Error::is_timeout),
            _ => false,
        }
    }

    /// Whether the request is known not to have been committed to the wire.
    pub fn is_unprocessed(&self) -> bool {
        self.kind == ErrorKind::Unprocessed
    }

    /// Retrying is safe when the server observably never processed the
    /// request.
    pub fn is_safe_to_retry(&self) -> bool {
        self.is_unprocessed() || self.kind == ErrorKind::FailFast
    }

    /// The wrapped `Error`, if the source is one (directly or behind a
    /// shared fan-out handle).
    pub fn wrapped(&self) -> Option<&Error> {
        let source = self.source.as_deref()?;
        if let Some(error) = source.downcast_ref::<Error>() {
            return Some(error);
        }
        source.downcast_ref::<SharedSource>().map(|s| &*s.0)
    }

    /// Kind of the wrapped cause, falling back to this error's own kind.
    pub fn root_kind(&self) -> ErrorKind {
        self.wrapped().map(Error::root_kind).unwrap_or(self.kind)
    }

    /// The aggregated response attached to an `InvalidHttpResponse`.
    pub fn response(&self) -> Option<&AggregatedResponse> {
        self.response.as_deref()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.kind);
        if let Some(source) = &self.source {
            d.field("source", source);
        }
        d.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

/// Adapter exposing an `Arc<Error>` as an error source, used wherever one
/// failure has to be delivered to several waiters (cached DNS failures,
/// queued pool acquisitions).
pub(crate) struct SharedSource(pub(crate) std::sync::Arc<Error>);

impl SharedSource {
    /// A fresh `Error` of the same kind delivering the shared cause.
    pub(crate) fn as_error(&self) -> Error {
        Error::new(self.0.kind()).with(SharedSource(self.0.clone()))
    }
}

impl fmt::Debug for SharedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SharedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for SharedSource {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.0)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io).with(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::new(ErrorKind::InvalidUri).with(e)
    }
}

impl From<h2::Error> for Error {
    fn from(e: h2::Error) -> Self {
        if e.is_go_away() || e.reason() == Some(h2::Reason::REFUSED_STREAM) {
            return Error::unprocessed(Error::new(ErrorKind::GoAwayReceived).with(e));
        }
        if e.is_reset() {
            return Error::new(ErrorKind::ClosedStream).with(e);
        }
        if e.is_io() {
            return Error::new(ErrorKind::Io).with(e);
        }
        Error::new(ErrorKind::Protocol).with(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprocessed_wraps_cause() {
        let e = Error::unprocessed(Error::new(ErrorKind::GoAwayReceived));
        assert!(e.is_unprocessed());
        assert!(e.is_safe_to_retry());
        assert_eq!(e.wrapped().unwrap().kind(), ErrorKind::GoAwayReceived);
        assert_eq!(e.root_kind(), ErrorKind::GoAwayReceived);
    }

    #[test]
    fn timeout_classification_reaches_through_unprocessed() {
        let e = Error::unprocessed(Error::new(ErrorKind::ConnectTimeout));
        assert!(e.is_timeout());
        assert!(!Error::new(ErrorKind::ClosedSession).is_timeout());
    }

    #[test]
    fn goaway_from_h2_is_unprocessed() {
        let e: Error = h2::Error::from(h2::Reason::NO_ERROR).into();
        // A reason-only error is not a GOAWAY; only wire-level GOAWAYs are.
        assert_ne!(e.kind(), ErrorKind::Unprocessed);
    }
}
