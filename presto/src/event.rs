//! Connection and request lifecycle callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::context::{LogProperty, RequestLog};
use crate::error::Error;
use crate::session::SessionProtocol;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseHint {
    ConnectionIdle,
    PingTimeout,
    MaxConnectionAge,
    GoAway,
    Abnormal,
    Unknown,
}

/// Identity of one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub protocol: SessionProtocol,
    pub authority: String,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Connection lifecycle callbacks. All methods default to no-ops so
/// implementations override only what they observe.
pub trait ConnectionEventListener: Send + Sync + 'static {
    /// A connect attempt has started.
    fn connection_pending(&self, _protocol: SessionProtocol, _authority: &str) {}

    /// The transport connection is established (TCP + TLS where
    /// applicable).
    fn connection_opened(&self, _info: &ConnectionInfo) {}

    /// The session finished its preface/upgrade and can serve requests.
    fn connection_active(&self, _info: &ConnectionInfo) {}

    /// The session has no unfinished streams.
    fn connection_idle(&self, _info: &ConnectionInfo) {}

    /// A connect attempt failed before the session became active.
    fn connection_failed(&self, _protocol: SessionProtocol, _authority: &str, _cause: &Error) {}

    fn connection_closed(&self, _info: &ConnectionInfo, _hint: CloseHint) {}
}

/// PING observability for pooled connections.
///
/// For every session the acknowledged ids are a subset of the sent ids, and
/// ids increase monotonically.
pub trait ConnectionPoolListener: Send + Sync + 'static {
    fn ping_sent(&self, _info: &ConnectionInfo, _id: u64) {}
    fn ping_acknowledged(&self, _info: &ConnectionInfo, _id: u64) {}
}

/// Per-property request log callbacks, attached to every request a client
/// issues.
pub trait RequestLogListener: Send + Sync + 'static {
    fn on_request_log(&self, property: LogProperty, log: &RequestLog);
}

pub(crate) fn attach_log_listener(log: &RequestLog, listener: Arc<dyn RequestLogListener>) {
    for property in [
        LogProperty::RequestHeaders,
        LogProperty::RequestFirstBytes,
        LogProperty::RequestEnd,
        LogProperty::ResponseHeaders,
        LogProperty::ResponseFirstBytes,
        LogProperty::ResponseEnd,
        LogProperty::Session,
    ] {
        let listener = listener.clone();
        log.on(property, move |log| listener.on_request_log(property, log));
    }
}

/// Default listener: emits structured tracing events.
pub struct LoggingConnectionEventListener;

impl ConnectionEventListener for LoggingConnectionEventListener {
    fn connection_pending(&self, protocol: SessionProtocol, authority: &str) {
        tracing::debug!(%protocol, authority, "connection pending");
    }

    fn connection_opened(&self, info: &ConnectionInfo) {
        tracing::debug!(
            protocol = %info.protocol,
            authority = %info.authority,
            remote = %info.remote_addr,
            "connection opened"
        );
    }

    fn connection_active(&self, info: &ConnectionInfo) {
        tracing::debug!(
            protocol = %info.protocol,
            authority = %info.authority,
            remote = %info.remote_addr,
            "connection active"
        );
    }

    fn connection_idle(&self, info: &ConnectionInfo) {
        tracing::trace!(authority = %info.authority, remote = %info.remote_addr, "connection idle");
    }

    fn connection_failed(&self, protocol: SessionProtocol, authority: &str, cause: &Error) {
        tracing::debug!(%protocol, authority, %cause, "connection failed");
    }

    fn connection_closed(&self, info: &ConnectionInfo, hint: CloseHint) {
        tracing::debug!(
            protocol = %info.protocol,
            authority = %info.authority,
            remote = %info.remote_addr,
            ?hint,
            "connection closed"
        );
    }
}
