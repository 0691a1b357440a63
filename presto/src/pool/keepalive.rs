//! Per-session keep-alive management.
//!
//! One task per session owns the idle timeout, the max-age deadline, the
//! PING schedule and the outlier update interval. HTTP/2 sessions PING via
//! the connection's ping/pong handle; HTTP/1.1 sessions may probe with a
//! real request against a configured path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::body::Body;
use crate::context::RequestLog;
use crate::error::{Error, ErrorKind};
use crate::event::{CloseHint, ConnectionPoolListener};
use crate::session::{h1, Session};

#[derive(Debug, Clone, Default)]
pub(crate) struct KeepAliveConfig {
    pub idle_timeout: Option<Duration>,
    pub ping_interval: Option<Duration>,
    pub max_connection_age: Option<Duration>,
    /// For HTTP/2: how long to wait for the server preface before giving
    /// the session up.
    pub preface_timeout: Option<Duration>,
}

pub(crate) enum Pinger {
    H2(h2::PingPong),
    /// Pings by issuing a real request on the serial session.
    H1 {
        tx: mpsc::Sender<h1::Exchange>,
        authority: String,
        path: String,
    },
}

pub(crate) fn spawn(
    session: Arc<Session>,
    config: KeepAliveConfig,
    pinger: Option<Pinger>,
    listener: Option<Arc<dyn ConnectionPoolListener>>,
) {
    tokio::spawn(run(session, config, pinger, listener));
}

async fn run(
    session: Arc<Session>,
    config: KeepAliveConfig,
    mut pinger: Option<Pinger>,
    listener: Option<Arc<dyn ConnectionPoolListener>>,
) {
    let mut closed = session.closed_signal();
    if *closed.borrow() {
        return;
    }

    // An H2 session is not trusted with more than one stream until the
    // server's SETTINGS round-trips; probe it with an immediate PING.
    if session.protocol().is_multiplex() {
        if let Some(Pinger::H2(ping_pong)) = pinger.as_mut() {
            let timeout = config
                .preface_timeout
                .unwrap_or(Duration::from_secs(15));
            if !ping(&session, ping_pong, timeout, listener.as_deref()).await {
                session.close(CloseHint::Abnormal);
                return;
            }
            session.mark_settings_acked();
        }
    }

    let mut last_ping = Instant::now();
    let mut last_outlier_check = Instant::now();
    let outlier_interval = session.outlier.as_ref().map(|d| d.update_interval());

    loop {
        #[derive(Clone, Copy, PartialEq)]
        enum Due {
            Idle,
            MaxAge,
            Ping,
            Outlier,
        }

        let mut next: Option<(Instant, Due)> = None;
        let mut consider = |at: Instant, what: Due| match next {
            Some((t, _)) if t <= at => {}
            _ => next = Some((at, what)),
        };

        if let Some(max_age) = config.max_connection_age {
            consider(session.opened_at() + max_age, Due::MaxAge);
        }
        if let Some(idle) = config.idle_timeout {
            if session.unfinished_streams() == 0 {
                consider(session.last_activity() + idle, Due::Idle);
            }
        }
        if pinger.is_some() {
            if let Some(interval) = config.ping_interval {
                consider(last_ping + interval, Due::Ping);
            }
        }
        if let Some(interval) = outlier_interval {
            consider(last_outlier_check + interval, Due::Outlier);
        }

        let due = tokio::select! {
            _ = closed.changed() => return,
            _ = session.activity.notified() => continue,
            due = sleep_for(next) => due,
        };

        match due {
            Due::MaxAge => {
                session.drain(CloseHint::MaxConnectionAge);
                return;
            }
            Due::Idle => {
                let idle = config.idle_timeout.unwrap_or_default();
                let idle_for = Instant::now().saturating_duration_since(session.last_activity());
                if session.unfinished_streams() == 0 && idle_for >= idle {
                    session.close(CloseHint::ConnectionIdle);
                    return;
                }
            }
            Due::Ping => {
                let interval = config.ping_interval.unwrap_or_default();
                last_ping = Instant::now();
                let acked = match pinger.as_mut() {
                    Some(Pinger::H2(ping_pong)) => {
                        ping(&session, ping_pong, interval, listener.as_deref()).await
                    }
                    Some(Pinger::H1 {
                        tx,
                        authority,
                        path,
                    }) => h1_ping(&session, tx, authority, path, interval, listener.as_deref())
                        .await,
                    None => true,
                };
                if !acked {
                    session.close(CloseHint::PingTimeout);
                    return;
                }
            }
            Due::Outlier => {
                last_outlier_check = Instant::now();
                if let Some(detector) = session.outlier.as_ref() {
                    if detector.exceeded() {
                        session.drain(CloseHint::Abnormal);
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_for<T: Copy>(deadline: Option<(Instant, T)>) -> T {
    match deadline {
        Some((at, what)) => {
            tokio::time::sleep_until(at).await;
            what
        }
        None => std::future::pending().await,
    }
}

/// Sends one PING, waiting up to `timeout` for the acknowledgement.
async fn ping(
    session: &Arc<Session>,
    ping_pong: &mut h2::PingPong,
    timeout: Duration,
    listener: Option<&dyn ConnectionPoolListener>,
) -> bool {
    let id = session.next_ping_id();
    if let Some(listener) = listener {
        listener.ping_sent(session.info(), id);
    }
    match tokio::time::timeout(timeout, ping_pong.ping(h2::Ping::opaque())).await {
        Ok(Ok(_)) => {
            session.touch();
            if let Some(listener) = listener {
                listener.ping_acknowledged(session.info(), id);
            }
            true
        }
        _ => false,
    }
}

async fn h1_ping(
    session: &Arc<Session>,
    tx: &mpsc::Sender<h1::Exchange>,
    authority: &str,
    path: &str,
    timeout: Duration,
    listener: Option<&dyn ConnectionPoolListener>,
) -> bool {
    let id = session.next_ping_id();
    if let Some(listener) = listener {
        listener.ping_sent(session.info(), id);
    }

    let uri = format!("{}://{}{}", session.protocol().scheme(), authority, path);
    let Ok(request) = http::Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .body(Body::empty())
    else {
        return false;
    };
    let (respond, response) = tokio::sync::oneshot::channel();
    let exchange = h1::Exchange {
        request,
        write_timeout: Some(timeout),
        log: RequestLog::new(),
        respond,
    };
    if tx.send(exchange).await.is_err() {
        return false;
    }

    let acked = async {
        let response = response
            .await
            .map_err(|_| Error::new(ErrorKind::ClosedSession))??;
        // Drain whatever the server answered with.
        let _ = response.into_body().collect_bytes(None).await;
        Ok::<_, Error>(())
    };
    match tokio::time::timeout(timeout, acked).await {
        Ok(Ok(())) => {
            session.touch();
            if let Some(listener) = listener {
                listener.ping_acknowledged(session.info(), id);
            }
            true
        }
        _ => false,
    }
}

