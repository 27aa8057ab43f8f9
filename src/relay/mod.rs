//! Bidirectional relay with accounting.
//!
//! # Responsibilities
//! - Move bytes both ways between the downstream client and one upstream
//! - Enforce the connect/idle timeouts on the upstream side
//! - Fire delayed penalties exactly once, on the first upstream byte
//! - Surface a zero-payload ending as a fallback signal
//!
//! # Design Decisions
//! - The two copy loops are concurrent futures joined by the session task;
//!   dropping a loop (socket close) is its cancellation signal
//! - U→D read size grows while the client stays quiet and snaps back to one
//!   buffer on any client activity, favoring bulk downloads without hurting
//!   request/response traffic
//! - Known peer-close error kinds end a loop normally instead of erroring

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::TimeoutConfig;
use crate::gateway::session::{Penalty, Session, SessionError};
use crate::observability::stat::TrafficCounter;

const MAX_MULTIPLIER: usize = 16;
/// Google push service; long-lived and quiet by design, never idled out.
const GOOGLE_PUSH_PORT: u16 = 5228;

/// Transform applied to one direction of the byte stream.
pub type Codec = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

pub struct RelayOptions {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub bufsize: usize,
    pub encrypt: Option<Codec>,
    pub decrypt: Option<Codec>,
    /// Applied to the session only if this attempt ends with zero payload.
    pub delayed_penalty: Option<Penalty>,
    pub on_forward_started: Option<Box<dyn FnOnce() + Send>>,
}

impl RelayOptions {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            connect_timeout: timeouts.connect(),
            idle_timeout: timeouts.idle(),
            bufsize: 8192,
            encrypt: None,
            decrypt: None,
            delayed_penalty: None,
            on_forward_started: None,
        }
    }
}

/// How the relay ended.
pub enum RelayEnd {
    Completed,
    /// The upstream closed (or never answered) before any byte reached the
    /// client. Carries the penalty to defer onto the session.
    NoPayload { delayed_penalty: Option<Penalty> },
}

/// Errors the peer may legitimately close a socket with mid-transfer.
fn is_benign_close(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

/// Relay the session over `upstream` until the upstream side ends.
///
/// On return both copy loops have stopped and the upstream socket is
/// closed; the downstream socket stays with the session.
pub async fn forward(
    session: &mut Session,
    mut upstream: TcpStream,
    counter: Arc<TrafficCounter>,
    mut opts: RelayOptions,
) -> Result<RelayEnd, SessionError> {
    let infinite_idle = session.dst_port == GOOGLE_PUSH_PORT;
    let bufsize = opts.bufsize;
    let connect_timeout = opts.connect_timeout;
    let idle_timeout = opts.idle_timeout;

    let started = AtomicBool::new(session.forward_started);
    let multiplier = AtomicUsize::new(1);

    let mut decrypt = opts.decrypt.take();
    let mut encrypt = opts.encrypt.take();
    let mut on_started = opts.on_forward_started.take();

    let Session {
        downstream,
        forward_started,
        delayed_penalties,
        ..
    } = session;
    let (mut down_r, mut down_w) = downstream.split();
    let (mut up_r, mut up_w) = upstream.split();

    let counter_u2d = counter.clone();
    let counter_d2u = counter.clone();

    let u2d = async {
        let mut buf = vec![0u8; bufsize * MAX_MULTIPLIER];
        loop {
            let want = bufsize * multiplier.load(Ordering::Relaxed).min(MAX_MULTIPLIER);
            let deadline = if !started.load(Ordering::Relaxed) {
                Some(connect_timeout)
            } else if infinite_idle {
                None
            } else {
                Some(idle_timeout)
            };

            let read = match deadline {
                Some(d) => match tokio::time::timeout(d, up_r.read(&mut buf[..want])).await {
                    Ok(r) => r,
                    Err(_) if started.load(Ordering::Relaxed) => {
                        return Err(SessionError::IdleTimeout)
                    }
                    // No response inside the connect window: same as a
                    // silent upstream close, the zero-payload path decides.
                    Err(_) => return Ok(()),
                },
                None => up_r.read(&mut buf[..want]).await,
            };

            let n = match read {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if is_benign_close(&e) => return Ok(()),
                Err(e) => return Err(SessionError::Io(e)),
            };

            counter_u2d.received(n);
            let m = multiplier.load(Ordering::Relaxed);
            if m < MAX_MULTIPLIER {
                multiplier.store(m + 1, Ordering::Relaxed);
            }

            if !started.swap(true, Ordering::Relaxed) {
                for penalty in delayed_penalties.drain(..) {
                    penalty();
                }
                if let Some(cb) = on_started.take() {
                    cb();
                }
            }

            let data: Cow<'_, [u8]> = match &mut decrypt {
                Some(f) => Cow::Owned(f(&buf[..n])),
                None => Cow::Borrowed(&buf[..n]),
            };
            if let Err(e) = down_w.write_all(&data).await {
                if is_benign_close(&e) {
                    return Ok(());
                }
                return Err(SessionError::Io(e));
            }
        }
    };

    let d2u = async {
        let mut buf = vec![0u8; bufsize];
        loop {
            let n = match down_r.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    if !is_benign_close(&e) {
                        tracing::debug!(error = %e, "downstream read failed");
                    }
                    break;
                }
            };
            multiplier.store(1, Ordering::Relaxed);
            let data: Cow<'_, [u8]> = match &mut encrypt {
                Some(f) => Cow::Owned(f(&buf[..n])),
                None => Cow::Borrowed(&buf[..n]),
            };
            counter_d2u.sending(data.len());
            if up_w.write_all(&data).await.is_err() {
                break;
            }
        }
        // Client side done: let the upstream see EOF so U→D can finish.
        let _ = up_w.shutdown().await;
    };

    tokio::pin!(u2d);
    tokio::pin!(d2u);

    // The relay completes when U→D ends; a finished D→U only hands the
    // remaining lifetime to U→D.
    let result = tokio::select! {
        r = &mut u2d => r,
        _ = &mut d2u => (&mut u2d).await,
    };

    *forward_started = started.load(Ordering::Relaxed);
    result?;

    if !started.load(Ordering::Relaxed) {
        return Ok(RelayEnd::NoPayload {
            delayed_penalty: opts.delayed_penalty.take(),
        });
    }
    Ok(RelayEnd::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicU32;

    use tokio::net::TcpListener;

    use crate::observability::stat::TrafficLedger;
    use crate::upstream::BackendId;

    /// A connected (client, server) pair of real sockets.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn session_for(downstream: TcpStream, dst_port: u16) -> Session {
        let src: SocketAddr = "5.6.7.8:40000".parse().unwrap();
        Session::new(downstream, src, "9.9.9.9".parse().unwrap(), dst_port, false)
    }

    fn counter() -> Arc<crate::observability::stat::TrafficCounter> {
        TrafficLedger::new().opened(
            BackendId::new("test"),
            String::new(),
            "9.9.9.9".parse().unwrap(),
        )
    }

    fn quick_options() -> RelayOptions {
        RelayOptions {
            connect_timeout: Duration::from_millis(300),
            idle_timeout: Duration::from_secs(5),
            bufsize: 1024,
            encrypt: None,
            decrypt: None,
            delayed_penalty: None,
            on_forward_started: None,
        }
    }

    #[tokio::test]
    async fn relays_upstream_payload_and_fires_penalties_once() {
        let (mut client, downstream) = socket_pair().await;
        let (upstream, mut origin) = socket_pair().await;
        let mut session = session_for(downstream, 80);

        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_penalty = fired.clone();
        session
            .delayed_penalties
            .push(Box::new(move || {
                fired_in_penalty.fetch_add(1, Ordering::SeqCst);
            }));

        let server = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            origin.write_all(b"hello from upstream").await.unwrap();
            origin.shutdown().await.unwrap();
        });

        let end = forward(&mut session, upstream, counter(), quick_options())
            .await
            .unwrap();
        assert!(matches!(end, RelayEnd::Completed));
        assert!(session.forward_started);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(session.delayed_penalties.is_empty());
        drop(session); // closes the downstream so the client sees EOF

        let mut received = Vec::new();
        use tokio::io::AsyncReadExt;
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello from upstream");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn zero_payload_surfaces_fallback_with_penalty() {
        let (_client, downstream) = socket_pair().await;
        let (upstream, origin) = socket_pair().await;
        let mut session = session_for(downstream, 80);

        // Upstream closes without ever answering.
        drop(origin);

        let mut opts = quick_options();
        opts.delayed_penalty = Some(Box::new(|| {}));
        let end = forward(&mut session, upstream, counter(), opts)
            .await
            .unwrap();
        match end {
            RelayEnd::NoPayload { delayed_penalty } => assert!(delayed_penalty.is_some()),
            RelayEnd::Completed => panic!("expected zero-payload fallback"),
        }
        assert!(!session.forward_started);
    }

    #[tokio::test]
    async fn silent_upstream_times_out_into_fallback() {
        let (_client, downstream) = socket_pair().await;
        let (upstream, _origin) = socket_pair().await;
        let mut session = session_for(downstream, 80);

        // _origin stays open but never writes; the connect window expires.
        let end = forward(&mut session, upstream, counter(), quick_options())
            .await
            .unwrap();
        assert!(matches!(end, RelayEnd::NoPayload { .. }));
        assert!(!session.forward_started);
    }

    #[tokio::test]
    async fn client_bytes_reach_the_upstream() {
        let (mut client, downstream) = socket_pair().await;
        let (upstream, mut origin) = socket_pair().await;
        let mut session = session_for(downstream, 80);

        let driver = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });
        let echo = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 4];
            origin.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            origin.write_all(b"pong").await.unwrap();
            origin.shutdown().await.unwrap();
        });

        let end = forward(&mut session, upstream, counter(), quick_options())
            .await
            .unwrap();
        assert!(matches!(end, RelayEnd::Completed));
        driver.await.unwrap();
        echo.await.unwrap();
    }
}
