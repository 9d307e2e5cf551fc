//! Bidirectional byte relay between a client and its upstream

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Which half of the relay finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// How a relay ended
#[derive(Debug)]
pub struct RelayOutcome {
    /// The direction that completed and ended the relay, or `None` when
    /// the idle timeout fired
    pub finished: Option<Direction>,
    /// Bytes it forwarded, or the error that stopped it
    pub result: io::Result<u64>,
}

/// Last time either direction moved bytes, in milliseconds since `start`
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Copy bytes both ways until either direction ends.
///
/// The first direction to hit EOF or an error wins: the other one is
/// abandoned mid-flight and both streams are dropped, which closes them.
/// Data still in transit on the surviving direction may be lost.
///
/// With `idle_timeout` set, the relay ends with `ErrorKind::TimedOut` once
/// neither direction has read anything for that long.
pub async fn relay<C, U>(client: C, upstream: U, idle_timeout: Option<Duration>) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let activity = Activity::new();

    tokio::select! {
        result = pump(&mut client_read, &mut upstream_write, &activity) => RelayOutcome {
            finished: Some(Direction::ClientToUpstream),
            result,
        },
        result = pump(&mut upstream_read, &mut client_write, &activity) => RelayOutcome {
            finished: Some(Direction::UpstreamToClient),
            result,
        },
        err = watch_idle(&activity, idle_timeout) => RelayOutcome {
            finished: None,
            result: Err(err),
        },
    }
}

async fn watch_idle(activity: &Activity, idle_timeout: Option<Duration>) -> io::Error {
    let Some(limit) = idle_timeout else {
        return std::future::pending().await;
    };

    loop {
        let deadline = activity.last() + limit;
        if Instant::now() >= deadline {
            return io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout");
        }
        sleep_until(deadline).await;
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        activity.touch();

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
