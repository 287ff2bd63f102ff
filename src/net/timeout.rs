//! Idle timeouts for byte streams.
//!
//! # Design Decisions
//! - Uses Tokio's timer; each pending read or write arms its own deadline
//! - A deadline is cleared as soon as the operation makes progress
//! - Expiry surfaces as `io::ErrorKind::TimedOut`, distinct from peer errors

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

/// Wraps a stream and fails reads or writes that stay pending longer than
/// the configured timeout.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_timeout: None,
            write_timeout: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.read_deadline = None;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
        self.write_deadline = None;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
    what: &'static str,
) -> Poll<io::Error> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };
    let timer = deadline.get_or_insert_with(|| Box::pin(sleep(timeout)));
    match timer.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *deadline = None;
            Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{what} timed out after {} ms", timeout.as_millis()),
            ))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.read_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.read_deadline, this.read_timeout, cx, "read").map(Err)
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "write").map(Err)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "flush").map(Err)
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "shutdown")
                    .map(Err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn idle_read_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = TimeoutStream::new(client);
        stream.set_read_timeout(Some(Duration::from_millis(5000)));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn data_arriving_in_time_is_delivered() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = TimeoutStream::new(client);
        stream.set_read_timeout(Some(Duration::from_millis(5000)));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4000)).await;
            server.write_all(b"ping").await.unwrap();
            // keep the pipe open
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_write_times_out() {
        let (client, _server) = tokio::io::duplex(4);
        let mut stream = TimeoutStream::new(client);
        stream.set_write_timeout(Some(Duration::from_millis(5000)));

        let err = stream.write_all(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    /// Accepts writes but never finishes closing.
    struct StuckClose;

    impl AsyncWrite for StuckClose {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_shutdown_times_out() {
        let mut stream = TimeoutStream::new(StuckClose);
        stream.set_write_timeout(Some(Duration::from_millis(5000)));

        let started = tokio::time::Instant::now();
        let err = stream.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_millis(5000));
    }
}
