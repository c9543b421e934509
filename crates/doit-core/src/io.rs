//! Async I/O plumbing shared by the execution engine and the daemon.
//!
//! Pipeline segments, redirect files, in-memory pipes, and IPC frame writers
//! all meet behind the [`BoxedReader`]/[`BoxedWriter`] trait objects. The
//! [`SharedWriter`] adapter lets several concurrent producers (pipeline
//! workers sharing one stderr, sequential steps sharing one stdout) write
//! through a single underlying sink.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, TryLockError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Reader trait object passed through the capability seam.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writer trait object passed through the capability seam.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A clonable [`AsyncWrite`] multiplexing concurrent producers onto one sink.
///
/// Writes are atomic per poll; relative ordering between producers is
/// unspecified, matching the pipeline's stderr contract. Dropping a clone
/// never shuts the underlying writer down: `poll_shutdown` only flushes, so
/// a finishing pipeline worker cannot close a stream other workers (or the
/// connection) still use.
#[derive(Debug)]
pub struct SharedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> SharedWriter<W> {
    /// Wraps `inner` for shared use.
    pub fn new(inner: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> SharedWriter<W> {
    fn lock(&self, cx: &Context<'_>) -> Poll<io::Result<std::sync::MutexGuard<'_, W>>> {
        match self.inner.try_lock() {
            Ok(guard) => Poll::Ready(Ok(guard)),
            Err(TryLockError::WouldBlock) => {
                // Another producer holds the sink for at most one poll.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(TryLockError::Poisoned(_)) => Poll::Ready(Err(io::Error::other(
                "shared writer poisoned by a panicked producer",
            ))),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> AsyncWrite for SharedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = match self.lock(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        Pin::new(&mut *guard).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = match self.lock(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        Pin::new(&mut *guard).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Flush only: other clones may still write.
        self.poll_flush(cx)
    }
}

/// A clonable [`AsyncRead`] letting sequential consumers share one source.
///
/// Compound-command steps read the caller's stdin one after another; each
/// step receives a clone of the same underlying reader. Concurrent reads are
/// safe but interleave at read granularity.
#[derive(Debug)]
pub struct SharedReader<R> {
    inner: Arc<Mutex<R>>,
}

impl<R> SharedReader<R> {
    /// Wraps `inner` for shared use.
    pub fn new(inner: R) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }
}

impl<R> Clone for SharedReader<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> AsyncRead for SharedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Err(TryLockError::Poisoned(_)) => {
                return Poll::Ready(Err(io::Error::other(
                    "shared reader poisoned by a panicked consumer",
                )));
            }
        };
        Pin::new(&mut *guard).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_shared_writer_interleaves_whole_writes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = SharedWriter::new(client);

        let mut a = writer.clone();
        let mut b = writer.clone();
        let ta = tokio::spawn(async move { a.write_all(b"aaaa").await });
        let tb = tokio::spawn(async move { b.write_all(b"bbbb").await });
        ta.await.unwrap().unwrap();
        tb.await.unwrap().unwrap();
        drop(writer);

        let mut out = vec![0u8; 8];
        server.read_exact(&mut out).await.unwrap();
        let s = String::from_utf8(out).unwrap();
        assert_eq!(s.matches('a').count(), 4);
        assert_eq!(s.matches('b').count(), 4);
    }

    #[tokio::test]
    async fn test_shared_writer_shutdown_keeps_sink_open() {
        let (client, mut server) = tokio::io::duplex(64);
        let writer = SharedWriter::new(client);

        let mut first = writer.clone();
        first.write_all(b"one").await.unwrap();
        first.shutdown().await.unwrap();

        // A sibling clone can still write after a shutdown on the first.
        let mut second = writer.clone();
        second.write_all(b"two").await.unwrap();
        drop((first, second, writer));

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "onetwo");
    }

    #[tokio::test]
    async fn test_shared_reader_sequential_consumers() {
        let source: &[u8] = b"hello world";
        let reader = SharedReader::new(source);

        let mut first = reader.clone();
        let mut buf = [0u8; 6];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello ");

        let mut second = reader.clone();
        let mut rest = String::new();
        second.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "world");
    }
}
