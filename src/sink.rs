//! Output sinks shared by the runner, launchers and the line reader.
//!
//! An [`OutputSink`] is a cloneable handle over an async writer. Every clone
//! writes to the same underlying stream, and [`OutputSink::close`] shuts the
//! stream down for all of them. Closing the write end of a runner pipe is how
//! the [`LineReader`](crate::executor::LineReader) learns that a target has
//! finished producing output.
//!
//! # Example
//!
//! ```
//! use testlauncher::sink::OutputSink;
//!
//! # tokio_test::block_on(async {
//! let (sink, captured) = OutputSink::capture();
//! sink.write_line("[==========] 1 test from 1 test suite ran. (1 ms total)").await.unwrap();
//! assert!(captured.contents().contains("1 test from"));
//! # });
//! ```

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A writable stream receiving target output and runner framing.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
}

impl OutputSink {
    /// Wraps an async writer.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Some(Box::pin(writer)))),
        }
    }

    /// A sink writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// A sink that discards everything written to it.
    pub fn null() -> Self {
        Self::new(tokio::io::sink())
    }

    /// A sink that keeps everything in memory.
    ///
    /// Returns the sink and a handle that can read back what was written.
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (Self::new(captured.clone()), captured)
    }

    /// Writes `bytes` and flushes.
    ///
    /// Fails with [`io::ErrorKind::BrokenPipe`] once the sink is closed.
    pub async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                writer.write_all(bytes).await?;
                writer.flush().await
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "output sink is closed",
            )),
        }
    }

    /// Writes a single line, appending a newline if `line` lacks one.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        if line.ends_with('\n') {
            self.write_all(line.as_bytes()).await
        } else {
            let mut owned = String::with_capacity(line.len() + 1);
            owned.push_str(line);
            owned.push('\n');
            self.write_all(owned.as_bytes()).await
        }
    }

    /// Shuts the underlying writer down. Idempotent.
    pub async fn close(&self) -> io::Result<()> {
        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// In-memory writer backing [`OutputSink::capture`].
#[derive(Clone, Default, Debug)]
pub struct CapturedOutput {
    buffer: Arc<StdMutex<Vec<u8>>>,
}

impl CapturedOutput {
    /// Everything written so far, decoded lossily.
    pub fn contents(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Everything written so far, byte for byte.
    pub fn bytes(&self) -> Vec<u8> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AsyncWrite for CapturedOutput {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
