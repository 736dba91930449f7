//! Drains a launcher's output pipe.
//!
//! The [`LineReader`] copies everything a launcher writes into the runner's
//! sink as it arrives, and keeps a copy so the run can be parsed once the
//! pipe is closed.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sink::OutputSink;

/// Background task copying a pipe into a sink, line by line.
pub struct LineReader {
    buffer: Arc<Mutex<String>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LineReader {
    /// Starts draining `reader` into `output`.
    pub fn start<R>(reader: R, output: OutputSink) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(String::new()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(drain(
            BufReader::new(reader),
            output,
            buffer.clone(),
            cancel.clone(),
        ));

        Self {
            buffer,
            cancel,
            handle: Some(handle),
        }
    }

    /// Stops reading. Lines already read stay available.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Waits until the pipe reaches EOF or the reader is killed.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            debug!("Line reader ended abnormally: {}", e);
        }
    }

    /// Everything read so far, split into lines.
    pub fn lines(&self) -> Vec<String> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .lines()
            .map(String::from)
            .collect()
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain<R>(
    mut reader: BufReader<R>,
    output: OutputSink,
    buffer: Arc<Mutex<String>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        bytes.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut bytes) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Line reader stopped: {}", e);
                break;
            }
        }

        // Carriage returns are the only bytes the sink does not see.
        bytes.retain(|&b| b != b'\r');
        // A closed sink must not stop the pipe from draining.
        let _ = output.write_all(&bytes).await;

        buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_str(&String::from_utf8_lossy(&bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_copies_and_collects_lines() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, captured) = OutputSink::capture();
        let mut line_reader = LineReader::start(reader, sink);

        writer
            .write_all(b"[==========] 1 test from 1 test suite ran.\r\n[  PASSED  ] 1 test.\r\n")
            .await
            .unwrap();
        writer.write_all(b"no newline").await.unwrap();
        drop(writer);

        line_reader.join().await;
        assert_eq!(
            line_reader.lines(),
            vec![
                "[==========] 1 test from 1 test suite ran.",
                "[  PASSED  ] 1 test.",
                "no newline",
            ]
        );
        assert_eq!(
            captured.contents(),
            "[==========] 1 test from 1 test suite ran.\n[  PASSED  ] 1 test.\nno newline"
        );
    }

    #[tokio::test]
    async fn test_passes_invalid_utf8_through() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, captured) = OutputSink::capture();
        let mut line_reader = LineReader::start(reader, sink);

        writer.write_all(b"caf\xe9 \xff\xfe\r\nok\n").await.unwrap();
        drop(writer);
        line_reader.join().await;

        assert_eq!(captured.bytes(), b"caf\xe9 \xff\xfe\nok\n");
        assert_eq!(line_reader.lines(), vec!["caf\u{FFFD} \u{FFFD}\u{FFFD}", "ok"]);
    }

    #[tokio::test]
    async fn test_kill_stops_live_pipe() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut line_reader = LineReader::start(reader, OutputSink::null());

        writer.write_all(b"first\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // The writer stays open; join must still return.
        line_reader.kill();
        tokio::time::timeout(std::time::Duration::from_secs(1), line_reader.join())
            .await
            .unwrap();
        assert_eq!(line_reader.lines(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_survives_closed_sink() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, _captured) = OutputSink::capture();
        sink.close().await.unwrap();
        let mut line_reader = LineReader::start(reader, sink);

        writer.write_all(b"a\nb\n").await.unwrap();
        drop(writer);
        line_reader.join().await;
        assert_eq!(line_reader.lines(), vec!["a", "b"]);
    }
}
