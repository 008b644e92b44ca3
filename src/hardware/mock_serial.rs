//! Scripted serial link for line-oriented instrument drivers
//!
//! [`new`] returns two ends of one link. The driver under test gets the
//! [`MockSerialPort`]; the test keeps the [`InstrumentHarness`], reads the command
//! lines the driver writes and answers queries. Dropping the harness makes the port
//! read EOF and fail writes with `BrokenPipe`.
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let generator = Tg2512a::with_port(Box::new(port), Duration::from_secs(1));
//!
//! let task = tokio::spawn(async move { generator.identify().await });
//! harness.answer("*IDN?", "THURLBY THANDAR,TG2512A,0,1.20\r\n").await;
//! ```

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};

/// How long the harness waits for the driver to finish a line.
const LINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Driver end of the link.
#[derive(Debug)]
pub struct MockSerialPort {
    written: UnboundedSender<Vec<u8>>,
    replies: UnboundedReceiver<Vec<u8>>,
    pending: BytesMut,
}

/// Instrument end of the link, held by the test.
#[derive(Debug)]
pub struct InstrumentHarness {
    written: UnboundedReceiver<Vec<u8>>,
    replies: UnboundedSender<Vec<u8>>,
    received: BytesMut,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, InstrumentHarness) {
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();
    (
        MockSerialPort {
            written: written_tx,
            replies: replies_rx,
            pending: BytesMut::new(),
        },
        InstrumentHarness {
            written: written_rx,
            replies: replies_tx,
            received: BytesMut::new(),
        },
    )
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match ready!(self.replies.poll_recv(cx)) {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = buf.remaining().min(self.pending.len());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let sent = self.written.send(buf.to_vec());
        Poll::Ready(
            sent.map(|()| buf.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "instrument harness dropped")),
        )
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl InstrumentHarness {
    /// Next line written by the driver, without its terminator.
    ///
    /// # Panics
    /// If no complete line arrives within two seconds or the port was dropped.
    pub async fn next_line(&mut self) -> String {
        loop {
            if let Some(end) = self.received.iter().position(|&b| b == b'\n') {
                let line = self.received.split_to(end + 1);
                return String::from_utf8_lossy(&line).trim_end().to_string();
            }
            match timeout(LINE_TIMEOUT, self.written.recv()).await {
                Ok(Some(chunk)) => self.received.extend_from_slice(&chunk),
                Ok(None) => panic!(
                    "driver dropped the port; partial line {:?}",
                    String::from_utf8_lossy(&self.received)
                ),
                Err(_) => panic!(
                    "no line within {LINE_TIMEOUT:?}; partial line {:?}",
                    String::from_utf8_lossy(&self.received)
                ),
            }
        }
    }

    /// The next `count` lines.
    pub async fn read_lines(&mut self, count: usize) -> Vec<String> {
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(self.next_line().await);
        }
        lines
    }

    /// Expect `command` as the next line and send `reply` back verbatim.
    pub async fn answer(&mut self, command: &str, reply: &str) {
        assert_eq!(self.next_line().await, command);
        if self.replies.send(reply.as_bytes().to_vec()).is_err() {
            panic!("driver dropped the port before {command:?} was answered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn query_gets_scripted_answer() {
        let (port, mut harness) = new();
        let mut port = BufReader::new(port);

        let driver = tokio::spawn(async move {
            port.write_all(b"*IDN?\n").await.unwrap();
            let mut response = String::new();
            port.read_line(&mut response).await.unwrap();
            response
        });

        harness.answer("*IDN?", "THURLBY THANDAR,TG2512A\n").await;
        assert_eq!(driver.await.unwrap(), "THURLBY THANDAR,TG2512A\n");
    }

    #[tokio::test]
    async fn lines_split_across_writes_are_joined() {
        let (mut port, mut harness) = new();

        port.write_all(b"CHN 1\nOUT").await.unwrap();
        port.write_all(b"PUT ON\r\n").await.unwrap();

        assert_eq!(harness.read_lines(2).await, vec!["CHN 1", "OUTPUT ON"]);
    }

    #[tokio::test]
    async fn dropped_harness_reads_eof() {
        let (port, harness) = new();
        drop(harness);
        let mut port = BufReader::new(port);

        let mut response = String::new();
        assert_eq!(port.read_line(&mut response).await.unwrap(), 0);
    }
}
