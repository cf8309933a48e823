//! One TCP socket wrapped with non-overlapping read/write paths and an
//! inactivity watchdog (§4.B).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Result, YogiError};

/// Caps a single I/O operation so slow links still make and report
/// progress; `None` disables chunking and transfers in one shot.
const DEFAULT_CHUNK_SIZE: usize = 1 << 16;

pub struct FramedTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: SocketAddr,
    timeout: Option<Duration>,
    transceive_byte_limit: Option<usize>,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

impl FramedTransport {
    pub fn new(
        stream: TcpStream,
        timeout: Option<Duration>,
        transceive_byte_limit: Option<usize>,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let now = Instant::now();
        Ok(FramedTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer_addr,
            timeout,
            transceive_byte_limit,
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn chunk_size(&self) -> usize {
        self.transceive_byte_limit.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    /// Writes the whole buffer, re-arming the watchdog after every
    /// chunk and failing with `Timeout` if the deadline is crossed
    /// before the write is acknowledged by the kernel.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let chunk = self.chunk_size().max(1);
        for piece in buf.chunks(chunk) {
            self.with_deadline(writer.write_all(piece)).await?;
            *self.last_write.lock().await = Instant::now();
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes, chunked the same way as
    /// `write_all`.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let chunk = self.chunk_size().max(1);
        let mut offset = 0;
        while offset < buf.len() {
            let end = (offset + chunk).min(buf.len());
            self.with_deadline(reader.read_exact(&mut buf[offset..end]))
                .await?;
            *self.last_read.lock().await = Instant::now();
            offset = end;
        }
        Ok(())
    }

    async fn with_deadline<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        match self.timeout {
            None => Ok(fut.await?),
            Some(d) => match tokio::time::timeout(d, fut).await {
                Ok(res) => Ok(res?),
                Err(_) => Err(YogiError::Timeout(Some(
                    "no progress within inactivity timeout".into(),
                ))),
            },
        }
    }

    /// True if neither direction has seen activity within `timeout`.
    pub async fn is_stale(&self) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        let last = {
            let r = *self.last_read.lock().await;
            let w = *self.last_write.lock().await;
            r.max(w)
        };
        last.elapsed() > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (a, b) = loopback_pair().await;
        let ta = FramedTransport::new(a, None, None).unwrap();
        let tb = FramedTransport::new(b, None, None).unwrap();

        let payload = b"hello yogi".to_vec();
        let write_fut = ta.write_all(&payload);
        let mut buf = vec![0u8; payload.len()];
        let read_fut = tb.read_exact(&mut buf);
        let (w, r) = tokio::join!(write_fut, read_fut);
        w.unwrap();
        r.unwrap();
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn read_times_out_without_data() {
        let (_a, b) = loopback_pair().await;
        let tb = FramedTransport::new(b, Some(Duration::from_millis(20)), None).unwrap();
        let mut buf = [0u8; 4];
        let err = tb.read_exact(&mut buf).await.unwrap_err();
        assert!(matches!(err, YogiError::Timeout(_)));
    }
}
