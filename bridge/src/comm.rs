// Paced TCP link to an EW11-style RS485 gateway. The bus is shared with the
// wallpad's own traffic, so every write waits out the pacing interval since
// the previous one. The reader owns reconnects; the writer just logs a
// failed send and moves on.

use std::io;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;

pub struct PacedConn {
    server: String,
    port: u16,
    interval: Duration,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    last_write: StdMutex<Instant>,
}

impl PacedConn {
    pub fn new(server: &str, port: u16, interval: Duration) -> Self {
        PacedConn {
            server: server.to_string(),
            port,
            interval,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            last_write: StdMutex::new(Instant::now()),
        }
    }

    pub async fn connect(&self) -> io::Result<()> {
        let stream = TcpStream::connect((self.server.as_str(), self.port)).await?;
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(read_half));
        *self.writer.lock().await = Some(write_half);
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(mut write_half) = self.writer.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        self.reader.lock().await.take();
    }

    pub async fn read_byte(&self) -> io::Result<u8> {
        let mut guard = self.reader.lock().await;
        match guard.as_mut() {
            Some(reader) => reader.read_u8().await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket not open")),
        }
    }

    /// True once the bus has been left alone for a full pacing interval.
    pub fn quiet(&self) -> bool {
        self.last_write.lock().expect("pacing clock lock").elapsed() >= self.interval
    }

    async fn wait_pacing(&self) {
        loop {
            let remaining = {
                let last = *self.last_write.lock().expect("pacing clock lock");
                (last + self.interval).checked_duration_since(Instant::now())
            };
            match remaining {
                Some(gap) if !gap.is_zero() => sleep(gap).await,
                _ => return,
            }
        }
    }

    pub async fn write_paced(&self, bytes: &[u8]) -> io::Result<()> {
        self.wait_pacing().await;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not open"))?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        *self.last_write.lock().expect("pacing clock lock") = Instant::now();
        Ok(())
    }

    /// Drop the connection, hold off for three pacing intervals, then keep
    /// trying to reopen until the gateway answers.
    pub async fn reconnect(&self) {
        self.close().await;
        loop {
            sleep(3 * self.interval).await;
            match self.connect().await {
                Ok(()) => {
                    log::info!("reconnected to [{}:{}]", self.server, self.port);
                    return;
                }
                Err(e) => log::warn!("reconnect to [{}:{}] failed: {e}", self.server, self.port),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn writes_are_separated_by_the_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut sink = vec![0u8; 64];
            while peer.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let interval = Duration::from_millis(50);
        let conn = PacedConn::new("127.0.0.1", addr.port(), interval);
        conn.connect().await.unwrap();

        conn.write_paced(b"one").await.unwrap();
        let first = Instant::now();
        conn.write_paced(b"two").await.unwrap();
        assert!(first.elapsed() >= interval);
    }

    #[tokio::test]
    async fn read_after_close_reports_not_connected() {
        let conn = PacedConn::new("127.0.0.1", 1, Duration::from_millis(10));
        let err = conn.read_byte().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
