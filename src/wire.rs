use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

// Longest legitimate line is a REGISTER carrying a hex bitmap; this bound
// keeps a misbehaving peer from growing the buffer without limit.
const MAX_LINE_LEN: u64 = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("connection closed by remote")]
    Closed,
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One duplex protocol stream. Commands are `\n`-terminated ASCII lines;
/// binary payloads follow their length-prefixed header with no extra
/// framing. Every receive either transfers the full declared amount or
/// fails; there is no partial-frame tolerance.
///
/// Generic over the stream so protocol sessions can run on
/// `tokio::io::duplex` pipes in tests.
pub struct Connection<S> {
    stream: BufStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    /// Reads one line, stripping the terminator and surrounding
    /// whitespace. EOF before any byte is [`WireError::Closed`]; EOF
    /// mid-line is a frame error.
    pub async fn recv_line(&mut self) -> Result<String, WireError> {
        let mut line = String::new();
        let n = (&mut self.stream)
            .take(MAX_LINE_LEN)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Err(WireError::Closed);
        }
        if !line.ends_with('\n') {
            return Err(WireError::Frame(format!(
                "unterminated line of {} bytes",
                line.len()
            )));
        }
        Ok(line.trim().to_string())
    }

    /// Reads exactly `len` raw bytes, the body of a length-prefixed frame.
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        let mut body = vec![0u8; len];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    WireError::Frame(format!("stream ended inside a {len}-byte body"))
                }
                _ => WireError::Io(e),
            })?;
        Ok(body)
    }

    /// Sends one line, appending the terminator, and flushes.
    pub async fn send_line(&mut self, line: &str) -> Result<(), WireError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a header line followed immediately by its binary body.
    pub async fn send_frame(&mut self, header: &str, body: &[u8]) -> Result<(), WireError> {
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.write_all(body).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_is_trimmed_of_cr_and_whitespace() {
        let (client, server) = tokio::io::duplex(256);
        let mut tx = Connection::new(client);
        let mut rx = Connection::new(server);

        tx.send_line("HANDSHAKE demo\r").await.unwrap();
        assert_eq!(rx.recv_line().await.unwrap(), "HANDSHAKE demo");
    }

    #[tokio::test]
    async fn frame_body_follows_header() {
        let (client, server) = tokio::io::duplex(256);
        let mut tx = Connection::new(client);
        let mut rx = Connection::new(server);

        tx.send_frame("BITFIELD 3", &[0xE0, 0x01, 0x02]).await.unwrap();
        assert_eq!(rx.recv_line().await.unwrap(), "BITFIELD 3");
        assert_eq!(rx.recv_exact(3).await.unwrap(), vec![0xE0, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn eof_before_any_byte_is_closed() {
        let (client, server) = tokio::io::duplex(256);
        drop(client);
        let mut rx = Connection::new(server);
        assert!(matches!(rx.recv_line().await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn short_body_is_a_frame_error() {
        let (client, server) = tokio::io::duplex(256);
        let mut tx = Connection::new(client);
        let mut rx = Connection::new(server);

        tx.send_frame("PIECE 0 10", &[1, 2, 3]).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv_line().await.unwrap(), "PIECE 0 10");
        assert!(matches!(rx.recv_exact(10).await, Err(WireError::Frame(_))));
    }
}
