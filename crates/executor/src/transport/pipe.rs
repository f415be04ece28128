//! Pipe-pair transport for the stdio interface.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Bytes requested per read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Wait kept after a short read in streaming mode.
pub const STREAMING_RESIDUAL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// A short read ends the burst.
    Burst,
    /// A short read keeps a small residual wait for trailing data.
    Streaming,
}

pub struct PipeTransport {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    closed: bool,
    debug: bool,
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PipeTransport {
    pub fn new(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            writer: Box::new(writer),
            reader: Box::new(reader),
            closed: false,
            debug: false,
        }
    }

    /// Log every raw chunk at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read whatever the server has produced.
    ///
    /// Waits up to `first_timeout` for the first byte. After each short
    /// read the wait drops to zero ([`ReadMode::Burst`]) or to
    /// [`STREAMING_RESIDUAL_TIMEOUT`] ([`ReadMode::Streaming`]).
    pub async fn read_available(
        &mut self,
        first_timeout: Duration,
        mode: ReadMode,
    ) -> Result<Vec<u8>, TransportError> {
        let mut output = Vec::new();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut timeout = first_timeout;

        loop {
            match tokio::time::timeout(timeout, self.reader.read(&mut buf)).await {
                Err(_elapsed) => break,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(0)) => {
                    self.closed = true;
                    break;
                }
                Ok(Ok(n)) => {
                    if self.debug {
                        tracing::debug!(bytes = n, chunk = %String::from_utf8_lossy(&buf[..n]), "read from server");
                    }
                    output.extend_from_slice(&buf[..n]);
                    if n < READ_CHUNK_SIZE {
                        timeout = match mode {
                            ReadMode::Burst => Duration::ZERO,
                            ReadMode::Streaming => STREAMING_RESIDUAL_TIMEOUT,
                        };
                    }
                }
            }
        }

        if output.is_empty() {
            if self.closed {
                return Err(TransportError::Closed);
            }
            return Err(TransportError::NoResponse(first_timeout));
        }
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn reads_one_burst() {
        let (client, mut server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let mut transport = PipeTransport::new(writer, reader);

        server.write_all(b"[[0,0.0,0.0],true]\n").await.unwrap();
        let out = transport
            .read_available(Duration::from_secs(1), ReadMode::Burst)
            .await
            .unwrap();
        assert_eq!(out, b"[[0,0.0,0.0],true]\n");
    }

    #[tokio::test]
    async fn streaming_catches_trailing_data() {
        let (client, mut server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let mut transport = PipeTransport::new(writer, reader);

        let feeder = tokio::spawn(async move {
            server.write_all(b"first ").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.write_all(b"second\n").await.unwrap();
            server
        });
        let out = transport
            .read_available(Duration::from_secs(1), ReadMode::Streaming)
            .await
            .unwrap();
        assert_eq!(out, b"first second\n");
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn silence_is_no_response() {
        let (client, _server) = duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let mut transport = PipeTransport::new(writer, reader);
        assert_matches!(
            transport
                .read_available(Duration::from_millis(20), ReadMode::Burst)
                .await,
            Err(TransportError::NoResponse(_))
        );
    }

    #[tokio::test]
    async fn eof_is_closed() {
        let (client, server) = duplex(64);
        drop(server);
        let (reader, writer) = tokio::io::split(client);
        let mut transport = PipeTransport::new(writer, reader);
        assert_matches!(
            transport
                .read_available(Duration::from_millis(20), ReadMode::Burst)
                .await,
            Err(TransportError::Closed)
        );
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn write_reaches_peer() {
        let (client, mut server) = duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let mut transport = PipeTransport::new(writer, reader);
        transport.write(b"status\n").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"status\n");
    }
}
