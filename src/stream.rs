//! Transport abstraction over plain TCP and (optionally) TLS, so `Connection`
//! does not need to know which one it is holding. Adapted from the
//! plain/TLS split the teacher crate uses for its own socket backends.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use tokio_native_tls::TlsStream;

pub enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<TlsStream<TcpStream>>),
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> std::io::Result<Self> {
        let tcp = match self {
            Self::Tcp(buf_reader) => buf_reader.into_inner(),
            Self::Tls(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "connection is already using TLS",
                ));
            }
        };

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls_stream = connector
            .connect(host, tcp)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        Ok(Self::Tls(BufReader::new(tls_stream)))
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(reader) => reader.read_exact(buf).await.map(|_| ()),
            #[cfg(feature = "tls")]
            Self::Tls(reader) => reader.read_exact(buf).await.map(|_| ()),
        }
    }

    /// Reads into `buf`, returning `0` bytes read on a graceful close
    /// instead of erroring (used by the reader loop to detect EOF).
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(reader) => reader.read(buf).await,
            #[cfg(feature = "tls")]
            Self::Tls(reader) => reader.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(reader) => reader.get_mut().write_all(buf).await,
            #[cfg(feature = "tls")]
            Self::Tls(reader) => reader.get_mut().write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(reader) => reader.get_mut().flush().await,
            #[cfg(feature = "tls")]
            Self::Tls(reader) => reader.get_mut().flush().await,
        }
    }
}
