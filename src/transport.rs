use crate::h2::{CancelAll, Connection, PushObserver};
use crate::pool::Connector;
use crate::types::{ConnectionConfig, Destination, ProtocolError, TlsParams};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

const ALPN_H2: &[u8] = b"h2";

#[derive(Debug)]
pub struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Byte stream a connection runs over.
pub enum TransportStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TransportStream {
    /// Protocol chosen by ALPN, if the stream is TLS and one was negotiated.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TransportStream::Tcp(_) => None,
            TransportStream::Tls(stream) => stream.get_ref().1.alpn_protocol(),
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            TransportStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            TransportStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            TransportStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            TransportStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

fn server_name_from_str(name: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid server name: {}", name),
        )
    })
}

fn build_tls_connector(params: &TlsParams) -> TlsConnector {
    let builder = ClientConfig::builder();
    let mut config = if params.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    TlsConnector::from(Arc::new(config))
}

async fn with_timeout<F, T>(
    duration: Option<Duration>,
    future: F,
    timeout_message: &'static str,
) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if let Some(duration) = duration {
        match time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, timeout_message)),
        }
    } else {
        future.await
    }
}

/// Opens the transport for `destination`: plain TCP for prior-knowledge
/// cleartext HTTP/2, TCP plus a TLS handshake offering only `h2` otherwise.
pub async fn connect_transport(
    destination: &Destination,
    timeout: Option<Duration>,
) -> io::Result<TransportStream> {
    let tcp = with_timeout(
        timeout,
        TcpStream::connect((destination.host.as_str(), destination.port)),
        "TCP connection timed out",
    )
    .await?;
    tcp.set_nodelay(true)?;

    let Some(params) = &destination.tls else {
        return Ok(TransportStream::Tcp(tcp));
    };

    // Ensure a crypto provider is installed (required for rustls >=0.23).
    let _ = default_provider().install_default();

    let connector = build_tls_connector(params);
    let server_name = server_name_from_str(&params.server_name)?;
    let tls = with_timeout(
        timeout,
        connector.connect(server_name, tcp),
        "TLS handshake timed out",
    )
    .await?;

    Ok(TransportStream::Tls(Box::new(tls)))
}

/// [`Connector`] that dials TCP/TLS and runs the HTTP/2 handshake.
pub struct TransportConnector {
    config: ConnectionConfig,
    observer: Arc<dyn PushObserver>,
}

impl TransportConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            observer: Arc::new(CancelAll),
        }
    }

    /// Receives streams pushed on every connection this connector opens.
    /// Push must also be enabled in the connection config.
    pub fn with_observer(mut self, observer: Arc<dyn PushObserver>) -> Self {
        self.observer = observer;
        self
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, destination: &Destination) -> Result<Connection, ProtocolError> {
        debug!(%destination, "Opening transport");
        let stream = connect_transport(destination, self.config.timeouts.connect)
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {}", destination, e)))?;

        if destination.is_tls() && stream.alpn_protocol() != Some(ALPN_H2) {
            return Err(ProtocolError::ConnectionFailed(format!(
                "{} did not negotiate h2 via ALPN",
                destination
            )));
        }

        Connection::handshake_with_observer(stream, self.config.clone(), self.observer.clone())
            .await
    }
}
