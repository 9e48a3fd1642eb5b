use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{Config, Protocol};
use crate::dns::is_response;

/// Per-request failure classification. Server responses, whatever their
/// rcode, are never errors; these cover the transport itself.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
	#[error("connect: {0}")]
	Connect(String),
	#[error("tls: {0}")]
	Tls(String),
	#[error("write: {0}")]
	Write(String),
	#[error("read: {0}")]
	Read(String),
	#[error("request timed out")]
	Timeout,
	#[error("protocol: {0}")]
	Protocol(String),
	#[error("http status {0}")]
	HttpStatus(u16),
}

impl QueryError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, QueryError::Timeout)
	}
}

/// One query/response exchange against the configured server.
///
/// Implementations own their connection state; a failed exchange must
/// leave the transport ready to redial on the next call.
#[async_trait]
pub trait Transport: Send {
	async fn exchange(&mut self, request: &Message) -> Result<Message, QueryError>;
}

/// Builds per-worker transports from the run configuration.
///
/// Constructed once per run; `create` is called once per worker. When
/// `separate_connections` is off, UDP/TCP/TLS workers share a single
/// connection behind a lock, while QUIC and DoH share a natively
/// multiplexing handle.
pub struct TransportFactory {
	config: Arc<Config>,
	tls: Option<Arc<ClientConfig>>,
	shared_locked: Option<Arc<tokio::sync::Mutex<Box<dyn Transport>>>>,
	shared_quic: Option<Arc<crate::doq::QuicConnector>>,
	shared_doh: Option<crate::doh::DohShared>,
}

impl TransportFactory {
	pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
		let tls = match config.protocol {
			Protocol::Tls => Some(Arc::new(client_tls_config(config.insecure, &[]))),
			_ => None,
		};

		let mut factory = TransportFactory {
			config: config.clone(),
			tls,
			shared_locked: None,
			shared_quic: None,
			shared_doh: None,
		};

		match config.protocol {
			Protocol::Udp | Protocol::Tcp | Protocol::Tls if !config.separate_connections => {
				let inner = factory.new_exclusive();
				factory.shared_locked = Some(Arc::new(tokio::sync::Mutex::new(inner)));
			}
			Protocol::Quic if !config.separate_connections => {
				factory.shared_quic = Some(Arc::new(crate::doq::QuicConnector::new(&config)?));
			}
			Protocol::Doh => {
				// reqwest clients and QUIC endpoints multiplex, so DoH
				// always starts from one shared handle per run.
				factory.shared_doh = Some(crate::doh::DohShared::new(&config)?);
			}
			_ => {}
		}

		Ok(factory)
	}

	/// Hand out the transport for one worker. Never performs I/O; all
	/// connections are dialed lazily on first use.
	pub fn create(&self) -> anyhow::Result<Box<dyn Transport>> {
		if let Some(shared) = &self.shared_locked {
			return Ok(Box::new(SharedTransport { inner: shared.clone() }));
		}
		if let Some(connector) = &self.shared_quic {
			return Ok(Box::new(crate::doq::QuicTransport::new(connector.clone(), &self.config)));
		}
		if let Some(doh) = &self.shared_doh {
			return Ok(crate::doh::create(doh, &self.config));
		}
		match self.config.protocol {
			Protocol::Quic => {
				let connector = Arc::new(crate::doq::QuicConnector::new(&self.config)?);
				Ok(Box::new(crate::doq::QuicTransport::new(connector, &self.config)))
			}
			_ => Ok(self.new_exclusive()),
		}
	}

	fn new_exclusive(&self) -> Box<dyn Transport> {
		match self.config.protocol {
			Protocol::Udp => Box::new(UdpTransport::new(self.config.clone())),
			Protocol::Tcp => Box::new(StreamTransport::tcp(self.config.clone())),
			Protocol::Tls => Box::new(StreamTransport::tls(
				self.config.clone(),
				self.tls.clone().expect("tls config built for Tls protocol"),
			)),
			_ => unreachable!("exclusive transports are UDP/TCP/TLS only"),
		}
	}
}

/// Lock-serialized view of one shared connection.
struct SharedTransport {
	inner: Arc<tokio::sync::Mutex<Box<dyn Transport>>>,
}

#[async_trait]
impl Transport for SharedTransport {
	async fn exchange(&mut self, request: &Message) -> Result<Message, QueryError> {
		self.inner.lock().await.exchange(request).await
	}
}

/// Build the rustls client configuration shared by DoT (and reused by the
/// QUIC and DoH transports). `insecure` installs a verifier that accepts
/// any certificate. `alpn` is empty for DoT, "doq" for DoQ, "h3" for DoH3.
pub fn client_tls_config(insecure: bool, alpn: &[&[u8]]) -> ClientConfig {
	let mut config = if insecure {
		ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(danger::InsecureVerifier::new()))
			.with_no_client_auth()
	} else {
		let mut roots = RootCertStore::empty();
		roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
		ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth()
	};
	config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
	config
}

/// Extract the host half of "host:port" / "[v6]:port" for SNI.
pub fn host_for_sni(server: &str) -> &str {
	if let Some(end) = server.find(']') {
		return &server[1..end];
	}
	match server.rfind(':') {
		Some(i) => &server[..i],
		None => server,
	}
}

/// UDP transport: one connected socket, receive loop matched on the
/// request ID to discard strays from earlier timed-out queries.
struct UdpTransport {
	config: Arc<Config>,
	socket: Option<UdpSocket>,
	queries_on_conn: u64,
	conns_opened: u64,
}

impl UdpTransport {
	fn new(config: Arc<Config>) -> Self {
		UdpTransport { config, socket: None, queries_on_conn: 0, conns_opened: 0 }
	}

	async fn ensure_socket(&mut self) -> Result<(), QueryError> {
		let quota = self.config.queries_per_conn;
		if quota > 0 && self.queries_on_conn >= quota {
			self.socket = None;
		}
		if self.socket.is_none() {
			let addr = resolve_server(&self.config.server, self.config.connect_timeout).await?;
			let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
			let socket = UdpSocket::bind(bind_addr).await
				.map_err(|e| QueryError::Connect(e.to_string()))?;
			socket.connect(addr).await
				.map_err(|e| QueryError::Connect(e.to_string()))?;
			self.conns_opened += 1;
			self.queries_on_conn = 0;
			debug!(server = %self.config.server, conn = self.conns_opened, "udp socket opened");
			self.socket = Some(socket);
		}
		Ok(())
	}
}

#[async_trait]
impl Transport for UdpTransport {
	async fn exchange(&mut self, request: &Message) -> Result<Message, QueryError> {
		let read_limit = self.config.read_timeout;
		let write_limit = self.config.write_timeout;
		self.ensure_socket().await?;
		self.queries_on_conn += 1;
		let socket = self.socket.as_ref().unwrap();

		let bytes = request.to_vec()
			.map_err(|e| QueryError::Protocol(e.to_string()))?;
		timeout(write_limit, socket.send(&bytes)).await
			.map_err(|_| QueryError::Write("timed out".to_string()))?
			.map_err(|e| QueryError::Write(e.to_string()))?;

		// EDNS responses can exceed 512 bytes
		let mut buf = vec![0u8; 4096];
		let deadline = tokio::time::Instant::now() + read_limit;
		loop {
			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return Err(QueryError::Read("timed out".to_string()));
			}
			let len = timeout(remaining, socket.recv(&mut buf)).await
				.map_err(|_| QueryError::Read("timed out".to_string()))?
				.map_err(|e| QueryError::Read(e.to_string()))?;
			match Message::from_vec(&buf[..len]) {
				Ok(m) if m.id() == request.id() && is_response(&m) => return Ok(m),
				// Stray or mismatched datagram, keep listening
				Ok(_) | Err(_) => continue,
			}
		}
	}
}

/// Framing used by TCP, DoT and DoQ streams: a 16-bit big-endian length
/// prefix followed by the message.
pub async fn write_framed<S>(stream: &mut S, bytes: &[u8], limit: Duration) -> Result<(), QueryError>
where
	S: AsyncWrite + Unpin + Send,
{
	let len = (bytes.len() as u16).to_be_bytes();
	let write = async {
		stream.write_all(&len).await?;
		stream.write_all(bytes).await?;
		stream.flush().await
	};
	timeout(limit, write).await
		.map_err(|_| QueryError::Write("timed out".to_string()))?
		.map_err(|e: std::io::Error| QueryError::Write(e.to_string()))
}

pub async fn read_framed<S>(stream: &mut S, limit: Duration) -> Result<Vec<u8>, QueryError>
where
	S: AsyncRead + Unpin + Send,
{
	let read = async {
		let mut len_buf = [0u8; 2];
		stream.read_exact(&mut len_buf).await?;
		let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
		stream.read_exact(&mut body).await?;
		Ok::<_, std::io::Error>(body)
	};
	timeout(limit, read).await
		.map_err(|_| QueryError::Read("timed out".to_string()))?
		.map_err(|e| QueryError::Read(e.to_string()))
}

enum Stream {
	Tcp(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// TCP and DoT transport: length-framed stream where the next message on
/// the wire is the reply to the last query written.
struct StreamTransport {
	config: Arc<Config>,
	tls: Option<Arc<ClientConfig>>,
	stream: Option<Stream>,
	queries_on_conn: u64,
	conns_opened: u64,
}

impl StreamTransport {
	fn tcp(config: Arc<Config>) -> Self {
		StreamTransport { config, tls: None, stream: None, queries_on_conn: 0, conns_opened: 0 }
	}

	fn tls(config: Arc<Config>, tls: Arc<ClientConfig>) -> Self {
		StreamTransport { config, tls: Some(tls), stream: None, queries_on_conn: 0, conns_opened: 0 }
	}

	async fn ensure_stream(&mut self) -> Result<(), QueryError> {
		let quota = self.config.queries_per_conn;
		if quota > 0 && self.queries_on_conn >= quota {
			self.stream = None;
		}
		if self.stream.is_some() {
			return Ok(());
		}

		let server = self.config.server.clone();
		let tcp = timeout(self.config.connect_timeout, TcpStream::connect(&server)).await
			.map_err(|_| QueryError::Connect("timed out".to_string()))?
			.map_err(|e| QueryError::Connect(e.to_string()))?;

		let stream = match &self.tls {
			None => Stream::Tcp(tcp),
			Some(tls) => {
				let connector = TlsConnector::from(tls.clone());
				let name = ServerName::try_from(host_for_sni(&server).to_string())
					.map_err(|e| QueryError::Tls(e.to_string()))?;
				let tls_stream = timeout(self.config.connect_timeout, connector.connect(name, tcp))
					.await
					.map_err(|_| QueryError::Tls("handshake timed out".to_string()))?
					.map_err(|e| QueryError::Tls(e.to_string()))?;
				Stream::Tls(Box::new(tls_stream))
			}
		};
		self.conns_opened += 1;
		self.queries_on_conn = 0;
		debug!(server = %server, conn = self.conns_opened, "stream connected");
		self.stream = Some(stream);
		Ok(())
	}
}

#[async_trait]
impl Transport for StreamTransport {
	async fn exchange(&mut self, request: &Message) -> Result<Message, QueryError> {
		self.ensure_stream().await?;
		self.queries_on_conn += 1;
		let bytes = request.to_vec()
			.map_err(|e| QueryError::Protocol(e.to_string()))?;

		let write_limit = self.config.write_timeout;
		let read_limit = self.config.read_timeout;
		let result = match self.stream.as_mut().unwrap() {
			Stream::Tcp(s) => exchange_framed(s, &bytes, write_limit, read_limit).await,
			Stream::Tls(s) => exchange_framed(s, &bytes, write_limit, read_limit).await,
		};

		let body = match result {
			Ok(body) => body,
			Err(e) => {
				// Partial I/O leaves the framing unusable; redial next time
				self.stream = None;
				return Err(e);
			}
		};
		Message::from_vec(&body).map_err(|e| QueryError::Protocol(e.to_string()))
	}
}

async fn exchange_framed<S>(
	stream: &mut S,
	bytes: &[u8],
	write_limit: Duration,
	read_limit: Duration,
) -> Result<Vec<u8>, QueryError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	write_framed(stream, bytes, write_limit).await?;
	read_framed(stream, read_limit).await
}

/// Resolve "host:port" to a socket address, preferring IPv4.
pub async fn resolve_server(server: &str, limit: Duration) -> Result<std::net::SocketAddr, QueryError> {
	let addrs: Vec<_> = timeout(limit, lookup_host(server)).await
		.map_err(|_| QueryError::Connect("resolve timed out".to_string()))?
		.map_err(|e| QueryError::Connect(e.to_string()))?
		.collect();
	addrs.iter()
		.find(|a| a.is_ipv4())
		.or_else(|| addrs.first())
		.copied()
		.ok_or_else(|| QueryError::Connect(format!("no addresses for {}", server)))
}

mod danger {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::DigitallySignedStruct;

	/// Accepts any server certificate. Installed only under --insecure.
	#[derive(Debug)]
	pub struct InsecureVerifier {
		provider: CryptoProvider,
	}

	impl InsecureVerifier {
		pub fn new() -> Self {
			InsecureVerifier { provider: rustls::crypto::ring::default_provider() }
		}
	}

	impl ServerCertVerifier for InsecureVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			verify_tls12_signature(
				message, cert, dss,
				&self.provider.signature_verification_algorithms,
			)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			verify_tls13_signature(
				message, cert, dss,
				&self.provider.signature_verification_algorithms,
			)
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			self.provider.signature_verification_algorithms.supported_schemes()
		}
	}
}
