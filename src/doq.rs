use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::transport::{host_for_sni, resolve_server, QueryError, Transport};

/// Dials and caches one QUIC connection to the server.
///
/// Streams multiplex on a single connection, so one connector can back
/// any number of workers; a separate connector per worker gives each its
/// own connection. The client endpoint is bound lazily because the
/// address family is only known after resolution.
pub struct QuicConnector {
	server: String,
	connect_timeout: Duration,
	client_config: quinn::ClientConfig,
	endpoint: std::sync::Mutex<Option<quinn::Endpoint>>,
	connection: tokio::sync::Mutex<Option<quinn::Connection>>,
}

impl QuicConnector {
	pub fn new(config: &Config) -> anyhow::Result<Self> {
		// RFC 9250: ALPN token for DoQ is "doq"
		let crypto = crate::transport::client_tls_config(config.insecure, &[b"doq"]);
		let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
			.map_err(|e| anyhow::anyhow!("quic client config: {}", e))?;
		let client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));

		Ok(QuicConnector {
			server: config.server.clone(),
			connect_timeout: config.connect_timeout,
			client_config,
			endpoint: std::sync::Mutex::new(None),
			connection: tokio::sync::Mutex::new(None),
		})
	}

	fn endpoint_for(&self, addr: std::net::SocketAddr) -> Result<quinn::Endpoint, QueryError> {
		let mut guard = self.endpoint.lock().unwrap();
		if let Some(endpoint) = guard.as_ref() {
			return Ok(endpoint.clone());
		}
		let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
		let mut endpoint = quinn::Endpoint::client(bind_addr.parse().unwrap())
			.map_err(|e| QueryError::Connect(e.to_string()))?;
		endpoint.set_default_client_config(self.client_config.clone());
		*guard = Some(endpoint.clone());
		Ok(endpoint)
	}

	/// Return the live cached connection or dial a fresh one.
	async fn connection(&self) -> Result<quinn::Connection, QueryError> {
		let mut guard = self.connection.lock().await;
		if let Some(conn) = guard.as_ref() {
			if conn.close_reason().is_none() {
				return Ok(conn.clone());
			}
		}

		let addr = resolve_server(&self.server, self.connect_timeout).await?;
		let endpoint = self.endpoint_for(addr)?;
		let connecting = endpoint.connect(addr, host_for_sni(&self.server))
			.map_err(|e| QueryError::Connect(e.to_string()))?;
		let conn = timeout(self.connect_timeout, connecting).await
			.map_err(|_| QueryError::Connect("timed out".to_string()))?
			.map_err(|e| QueryError::Tls(e.to_string()))?;
		debug!(server = %self.server, "quic connection established");
		*guard = Some(conn.clone());
		Ok(conn)
	}

	async fn invalidate(&self) {
		*self.connection.lock().await = None;
	}
}

/// DNS-over-QUIC transport: one bidirectional stream per query, 16-bit
/// length framing, request ID 0 (supplied by the engine).
pub struct QuicTransport {
	connector: Arc<QuicConnector>,
	write_timeout: Duration,
	read_timeout: Duration,
}

impl QuicTransport {
	pub fn new(connector: Arc<QuicConnector>, config: &Config) -> Self {
		QuicTransport {
			connector,
			write_timeout: config.write_timeout,
			read_timeout: config.read_timeout,
		}
	}

	async fn exchange_on_stream(
		&self,
		conn: &quinn::Connection,
		bytes: &[u8],
	) -> Result<Vec<u8>, QueryError> {
		let (mut send, mut recv) = timeout(self.write_timeout, conn.open_bi()).await
			.map_err(|_| QueryError::Write("stream open timed out".to_string()))?
			.map_err(|e| QueryError::Write(e.to_string()))?;

		let len = (bytes.len() as u16).to_be_bytes();
		let write = async {
			send.write_all(&len).await?;
			send.write_all(bytes).await
		};
		timeout(self.write_timeout, write).await
			.map_err(|_| QueryError::Write("timed out".to_string()))?
			.map_err(|e| QueryError::Write(e.to_string()))?;
		send.finish().map_err(|e| QueryError::Write(e.to_string()))?;

		let read = async {
			let mut len_buf = [0u8; 2];
			recv.read_exact(&mut len_buf).await
				.map_err(|e| QueryError::Read(e.to_string()))?;
			let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
			recv.read_exact(&mut body).await
				.map_err(|e| QueryError::Read(e.to_string()))?;
			Ok(body)
		};
		timeout(self.read_timeout, read).await
			.map_err(|_| QueryError::Read("timed out".to_string()))?
	}
}

#[async_trait]
impl Transport for QuicTransport {
	async fn exchange(&mut self, request: &Message) -> Result<Message, QueryError> {
		let bytes = request.to_vec()
			.map_err(|e| QueryError::Protocol(e.to_string()))?;

		let conn = self.connector.connection().await?;
		match self.exchange_on_stream(&conn, &bytes).await {
			Ok(body) => Message::from_vec(&body)
				.map_err(|e| QueryError::Protocol(e.to_string())),
			Err(e) => {
				// The connection may be gone; redial on the next query
				self.connector.invalidate().await;
				Err(e)
			}
		}
	}
}
