use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Buf, Bytes};
use hickory_proto::op::Message;
use tokio::time::timeout;
use tracing::debug;

use crate::config::{Config, DohMethod, HttpVersion};
use crate::transport::{QueryError, Transport};

const DNS_MESSAGE: &str = "application/dns-message";

/// Shared DoH state for the whole run: a multiplexing reqwest client for
/// HTTP/1.1 and HTTP/2, or a QUIC endpoint holder for HTTP/3.
pub struct DohShared {
	url: String,
	method: DohMethod,
	client: Option<reqwest::Client>,
	h3: Option<Arc<H3Connector>>,
}

impl DohShared {
	pub fn new(config: &Config) -> anyhow::Result<Self> {
		let (client, h3) = match config.http_version {
			HttpVersion::Http1 | HttpVersion::Http2 => {
				let mut builder = reqwest::Client::builder()
					.connect_timeout(config.connect_timeout)
					.danger_accept_invalid_certs(config.insecure);
				builder = match config.http_version {
					HttpVersion::Http1 => builder.http1_only(),
					_ => builder.http2_prior_knowledge(),
				};
				(Some(builder.build()?), None)
			}
			HttpVersion::Http3 => (None, Some(Arc::new(H3Connector::new(config)?))),
		};
		Ok(DohShared {
			url: config.server.clone(),
			method: config.doh_method,
			client,
			h3,
		})
	}
}

/// Hand out the per-worker DoH transport.
pub fn create(shared: &DohShared, config: &Config) -> Box<dyn Transport> {
	match (&shared.client, &shared.h3) {
		(Some(client), _) => Box::new(DohTransport {
			client: client.clone(),
			url: shared.url.clone(),
			method: shared.method,
			read_timeout: config.read_timeout,
		}),
		(None, Some(h3)) => Box::new(H3Transport {
			connector: h3.clone(),
			url: shared.url.clone(),
			method: shared.method,
			write_timeout: config.write_timeout,
			read_timeout: config.read_timeout,
		}),
		(None, None) => unreachable!("DohShared always holds a client or an h3 connector"),
	}
}

/// Encode a request for the RFC 8484 GET form: base64url without padding.
pub fn encode_get_payload(bytes: &[u8]) -> String {
	URL_SAFE_NO_PAD.encode(bytes)
}

/// DoH over HTTP/1.1 or HTTP/2 via reqwest.
struct DohTransport {
	client: reqwest::Client,
	url: String,
	method: DohMethod,
	read_timeout: Duration,
}

#[async_trait]
impl Transport for DohTransport {
	async fn exchange(&mut self, request: &Message) -> Result<Message, QueryError> {
		let bytes = request.to_vec()
			.map_err(|e| QueryError::Protocol(e.to_string()))?;

		let builder = match self.method {
			DohMethod::Post => self.client
				.post(&self.url)
				.header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE)
				.body(bytes),
			DohMethod::Get => self.client
				.get(&self.url)
				.query(&[("dns", encode_get_payload(&bytes))]),
		};

		let response = builder
			.header(reqwest::header::ACCEPT, DNS_MESSAGE)
			.timeout(self.read_timeout)
			.send()
			.await
			.map_err(classify_reqwest)?;

		let status = response.status();
		if !status.is_success() {
			return Err(QueryError::HttpStatus(status.as_u16()));
		}
		let body = response.bytes().await.map_err(classify_reqwest)?;
		Message::from_vec(&body).map_err(|e| QueryError::Protocol(e.to_string()))
	}
}

fn classify_reqwest(e: reqwest::Error) -> QueryError {
	if e.is_timeout() {
		QueryError::Read("timed out".to_string())
	} else if e.is_connect() {
		QueryError::Connect(e.to_string())
	} else {
		QueryError::Read(e.to_string())
	}
}

/// Lazily-bound QUIC endpoint for DoH3. Sessions are per query: an HTTP/3
/// client owns its control streams, so a fresh connection per request is
/// the only layout h3 supports without a connection pool.
pub struct H3Connector {
	host: String,
	port: u16,
	connect_timeout: Duration,
	client_config: quinn::ClientConfig,
	endpoint: std::sync::Mutex<Option<quinn::Endpoint>>,
}

impl H3Connector {
	pub fn new(config: &Config) -> anyhow::Result<Self> {
		let url = reqwest::Url::parse(&config.server)?;
		let host = url.host_str()
			.ok_or_else(|| anyhow::anyhow!("DoH URL '{}' has no host", config.server))?
			.to_string();
		let port = url.port().unwrap_or(443);

		let crypto = crate::transport::client_tls_config(config.insecure, &[b"h3"]);
		let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
			.map_err(|e| anyhow::anyhow!("h3 client config: {}", e))?;
		Ok(H3Connector {
			host,
			port,
			connect_timeout: config.connect_timeout,
			client_config: quinn::ClientConfig::new(Arc::new(quic_crypto)),
			endpoint: std::sync::Mutex::new(None),
		})
	}

	async fn connect(&self) -> Result<quinn::Connection, QueryError> {
		let server = format!("{}:{}", self.host, self.port);
		let addr = crate::transport::resolve_server(&server, self.connect_timeout).await?;

		let endpoint = {
			let mut guard = self.endpoint.lock().unwrap();
			match guard.as_ref() {
				Some(endpoint) => endpoint.clone(),
				None => {
					let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
					let mut endpoint = quinn::Endpoint::client(bind_addr.parse().unwrap())
						.map_err(|e| QueryError::Connect(e.to_string()))?;
					endpoint.set_default_client_config(self.client_config.clone());
					*guard = Some(endpoint.clone());
					endpoint
				}
			}
		};

		let connecting = endpoint.connect(addr, &self.host)
			.map_err(|e| QueryError::Connect(e.to_string()))?;
		let conn = timeout(self.connect_timeout, connecting).await
			.map_err(|_| QueryError::Connect("timed out".to_string()))?
			.map_err(|e| QueryError::Tls(e.to_string()))?;
		debug!(host = %self.host, "h3 quic connection established");
		Ok(conn)
	}
}

/// DoH over HTTP/3.
struct H3Transport {
	connector: Arc<H3Connector>,
	url: String,
	method: DohMethod,
	write_timeout: Duration,
	read_timeout: Duration,
}

#[async_trait]
impl Transport for H3Transport {
	async fn exchange(&mut self, request: &Message) -> Result<Message, QueryError> {
		let bytes = request.to_vec()
			.map_err(|e| QueryError::Protocol(e.to_string()))?;

		let conn = self.connector.connect().await?;
		let (mut driver, mut send_request) = h3::client::new(h3_quinn::Connection::new(conn))
			.await
			.map_err(|e| QueryError::Connect(e.to_string()))?;
		tokio::spawn(async move {
			let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
		});

		let (http_method, uri, body) = match self.method {
			DohMethod::Post => (http::Method::POST, self.url.clone(), Some(bytes)),
			DohMethod::Get => {
				let uri = format!("{}?dns={}", self.url, encode_get_payload(&bytes));
				(http::Method::GET, uri, None)
			}
		};
		let http_request = http::Request::builder()
			.method(http_method)
			.uri(uri.as_str())
			.header("accept", DNS_MESSAGE)
			.header("content-type", DNS_MESSAGE)
			.body(())
			.map_err(|e| QueryError::Protocol(e.to_string()))?;

		let send = async {
			let mut stream = send_request.send_request(http_request).await
				.map_err(|e| QueryError::Write(e.to_string()))?;
			if let Some(body) = body {
				stream.send_data(Bytes::from(body)).await
					.map_err(|e| QueryError::Write(e.to_string()))?;
			}
			stream.finish().await
				.map_err(|e| QueryError::Write(e.to_string()))?;
			Ok(stream)
		};
		let mut stream = timeout(self.write_timeout, send).await
			.map_err(|_| QueryError::Write("timed out".to_string()))??;

		let recv = async {
			let response = stream.recv_response().await
				.map_err(|e| QueryError::Read(e.to_string()))?;
			let status = response.status();
			if !status.is_success() {
				return Err(QueryError::HttpStatus(status.as_u16()));
			}
			let mut body = Vec::new();
			while let Some(mut chunk) = stream.recv_data().await
				.map_err(|e| QueryError::Read(e.to_string()))?
			{
				while chunk.has_remaining() {
					let piece = chunk.chunk();
					body.extend_from_slice(piece);
					chunk.advance(piece.len());
				}
			}
			Ok(body)
		};
		let body = timeout(self.read_timeout, recv).await
			.map_err(|_| QueryError::Read("timed out".to_string()))??;

		Message::from_vec(&body).map_err(|e| QueryError::Protocol(e.to_string()))
	}
}
