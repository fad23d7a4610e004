//! Direct HTTP binding of the transport contract
//!
//! One POST per message; the response body is the reply. TLS verification
//! is controlled by the `SSLVerifyServer`, `SSLVerifyHost` and
//! `SSLServerCertificates` configuration properties.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::logging::debug;
use crate::transport::{TransportAgent, TransportStatus};

/// TLS knobs taken from the peer configuration
#[derive(Debug, Clone)]
pub struct TlsOptions {
	pub verify_server: bool,
	pub verify_host: bool,
	/// PEM file with additional trusted CA certificates
	pub server_certificates: String,
}

impl Default for TlsOptions {
	fn default() -> Self {
		TlsOptions { verify_server: true, verify_host: true, server_certificates: String::new() }
	}
}

type PendingReply = JoinHandle<Result<(Vec<u8>, String), TransportError>>;

/// HTTP client transport
pub struct HttpTransport {
	url: String,
	content_type: String,
	timeout: Duration,
	tls: TlsOptions,
	client: Option<reqwest::Client>,
	pending: Option<PendingReply>,
	reply: Option<(Vec<u8>, String)>,
	canceled: bool,
}

impl HttpTransport {
	pub fn new(tls: TlsOptions) -> Self {
		HttpTransport {
			url: String::new(),
			content_type: String::new(),
			timeout: Duration::from_secs(300),
			tls,
			client: None,
			pending: None,
			reply: None,
			canceled: false,
		}
	}

	fn client(&mut self) -> Result<reqwest::Client, TransportError> {
		if let Some(client) = &self.client {
			return Ok(client.clone());
		}

		let mut builder = reqwest::Client::builder();
		if !self.tls.verify_server || !self.tls.verify_host {
			builder = builder.danger_accept_invalid_certs(true);
		}
		if !self.tls.server_certificates.is_empty() {
			let pem = std::fs::read(&self.tls.server_certificates).map_err(|e| {
				TransportError::Failed {
					message: format!("{}: {}", self.tls.server_certificates, e),
				}
			})?;
			for cert in reqwest::Certificate::from_pem_bundle(&pem)
				.map_err(|e| TransportError::Failed { message: e.to_string() })?
			{
				builder = builder.add_root_certificate(cert);
			}
		}

		let client = builder
			.build()
			.map_err(|e| TransportError::Failed { message: e.to_string() })?;
		self.client = Some(client.clone());
		Ok(client)
	}
}

#[async_trait]
impl TransportAgent for HttpTransport {
	fn set_url(&mut self, url: &str) {
		self.url = url.to_string();
	}

	fn set_content_type(&mut self, content_type: &str) {
		self.content_type = content_type.to_string();
	}

	fn set_timeout(&mut self, seconds: u64) {
		self.timeout = Duration::from_secs(seconds);
	}

	async fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
		if self.url.is_empty() {
			return Err(TransportError::BadState { message: "no URL configured".to_string() });
		}
		if self.pending.is_some() {
			return Err(TransportError::BadState {
				message: "previous message still pending".to_string(),
			});
		}
		self.reply = None;
		self.canceled = false;

		let client = self.client()?;
		let url = self.url.clone();
		let content_type = self.content_type.clone();
		let body = message.to_vec();

		debug!("POST {} ({} bytes, {})", url, body.len(), content_type);
		self.pending = Some(tokio::spawn(async move {
			let response = client
				.post(&url)
				.header(reqwest::header::CONTENT_TYPE, content_type)
				.body(body)
				.send()
				.await
				.map_err(|e| TransportError::Failed { message: e.to_string() })?;

			let status = response.status();
			if !status.is_success() {
				return Err(TransportError::Failed {
					message: format!("HTTP status {}", status),
				});
			}
			let reply_type = response
				.headers()
				.get(reqwest::header::CONTENT_TYPE)
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default()
				.to_string();
			let bytes = response
				.bytes()
				.await
				.map_err(|e| TransportError::Failed { message: e.to_string() })?;
			Ok((bytes.to_vec(), reply_type))
		}));
		Ok(())
	}

	async fn wait(&mut self, no_reply: bool) -> Result<TransportStatus, TransportError> {
		if self.canceled {
			return Ok(TransportStatus::Failed);
		}
		let pending = match self.pending.take() {
			Some(p) => p,
			None => return Ok(TransportStatus::Inactive),
		};
		if no_reply {
			// fire and forget; the request keeps running in its task
			return Ok(TransportStatus::Inactive);
		}

		match tokio::time::timeout(self.timeout, pending).await {
			Err(_) => Ok(TransportStatus::TimeOut),
			Ok(Err(join_err)) => {
				if join_err.is_cancelled() {
					Ok(TransportStatus::Failed)
				} else {
					Err(TransportError::Failed { message: join_err.to_string() })
				}
			}
			Ok(Ok(Err(e))) => {
				debug!("HTTP exchange failed: {}", e);
				Ok(TransportStatus::Failed)
			}
			Ok(Ok(Ok(reply))) => {
				self.reply = Some(reply);
				Ok(TransportStatus::GotReply)
			}
		}
	}

	fn get_reply(&self) -> Option<(Vec<u8>, String)> {
		self.reply.clone()
	}

	fn cancel(&mut self) {
		self.canceled = true;
		if let Some(pending) = self.pending.take() {
			pending.abort();
		}
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		self.cancel();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_send_without_url_is_misuse() {
		let mut transport = HttpTransport::new(TlsOptions::default());
		assert!(matches!(
			transport.send(b"hello").await,
			Err(TransportError::BadState { .. })
		));
	}

	#[tokio::test]
	async fn test_wait_without_send_is_inactive() {
		let mut transport = HttpTransport::new(TlsOptions::default());
		assert_eq!(transport.wait(false).await.unwrap(), TransportStatus::Inactive);
	}

	#[tokio::test]
	async fn test_cancel_marks_exchange_failed() {
		let mut transport = HttpTransport::new(TlsOptions::default());
		transport.set_url("http://127.0.0.1:9/unreachable");
		transport.set_timeout(5);
		transport.send(b"msg").await.unwrap();
		transport.cancel();
		assert_eq!(transport.wait(false).await.unwrap(), TransportStatus::Failed);
	}
}

// vim: ts=4
