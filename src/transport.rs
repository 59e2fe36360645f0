//! Blocking request/response transport.
//!
//! The client only needs one operation: post a message body and read the
//! reply. Keeping it behind a trait lets tests run an in-process service.
use std::time::Duration;

use crate::error::Result;

/// One request/response exchange with the remote endpoint.
pub trait Transport: Send + Sync {
    fn exchange(&self, body: &[u8]) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn exchange(&self, body: &[u8]) -> Result<Vec<u8>> {
        (**self).exchange(body)
    }
}

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(feature = "http")]
pub use self::http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use reqwest::blocking::Client;

    use super::Transport;
    use crate::error::{Error, Result};

    /// HTTPS transport backed by a blocking reqwest client.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        endpoint: String,
        client: Client,
    }

    impl HttpTransport {
        pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
            let client = Client::builder()
                .user_agent(concat!("rsmsl/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .min_tls_version(reqwest::tls::Version::TLS_1_2)
                .build()
                .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))?;
            Ok(Self {
                endpoint: endpoint.into(),
                client,
            })
        }

        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    impl Transport for HttpTransport {
        fn exchange(&self, body: &[u8]) -> Result<Vec<u8>> {
            let response = self
                .client
                .post(&self.endpoint)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_vec())
                .send()
                .map_err(|e| {
                    if e.is_timeout() {
                        Error::Transport(format!("Request to {} timed out", self.endpoint))
                    } else {
                        Error::Transport(format!("Failed to contact {}: {}", self.endpoint, e))
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Transport(format!(
                    "Endpoint responded with {}: {}",
                    status,
                    response.text().unwrap_or_default()
                )));
            }

            response
                .bytes()
                .map(|b| b.to_vec())
                .map_err(|e| Error::Transport(format!("Failed to read response: {}", e)))
        }
    }
}
