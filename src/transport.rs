//! Blocking HTTP transport for SOAP clients.

use crate::client::{Headers, Transport, TransportFactory, TransportResponse};
use crate::config::{BasicAuth, ClientOptions};
use crate::error::{Result, SoapClientError};
use reqwest::blocking::Client as HttpClient;
use reqwest::{Certificate, Identity, Proxy};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP session shared by every request of one client.
pub struct HttpTransport {
    http_client: HttpClient,
    auth: Option<BasicAuth>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("auth", &self.auth.as_ref().map(|a| &a.username))
            .finish()
    }
}

impl HttpTransport {
    /// Build the session from client options.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let mut builder = HttpClient::builder().use_rustls_tls();

        if let Some(secs) = options.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        for (scheme, url) in &options.proxies {
            let proxy = match scheme.as_str() {
                "http" => Proxy::http(url)?,
                "https" => Proxy::https(url)?,
                "all" => Proxy::all(url)?,
                other => {
                    return Err(SoapClientError::Config(format!(
                        "Unsupported proxy scheme '{other}', expected http, https or all"
                    )))
                }
            };
            builder = builder.proxy(proxy);
        }

        if let Some(cert) = &options.cert {
            let mut pem = std::fs::read(&cert.cert)?;
            if let Some(key) = &cert.key {
                pem.push(b'\n');
                pem.extend(std::fs::read(key)?);
            }
            builder = builder.identity(Identity::from_pem(&pem)?);
        }

        if let Some(bundle) = &options.ca_bundle {
            let pem = std::fs::read(bundle)?;
            let certs = Certificate::from_pem_bundle(&pem)?;
            debug!(path = %bundle.display(), count = certs.len(), "Loaded CA bundle");
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if options.verify == Some(false) {
            warn!("TLS certificate verification is disabled for this client");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http_client: builder.build()?,
            auth: options.auth.clone(),
        })
    }
}

impl Transport for HttpTransport {
    fn post(&self, address: &str, body: &[u8], headers: &Headers) -> Result<TransportResponse> {
        let mut request = self.http_client.post(address).body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        debug!(address = %address, size = body.len(), "Posting SOAP request");
        let response = request.send()?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes()?.to_vec();

        Ok(TransportResponse { status, headers, body })
    }
}

/// Creates an [`HttpTransport`] per client.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn create_transport(&self, options: &ClientOptions) -> Result<Box<dyn Transport>> {
        Ok(Box::new(HttpTransport::new(options)?))
    }
}
