//! Configuration types for the SOAP keyword library.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for the keyword library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Config version
    pub version: String,

    /// Keyword defaults
    pub settings: SettingsConfig,

    /// Default connection options for `Create client`
    pub client: ClientOptions,

    /// Envelope backend configuration
    pub envelope: EnvelopeConfig,

    /// Multipart/XOP assembly configuration
    pub multipart: MultipartConfig,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            client: ClientOptions::default(),
            envelope: EnvelopeConfig::default(),
            multipart: MultipartConfig::default(),
        }
    }
}

/// Keyword defaults used when a keyword call omits an argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Wrap the message part for XOP when calling operations with attachments
    pub xop: bool,

    /// Log outgoing requests of `Call operation`
    pub debug: bool,

    /// Default `to_log` for the logging keywords
    pub to_log: bool,

    /// Default `to_console` for the logging keywords
    pub to_console: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            xop: false,
            debug: false,
            to_log: true,
            to_console: false,
        }
    }
}

/// HTTP session options for a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// HTTP basic authentication
    pub auth: Option<BasicAuth>,

    /// Proxy URLs keyed by scheme: `http`, `https` or `all`
    pub proxies: BTreeMap<String, String>,

    /// Client certificate for mutual TLS
    pub cert: Option<ClientCert>,

    /// Verify the server certificate (unset means verify)
    pub verify: Option<bool>,

    /// Extra CA bundle (PEM) trusted for server verification
    pub ca_bundle: Option<PathBuf>,

    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
}

impl ClientOptions {
    /// Overlay `other` on top of these options; set fields in `other` win.
    pub fn merged_with(&self, other: &ClientOptions) -> ClientOptions {
        let mut proxies = self.proxies.clone();
        proxies.extend(other.proxies.clone());
        ClientOptions {
            auth: other.auth.clone().or_else(|| self.auth.clone()),
            proxies,
            cert: other.cert.clone().or_else(|| self.cert.clone()),
            verify: other.verify.or(self.verify),
            ca_bundle: other.ca_bundle.clone().or_else(|| self.ca_bundle.clone()),
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
        }
    }
}

/// HTTP basic authentication credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// PEM client certificate, with the key either inline in `cert` or separate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCert {
    pub cert: PathBuf,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Configuration of the built-in envelope backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// SOAP version of outgoing envelopes
    pub soap_version: SoapVersion,

    /// Namespace of operation elements
    pub target_namespace: String,

    /// Prefix bound to `target_namespace`
    pub target_prefix: String,

    /// Additional prefix -> namespace URI bindings declared on the envelope
    pub namespaces: BTreeMap<String, String>,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            soap_version: SoapVersion::Soap11,
            target_namespace: "http://tempuri.org/".to_string(),
            target_prefix: "tns".to_string(),
            namespaces: BTreeMap::new(),
        }
    }
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

/// Multipart/XOP assembly configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipartConfig {
    /// Literal placeholder rewrites applied to XOP message parts
    pub xop_includes: Vec<XopIncludeRule>,

    /// Content type used when an attachment type cannot be guessed
    pub fallback_mimetype: String,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            xop_includes: Vec::new(),
            fallback_mimetype: "application/octet-stream".to_string(),
        }
    }
}

/// Rewrites `placeholder` in the message into an `xop:Include` of `content_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XopIncludeRule {
    pub placeholder: String,
    pub content_id: String,
}
