//! Keyword-driven SOAP client library
//!
//! Manages a set of named SOAP clients for test automation and lets files
//! be attached to operation calls as MIME multipart/related requests.
//!
//! # Features
//!
//! - Client registry with aliases and an active client
//! - File attachments with MIME type detection
//! - multipart/related and XOP request assembly
//! - Pluggable transport and SOAP backend factories
//! - Blocking HTTP transport with auth, proxies and client certificates
//! - String-keyed keyword dispatch for test runners
//!
//! # Example
//!
//! ```ignore
//! use zentinel_soap_keywords::{KeywordLibrary, LibraryConfig};
//! use zentinel_soap_keywords::attachment::AttachmentSource;
//!
//! let mut library = KeywordLibrary::new(LibraryConfig::default());
//! library.create_client("http://calc.test/service", Some("calc"), &Default::default())?;
//! library.add_attachment(AttachmentSource::new("report.pdf".as_ref()))?;
//! let result = library.call_operation("Upload", Some(true), None, &Default::default())?;
//! ```

pub mod attachment;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod keywords;
pub mod multipart;
pub mod registry;
pub mod transport;

pub use attachment::{Attachment, AttachmentContents, MimeType};
pub use client::{ClientHandle, SoapClient};
pub use config::LibraryConfig;
pub use error::{Result, SoapClientError};
pub use keywords::{KeywordCall, KeywordLibrary, KeywordSuite};
pub use registry::ClientRegistry;
