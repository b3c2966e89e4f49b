//! SOAP clients and the collaborator traits they are built from.
//!
//! The crate does not interpret WSDL or sign envelopes itself. A client is
//! assembled from a [`Transport`] (the HTTP session) and a [`SoapBackend`]
//! (message construction and operation invocation), both created through
//! factories so tests and embedders can supply their own.

use crate::attachment::Attachment;
use crate::config::{ClientOptions, XopIncludeRule};
use crate::error::Result;
use crate::multipart::{BodyStrategy, CallTransport};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// HTTP header fields, ordered by name.
pub type Headers = BTreeMap<String, String>;

/// Named arguments of an operation.
pub type OperationArgs = Map<String, Value>;

/// Response of a transport post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends serialized requests.
pub trait Transport {
    /// Post `body` with `headers` to `address`.
    fn post(&self, address: &str, body: &[u8], headers: &Headers) -> Result<TransportResponse>;
}

/// Serializes operation requests.
pub trait MessageBuilder {
    /// Serialized request message for `operation` called with `args`.
    fn create_message(&self, operation: &str, args: &OperationArgs) -> Result<String>;
}

/// Invokes service operations.
pub trait ServiceInvoker {
    /// Call `operation`, sending the request through `transport`.
    fn invoke(&self, operation: &str, args: &OperationArgs, transport: &dyn Transport) -> Result<Value>;
}

/// Everything a registered client needs from its SOAP implementation.
pub trait SoapBackend: MessageBuilder + ServiceInvoker {
    /// Prefix -> namespace URI map of the service.
    fn namespaces(&self) -> BTreeMap<String, String>;

    /// Construct a value of the named service type.
    fn create_object(&self, type_name: &str, args: &[Value], kwargs: &OperationArgs) -> Result<Value>;

    /// Human readable description of the service.
    fn describe(&self) -> String;
}

/// Builds the HTTP session of a new client.
pub trait TransportFactory {
    fn create_transport(&self, options: &ClientOptions) -> Result<Box<dyn Transport>>;
}

/// Builds the SOAP backend of a new client.
pub trait ClientFactory {
    /// Backend for `descriptor`; `transport` may be used to fetch it.
    fn create_backend(&self, descriptor: &str, transport: &dyn Transport) -> Result<Box<dyn SoapBackend>>;
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identity of a client. Two handles are equal only for the same client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(u64);

impl ClientHandle {
    fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn from_id(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Per-call options of [`SoapClient::call_operation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions<'a> {
    /// Wrap the message part for XOP
    pub xop: bool,
    /// Log the outgoing request
    pub debug: bool,
    /// Placeholder rewrites applied under XOP
    pub xop_includes: &'a [XopIncludeRule],
}

/// A SOAP client with its pending attachments.
pub struct SoapClient {
    handle: ClientHandle,
    descriptor: String,
    backend: Box<dyn SoapBackend>,
    transport: Box<dyn Transport>,
    attachments: Vec<Attachment>,
}

impl fmt::Debug for SoapClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoapClient")
            .field("handle", &self.handle)
            .field("descriptor", &self.descriptor)
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

impl SoapClient {
    /// Create a client with an empty attachment list.
    pub fn new(
        descriptor: impl Into<String>,
        backend: Box<dyn SoapBackend>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            handle: ClientHandle::next(),
            descriptor: descriptor.into(),
            backend,
            transport,
            attachments: Vec::new(),
        }
    }

    /// Build the transport and backend through the factories.
    pub fn connect(
        descriptor: &str,
        options: &ClientOptions,
        transports: &dyn TransportFactory,
        backends: &dyn ClientFactory,
    ) -> Result<Self> {
        let transport = transports.create_transport(options)?;
        let backend = backends.create_backend(descriptor, transport.as_ref())?;
        Ok(Self::new(descriptor, backend, transport))
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn backend(&self) -> &dyn SoapBackend {
        self.backend.as_ref()
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn clear_attachments(&mut self) {
        self.attachments.clear();
    }

    /// Serialized request message for `operation`.
    pub fn create_message(&self, operation: &str, args: &OperationArgs) -> Result<String> {
        self.backend.create_message(operation, args)
    }

    /// Invoke `operation`.
    ///
    /// With pending attachments the first post of this call is rewritten
    /// into a multipart/related request. Attachments are not consumed.
    pub fn call_operation(
        &self,
        operation: &str,
        args: &OperationArgs,
        options: CallOptions<'_>,
    ) -> Result<Value> {
        let strategy = if self.attachments.is_empty() {
            BodyStrategy::Plain
        } else {
            BodyStrategy::Multipart {
                attachments: &self.attachments,
                xop: options.xop,
                xop_includes: options.xop_includes,
            }
        };

        debug!(
            client = %self.handle,
            operation = %operation,
            attachments = self.attachments.len(),
            xop = options.xop,
            "Calling operation"
        );

        let transport = CallTransport::new(
            self.transport.as_ref(),
            self.backend.as_ref(),
            operation,
            args,
            strategy,
            options.debug,
        );
        self.backend.invoke(operation, args, &transport)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::attachment::{AttachmentContents, MimeType};

    fn args() -> OperationArgs {
        let mut args = OperationArgs::new();
        args.insert("x".to_string(), Value::from(1));
        args.insert("y".to_string(), Value::from("2"));
        args
    }

    #[test]
    fn test_handles_are_unique() {
        let transport = RecordingTransport::default();
        let a = echo_client(&transport);
        let b = echo_client(&transport);
        assert_ne!(a.handle(), b.handle());
        assert_eq!(a.handle(), a.handle());
    }

    #[test]
    fn test_new_client_has_no_attachments() {
        let client = echo_client(&RecordingTransport::default());
        assert!(client.attachments().is_empty());
    }

    #[test]
    fn test_call_without_attachments_posts_plain_body() {
        let transport = RecordingTransport::default();
        let client = echo_client(&transport);

        let result = client.call_operation("Add", &args(), CallOptions::default()).unwrap();
        assert_eq!(result, Value::String("Add".to_string()));

        let posts = transport.posts.borrow();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].body, r#"<Add>{"x":1,"y":"2"}</Add>"#);
        assert_eq!(posts[0].headers["Content-Type"], "text/xml; charset=utf-8");
    }

    #[test]
    fn test_call_with_attachments_posts_multipart_body() {
        let transport = RecordingTransport::default();
        let mut client = echo_client(&transport);
        client.add_attachment(Attachment {
            filename: "note.txt".to_string(),
            contents: AttachmentContents::Text("hello".to_string()),
            mimetype: MimeType::new("text", "plain"),
            http_headers: None,
        });

        client.call_operation("Add", &args(), CallOptions::default()).unwrap();

        let posts = transport.posts.borrow();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].headers["Content-Type"].starts_with("multipart/related"));
        assert_eq!(posts[0].headers["SOAPAction"], "\"Add\"");
        assert!(posts[0].body.contains("Content-ID: <message>"));
        assert!(posts[0].body.contains("Content-ID: <note.txt>"));
        assert!(posts[0].body.contains(r#"<Add>{"x":1,"y":"2"}</Add>"#));

        // Attachments stay queued after the call.
        assert_eq!(client.attachments().len(), 1);
    }

    #[test]
    fn test_clear_attachments() {
        let mut client = echo_client(&RecordingTransport::default());
        client.add_attachment(Attachment {
            filename: "a.bin".to_string(),
            contents: AttachmentContents::Binary(vec![1, 2, 3]),
            mimetype: MimeType::octet_stream(),
            http_headers: None,
        });
        client.clear_attachments();
        assert!(client.attachments().is_empty());
    }

    #[test]
    fn test_connect_uses_factories() {
        let factory = FakeFactory::default();
        let options = ClientOptions {
            verify: Some(false),
            ..Default::default()
        };
        let client = SoapClient::connect("calculator.wsdl", &options, &factory, &factory).unwrap();
        assert_eq!(client.descriptor(), "calculator.wsdl");
        let created = factory.created.borrow();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "calculator.wsdl");
        assert_eq!(created[0].1.verify, Some(false));
    }
}
