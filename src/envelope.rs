//! Built-in SOAP backend for document/literal endpoints.
//!
//! The connection descriptor is taken as the endpoint address; no WSDL is
//! read. Requests are written from named arguments and responses are read
//! back into JSON values. quick-xml never expands entities, and DOCTYPE
//! declarations in responses are rejected outright.

use crate::client::{
    ClientFactory, Headers, MessageBuilder, OperationArgs, ServiceInvoker, SoapBackend, Transport,
};
use crate::config::{EnvelopeConfig, SoapVersion};
use crate::error::{Result, SoapClientError};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::{debug, warn};

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

const SOAP_PREFIX: &str = "soap";

impl SoapVersion {
    /// Envelope namespace URI.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }
}

/// SOAP backend writing envelopes from named arguments.
#[derive(Debug, Clone)]
pub struct EnvelopeClient {
    address: String,
    config: EnvelopeConfig,
}

impl EnvelopeClient {
    pub fn new(address: impl Into<String>, config: EnvelopeConfig) -> Self {
        Self {
            address: address.into(),
            config,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// SOAPAction of `operation`.
    fn action(&self, operation: &str) -> String {
        let ns = &self.config.target_namespace;
        if ns.ends_with('/') || ns.ends_with('#') {
            format!("{ns}{operation}")
        } else {
            format!("{ns}/{operation}")
        }
    }

    fn request_headers(&self, operation: &str) -> Headers {
        let action = self.action(operation);
        let mut headers = Headers::new();
        match self.config.soap_version {
            SoapVersion::Soap11 => {
                headers.insert("Content-Type".to_string(), "text/xml; charset=utf-8".to_string());
                headers.insert("SOAPAction".to_string(), format!("\"{action}\""));
            }
            SoapVersion::Soap12 => {
                headers.insert(
                    "Content-Type".to_string(),
                    format!("application/soap+xml; charset=utf-8; action=\"{action}\""),
                );
            }
        }
        headers
    }
}

impl MessageBuilder for EnvelopeClient {
    fn create_message(&self, operation: &str, args: &OperationArgs) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

        let envelope_name = format!("{SOAP_PREFIX}:Envelope");
        let body_name = format!("{SOAP_PREFIX}:Body");

        let mut envelope = BytesStart::new(envelope_name.as_str());
        envelope.push_attribute((format!("xmlns:{SOAP_PREFIX}").as_str(), self.config.soap_version.namespace()));
        envelope.push_attribute((
            format!("xmlns:{}", self.config.target_prefix).as_str(),
            self.config.target_namespace.as_str(),
        ));
        for (prefix, uri) in &self.config.namespaces {
            envelope.push_attribute((format!("xmlns:{prefix}").as_str(), uri.as_str()));
        }

        writer.write_event(Event::Start(envelope))?;
        writer.write_event(Event::Start(BytesStart::new(body_name.as_str())))?;
        write_element(
            &mut writer,
            &format!("{}:{}", self.config.target_prefix, operation),
            &Value::Object(args.clone()),
        )?;
        writer.write_event(Event::End(BytesEnd::new(body_name.as_str())))?;
        writer.write_event(Event::End(BytesEnd::new(envelope_name.as_str())))?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| SoapClientError::Xml(format!("Invalid UTF-8 in message: {e}")))
    }
}

impl ServiceInvoker for EnvelopeClient {
    fn invoke(&self, operation: &str, args: &OperationArgs, transport: &dyn Transport) -> Result<Value> {
        let body = self.create_message(operation, args)?;
        let headers = self.request_headers(operation);

        let response = transport.post(&self.address, body.as_bytes(), &headers)?;
        debug!(
            operation = %operation,
            status = response.status,
            size = response.body.len(),
            "Received SOAP response"
        );

        let text = std::str::from_utf8(&response.body)
            .map_err(|e| SoapClientError::Xml(format!("Invalid UTF-8 in response: {e}")))?;

        if text.trim().is_empty() {
            if (200..300).contains(&response.status) {
                return Ok(Value::Null);
            }
            return Err(SoapClientError::Transport(format!(
                "HTTP status {} with empty body",
                response.status
            )));
        }

        // Faults arrive with HTTP 500 and must be surfaced as faults.
        let result = parse_response(text)?;
        if !(200..300).contains(&response.status) {
            warn!(status = response.status, "SOAP response with non-success status");
            return Err(SoapClientError::Transport(format!("HTTP status {}", response.status)));
        }
        Ok(result)
    }
}

impl SoapBackend for EnvelopeClient {
    fn namespaces(&self) -> BTreeMap<String, String> {
        let mut namespaces = self.config.namespaces.clone();
        namespaces.insert(SOAP_PREFIX.to_string(), self.config.soap_version.namespace().to_string());
        namespaces.insert(self.config.target_prefix.clone(), self.config.target_namespace.clone());
        namespaces
    }

    fn create_object(&self, type_name: &str, args: &[Value], kwargs: &OperationArgs) -> Result<Value> {
        let mut object = Map::new();
        object.insert("_type".to_string(), Value::String(type_name.to_string()));
        if !args.is_empty() {
            object.insert("_args".to_string(), Value::Array(args.to_vec()));
        }
        object.extend(kwargs.clone());
        Ok(Value::Object(object))
    }

    fn describe(&self) -> String {
        let mut out = format!(
            "Endpoint: {}\nSOAP version: {}\nTarget namespace: {}\nPrefixes:\n",
            self.address,
            match self.config.soap_version {
                SoapVersion::Soap11 => "1.1",
                SoapVersion::Soap12 => "1.2",
            },
            self.config.target_namespace
        );
        for (prefix, uri) in self.namespaces() {
            out.push_str(&format!("     {prefix}: {uri}\n"));
        }
        out
    }
}

/// Creates [`EnvelopeClient`]s from endpoint addresses.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeClientFactory {
    config: EnvelopeConfig,
}

impl EnvelopeClientFactory {
    pub fn new(config: EnvelopeConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for EnvelopeClientFactory {
    fn create_backend(&self, descriptor: &str, _transport: &dyn Transport) -> Result<Box<dyn SoapBackend>> {
        if descriptor.trim().is_empty() {
            return Err(SoapClientError::Config("Empty endpoint address".to_string()));
        }
        Ok(Box::new(EnvelopeClient::new(descriptor.trim(), self.config.clone())))
    }
}

fn write_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, value: &Value) -> Result<()> {
    match value {
        Value::Null => {
            writer.write_event(Event::Empty(BytesStart::new(name)))?;
        }
        Value::Array(items) => {
            for item in items {
                write_element(writer, name, item)?;
            }
        }
        Value::Object(fields) if fields.is_empty() => {
            writer.write_event(Event::Empty(BytesStart::new(name)))?;
        }
        Value::Object(fields) => {
            writer.write_event(Event::Start(BytesStart::new(name)))?;
            for (field, value) in fields {
                write_element(writer, field, value)?;
            }
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }
        Value::String(text) => write_text(writer, name, text)?,
        Value::Bool(_) | Value::Number(_) => write_text(writer, name, &value.to_string())?,
    }
    Ok(())
}

fn write_text(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// An element being read.
struct Frame {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Frame {
    fn new(name: String) -> Self {
        Self {
            name,
            fields: Map::new(),
            text: String::new(),
        }
    }

    fn into_value(self) -> Value {
        if !self.fields.is_empty() {
            Value::Object(self.fields)
        } else if self.text.is_empty() {
            Value::Null
        } else {
            Value::String(self.text)
        }
    }
}

/// Read a response envelope into the value of its first body element.
///
/// A `Fault` body element is returned as [`SoapClientError::Fault`].
pub fn parse_response(xml: &str) -> Result<Value> {
    check_doctype(xml)?;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth = 0u32;
    let mut in_envelope = false;
    let mut body_depth: Option<u32> = None;
    let mut stack: Vec<Frame> = Vec::new();
    let mut body: Vec<(String, Value)> = Vec::new();

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                let local_name = local_name_str(e);

                if !in_envelope && local_name == "Envelope" {
                    in_envelope = true;
                } else if in_envelope && body_depth.is_none() && local_name == "Body" {
                    body_depth = Some(depth);
                } else if body_depth.is_some() {
                    stack.push(Frame::new(local_name));
                }
            }

            Ok(Event::Empty(ref e)) => {
                let local_name = local_name_str(e);
                if in_envelope && body_depth.is_none() && local_name == "Body" {
                    // `<soap:Body/>` answers one-way and void operations.
                    return Ok(Value::Null);
                }
                if body_depth.is_some() {
                    close_frame(Frame::new(local_name), &mut stack, &mut body);
                }
            }

            Ok(Event::End(_)) => {
                if body_depth == Some(depth) {
                    break;
                }
                if let Some(frame) = stack.pop() {
                    close_frame(frame, &mut stack, &mut body);
                }
                depth = depth.saturating_sub(1);
            }

            Ok(Event::Text(ref e)) => {
                if let Some(frame) = stack.last_mut() {
                    let text = e.unescape()?;
                    frame.text.push_str(&text);
                }
            }

            Ok(Event::CData(e)) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }

            Ok(Event::Eof) => break,

            Err(e) => {
                return Err(SoapClientError::Xml(format!("XML parse error: {e}")));
            }

            _ => {}
        }

        buf.clear();
    }

    if !in_envelope {
        return Err(SoapClientError::Xml("No SOAP Envelope found in response".to_string()));
    }
    if body_depth.is_none() {
        return Err(SoapClientError::Xml("No SOAP Body found in response".to_string()));
    }

    match body.into_iter().next() {
        Some((name, fault)) if name == "Fault" => Err(fault_error(&fault)),
        Some((_, value)) => Ok(value),
        None => Ok(Value::Null),
    }
}

fn close_frame(frame: Frame, stack: &mut Vec<Frame>, body: &mut Vec<(String, Value)>) {
    let name = frame.name.clone();
    let value = frame.into_value();
    match stack.last_mut() {
        Some(parent) => insert_field(&mut parent.fields, name, value),
        None => body.push((name, value)),
    }
}

/// Repeated element names collect into an array.
fn insert_field(fields: &mut Map<String, Value>, name: String, value: Value) {
    match fields.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(name, value);
        }
    }
}

/// Map SOAP 1.1 (`faultcode`/`faultstring`) or 1.2 (`Code`/`Reason`) faults.
fn fault_error(fault: &Value) -> SoapClientError {
    let text = |value: Option<&Value>| -> Option<String> {
        match value? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    };

    let code = text(fault.get("faultcode"))
        .or_else(|| text(fault.pointer("/Code/Value")))
        .unwrap_or_else(|| "Unknown".to_string());
    let message = text(fault.get("faultstring"))
        .or_else(|| text(fault.pointer("/Reason/Text")))
        .unwrap_or_default();

    SoapClientError::Fault { code, message }
}

fn check_doctype(xml: &str) -> Result<()> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(SoapClientError::Xml(
            "DOCTYPE declarations are not allowed in responses".to_string(),
        ));
    }
    Ok(())
}

/// Extract local name from element.
fn local_name_str(e: &BytesStart) -> String {
    let name = e.local_name();
    std::str::from_utf8(name.as_ref()).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingTransport;

    const ADD_RESPONSE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <AddResponse xmlns="http://tempuri.org/">
      <AddResult>3</AddResult>
      <Item>a</Item>
      <Item>b &amp; c</Item>
    </AddResponse>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_11_FAULT: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode>soap:Client</faultcode>
      <faultstring>Invalid operand</faultstring>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_12_FAULT: &str = r#"<?xml version="1.0"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body>
    <env:Fault>
      <env:Code><env:Value>env:Sender</env:Value></env:Code>
      <env:Reason><env:Text xml:lang="en">Bad request</env:Text></env:Reason>
    </env:Fault>
  </env:Body>
</env:Envelope>"#;

    fn client() -> EnvelopeClient {
        EnvelopeClient::new("http://calc.test/service", EnvelopeConfig::default())
    }

    fn args() -> OperationArgs {
        let mut args = OperationArgs::new();
        args.insert("intA".to_string(), Value::from(1));
        args.insert("intB".to_string(), Value::from(2));
        args
    }

    #[test]
    fn test_create_message() {
        let message = client().create_message("Add", &args()).unwrap();
        assert!(message.starts_with(r#"<?xml version="1.0" encoding="utf-8"?>"#));
        assert!(message.contains(r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:tns="http://tempuri.org/">"#));
        assert!(message.contains("<soap:Body><tns:Add><intA>1</intA><intB>2</intB></tns:Add></soap:Body>"));
    }

    #[test]
    fn test_create_message_nested_and_escaped() {
        let mut args = OperationArgs::new();
        args.insert(
            "person".to_string(),
            serde_json::json!({"name": "A & B", "tags": ["x", "y"], "note": null}),
        );
        let message = client().create_message("Save", &args).unwrap();
        assert!(message.contains(
            "<tns:Save><person><name>A &amp; B</name><note/><tags>x</tags><tags>y</tags></person></tns:Save>"
        ));
    }

    #[test]
    fn test_create_message_without_args() {
        let message = client().create_message("Ping", &OperationArgs::new()).unwrap();
        assert!(message.contains("<soap:Body><tns:Ping/></soap:Body>"));
    }

    #[test]
    fn test_soap_12_message_and_headers() {
        let config = EnvelopeConfig {
            soap_version: SoapVersion::Soap12,
            ..Default::default()
        };
        let client = EnvelopeClient::new("http://calc.test/service", config);
        let message = client.create_message("Add", &args()).unwrap();
        assert!(message.contains(SOAP_12_NS));

        let headers = client.request_headers("Add");
        assert_eq!(
            headers["Content-Type"],
            "application/soap+xml; charset=utf-8; action=\"http://tempuri.org/Add\""
        );
        assert!(!headers.contains_key("SOAPAction"));
    }

    #[test]
    fn test_parse_response() {
        let value = parse_response(ADD_RESPONSE).unwrap();
        assert_eq!(value["AddResult"], "3");
        assert_eq!(value["Item"], serde_json::json!(["a", "b & c"]));
    }

    #[test]
    fn test_parse_empty_body() {
        let empty = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body/></soap:Envelope>"#;
        assert_eq!(parse_response(empty).unwrap(), Value::Null);

        let open_close = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body></soap:Body></soap:Envelope>"#;
        assert_eq!(parse_response(open_close).unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_soap_11_fault() {
        let err = parse_response(SOAP_11_FAULT).unwrap_err();
        assert!(matches!(
            err,
            SoapClientError::Fault { ref code, ref message } if code == "soap:Client" && message == "Invalid operand"
        ));
    }

    #[test]
    fn test_parse_soap_12_fault() {
        let err = parse_response(SOAP_12_FAULT).unwrap_err();
        assert!(matches!(
            err,
            SoapClientError::Fault { ref code, ref message } if code == "env:Sender" && message == "Bad request"
        ));
    }

    #[test]
    fn test_parse_rejects_doctype_and_non_soap() {
        let xxe = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>&xxe;</soap:Body></soap:Envelope>"#;
        assert!(matches!(parse_response(xxe), Err(SoapClientError::Xml(_))));
        assert!(matches!(parse_response("<html><body/></html>"), Err(SoapClientError::Xml(_))));
    }

    #[test]
    fn test_invoke_posts_envelope() {
        let transport = RecordingTransport::default();
        *transport.reply.borrow_mut() = ADD_RESPONSE.as_bytes().to_vec();

        let result = client().invoke("Add", &args(), &transport).unwrap();
        assert_eq!(result["AddResult"], "3");

        let posts = transport.posts.borrow();
        assert_eq!(posts[0].address, "http://calc.test/service");
        assert_eq!(posts[0].headers["SOAPAction"], "\"http://tempuri.org/Add\"");
        assert!(posts[0].body.contains("<tns:Add>"));
    }

    #[test]
    fn test_namespaces_and_describe() {
        let mut config = EnvelopeConfig::default();
        config.namespaces.insert("ns1".to_string(), "http://www.ns.fi".to_string());
        let client = EnvelopeClient::new("http://calc.test/service", config);

        let namespaces = client.namespaces();
        assert_eq!(namespaces["ns1"], "http://www.ns.fi");
        assert_eq!(namespaces["tns"], "http://tempuri.org/");
        assert_eq!(namespaces["soap"], SOAP_11_NS);

        let description = client.describe();
        assert!(description.contains("Endpoint: http://calc.test/service"));
        assert!(description.contains("ns1: http://www.ns.fi"));
    }

    #[test]
    fn test_create_object() {
        let mut kwargs = OperationArgs::new();
        kwargs.insert("x".to_string(), Value::from("1"));
        let object = client()
            .create_object("Add", &[Value::from("just_one")], &kwargs)
            .unwrap();
        assert_eq!(object["_type"], "Add");
        assert_eq!(object["_args"], serde_json::json!(["just_one"]));
        assert_eq!(object["x"], "1");
    }

    #[test]
    fn test_factory_rejects_empty_address() {
        let factory = EnvelopeClientFactory::default();
        let transport = RecordingTransport::default();
        assert!(factory.create_backend("  ", &transport).is_err());
        assert!(factory.create_backend("http://calc.test/service", &transport).is_ok());
    }
}
