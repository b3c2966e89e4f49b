//! MIME multipart/related assembly for operation calls with attachments.
//!
//! The message part always comes first with `Content-ID: <message>`,
//! followed by one part per attachment keyed by its file name. Under XOP
//! the message part is `application/xop+xml` and configured placeholders
//! are rewritten into `xop:Include` references.

use crate::attachment::{Attachment, AttachmentContents};
use crate::client::{Headers, MessageBuilder, OperationArgs, Transport, TransportResponse};
use crate::config::XopIncludeRule;
use crate::error::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::cell::Cell;
use tracing::{debug, info, warn};

/// XOP include namespace.
pub const XOP_NS: &str = "http://www.w3.org/2004/08/xop/include";

/// Content-ID of the message part.
pub const MESSAGE_CONTENT_ID: &str = "<message>";

const CRLF: &str = "\r\n";
const BASE64_LINE: usize = 76;

/// A serialized multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartBody {
    /// Container header fields (`MIME-Version`, `Content-Type`)
    pub headers: Headers,
    /// Parts, without the container headers
    pub body: String,
    /// Boundary separating the parts
    pub boundary: String,
}

/// How the request body of one operation call is produced.
#[derive(Debug, Clone, Copy)]
pub enum BodyStrategy<'a> {
    /// Send the body serialized by the backend
    Plain,
    /// Replace the first body with a multipart request
    Multipart {
        attachments: &'a [Attachment],
        xop: bool,
        xop_includes: &'a [XopIncludeRule],
    },
}

/// Transport handed to the backend for a single operation call.
///
/// Applies the call's [`BodyStrategy`] to the first post only; any further
/// posts go to the client transport unchanged.
pub struct CallTransport<'a, B: ?Sized> {
    inner: &'a dyn Transport,
    builder: &'a B,
    operation: &'a str,
    args: &'a OperationArgs,
    strategy: BodyStrategy<'a>,
    debug: bool,
    pending: Cell<bool>,
}

impl<'a, B: MessageBuilder + ?Sized> CallTransport<'a, B> {
    pub fn new(
        inner: &'a dyn Transport,
        builder: &'a B,
        operation: &'a str,
        args: &'a OperationArgs,
        strategy: BodyStrategy<'a>,
        debug: bool,
    ) -> Self {
        Self {
            inner,
            builder,
            operation,
            args,
            strategy,
            debug,
            pending: Cell::new(true),
        }
    }

    fn post_multipart(
        &self,
        address: &str,
        headers: &Headers,
        attachments: &[Attachment],
        xop: bool,
        xop_includes: &[XopIncludeRule],
    ) -> Result<TransportResponse> {
        let message = self.builder.create_message(self.operation, self.args)?;
        let multipart = build_multipart_body(&message, attachments, xop, xop_includes);

        let merged = merge_headers(headers, multipart.headers);

        debug!(
            operation = %self.operation,
            boundary = %multipart.boundary,
            parts = attachments.len() + 1,
            "Rewrote request as multipart/related"
        );

        self.log_request(address, &merged, &multipart.body);
        self.inner.post(address, multipart.body.as_bytes(), &merged)
    }

    fn log_request(&self, address: &str, headers: &Headers, body: &str) {
        if self.debug {
            info!(
                operation = %self.operation,
                address = %address,
                headers = ?headers,
                body = %body,
                "Outgoing SOAP request"
            );
        }
    }
}

impl<B: MessageBuilder + ?Sized> Transport for CallTransport<'_, B> {
    fn post(&self, address: &str, body: &[u8], headers: &Headers) -> Result<TransportResponse> {
        if let BodyStrategy::Multipart {
            attachments,
            xop,
            xop_includes,
        } = self.strategy
        {
            if self.pending.replace(false) {
                return self.post_multipart(address, headers, attachments, xop, xop_includes);
            }
        }

        self.log_request(address, headers, &String::from_utf8_lossy(body));
        self.inner.post(address, body, headers)
    }
}

/// Build a multipart/related request from `message` and `attachments`.
pub fn build_multipart_body(
    message: &str,
    attachments: &[Attachment],
    xop: bool,
    xop_includes: &[XopIncludeRule],
) -> MultipartBody {
    let boundary = format!("=============={}==", uuid::Uuid::new_v4().simple());
    build_with_boundary(message, attachments, xop, xop_includes, boundary)
}

fn build_with_boundary(
    message: &str,
    attachments: &[Attachment],
    xop: bool,
    xop_includes: &[XopIncludeRule],
    boundary: String,
) -> MultipartBody {
    let mut writer = PartWriter::new(&boundary);

    let (message_type, container_type) = if xop {
        (
            r#"application/xop+xml; charset="utf-8"; type="text/xml""#,
            format!(
                r#"multipart/related; boundary="{boundary}"; type="application/xop+xml"; start="{MESSAGE_CONTENT_ID}"; start-info="text/xml""#
            ),
        )
    } else {
        (
            r#"text/xml; charset="utf-8""#,
            format!(r#"multipart/related; boundary="{boundary}"; type="text/xml"; start="{MESSAGE_CONTENT_ID}""#),
        )
    };

    let message = if xop {
        apply_xop_includes(message, xop_includes)
    } else {
        message.to_string()
    };

    writer.part(
        &[
            ("Content-Type", message_type.to_string()),
            ("Content-Transfer-Encoding", "8bit".to_string()),
            ("Content-ID", MESSAGE_CONTENT_ID.to_string()),
        ],
        &message,
    );

    for attachment in attachments {
        let Some((content_type, encoding, payload)) = encode_attachment(attachment) else {
            warn!(
                filename = %attachment.filename,
                mimetype = %attachment.mimetype,
                "Unsupported attachment type, skipping part"
            );
            continue;
        };

        let extra = extra_headers(attachment);
        let mut headers = vec![
            ("Content-Type", content_type),
            ("Content-Transfer-Encoding", encoding.to_string()),
            ("Content-ID", format!("<{}>", attachment.filename)),
            (
                "Content-Disposition",
                format!(r#"attachment; filename="{}""#, quote_param(&attachment.filename)),
            ),
        ];
        for (name, value) in &extra {
            if headers.iter().any(|(set, _)| set.eq_ignore_ascii_case(name)) {
                debug!(
                    filename = %attachment.filename,
                    header = %name,
                    "Ignoring attachment header that would override a generated one"
                );
                continue;
            }
            headers.push((name.as_str(), value.clone()));
        }

        writer.part(&headers, &payload);
    }

    let mut headers = Headers::new();
    headers.insert("MIME-Version".to_string(), "1.0".to_string());
    headers.insert("Content-Type".to_string(), container_type);

    MultipartBody {
        headers,
        body: writer.finish(),
        boundary,
    }
}

/// Content type, transfer encoding and encoded payload of an attachment part.
fn encode_attachment(attachment: &Attachment) -> Option<(String, &'static str, String)> {
    let mimetype = &attachment.mimetype;
    match mimetype.maintype.as_str() {
        "image" | "application" => Some((
            mimetype.to_string(),
            "base64",
            encode_base64(attachment.contents.as_bytes()),
        )),
        "text" => match attachment.contents.as_text() {
            Some(text) => Some((
                format!(r#"{mimetype}; charset="utf-8""#),
                "8bit",
                text.into_owned(),
            )),
            None => Some((
                mimetype.to_string(),
                "base64",
                encode_base64(attachment.contents.as_bytes()),
            )),
        },
        _ => None,
    }
}

/// `Name: value` lines of an attachment's extra headers.
fn extra_headers(attachment: &Attachment) -> Vec<(String, String)> {
    let Some(raw) = attachment.http_headers.as_deref() else {
        return Vec::new();
    };

    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                Some((name.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                debug!(
                    filename = %attachment.filename,
                    line = %line,
                    "Ignoring attachment header line without a field name"
                );
                None
            }
        })
        .collect()
}

/// Rewrite configured placeholders into XOP include references.
pub fn apply_xop_includes(message: &str, rules: &[XopIncludeRule]) -> String {
    rules.iter().fold(message.to_string(), |message, rule| {
        let include = format!(
            r#"<xop:Include xmlns:xop="{XOP_NS}" href="cid:{}"/>"#,
            rule.content_id
        );
        message.replace(&rule.placeholder, &include)
    })
}

/// Merge multipart container headers over the original request headers.
///
/// Names are compared case-insensitively. A SOAP 1.2 `action` parameter of
/// the original `Content-Type` is carried onto the container type.
fn merge_headers(original: &Headers, container: Headers) -> Headers {
    let action = original
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
        .and_then(|(_, value)| content_type_param(value, "action"));

    let mut merged = original.clone();
    merged.retain(|name, _| !container.keys().any(|k| k.eq_ignore_ascii_case(name)));
    merged.extend(container);

    if let Some(action) = action {
        if let Some(content_type) = merged.get_mut("Content-Type") {
            content_type.push_str(&format!(r#"; action="{}""#, quote_param(&action)));
        }
    }
    merged
}

/// Value of parameter `name` in a header value like `type/sub; a="b"`.
fn content_type_param(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, raw) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let raw = raw.trim();
        let unquoted = raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(raw);
        Some(unquoted.replace("\\\"", "\"").replace("\\\\", "\\"))
    })
}

fn encode_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(BASE64_LINE)
        .map(|line| std::str::from_utf8(line).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(CRLF)
}

fn quote_param(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

struct PartWriter<'a> {
    boundary: &'a str,
    out: String,
}

impl<'a> PartWriter<'a> {
    fn new(boundary: &'a str) -> Self {
        Self {
            boundary,
            out: String::new(),
        }
    }

    fn part(&mut self, headers: &[(&str, String)], body: &str) {
        self.out.push_str("--");
        self.out.push_str(self.boundary);
        self.out.push_str(CRLF);
        for (name, value) in headers {
            self.out.push_str(name);
            self.out.push_str(": ");
            self.out.push_str(value);
            self.out.push_str(CRLF);
        }
        self.out.push_str(CRLF);
        self.out.push_str(body);
        self.out.push_str(CRLF);
    }

    fn finish(mut self) -> String {
        self.out.push_str("--");
        self.out.push_str(self.boundary);
        self.out.push_str("--");
        self.out.push_str(CRLF);
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{EchoBackend, RecordingTransport};

    fn attachment(filename: &str, mimetype: &str, contents: AttachmentContents) -> Attachment {
        Attachment {
            filename: filename.to_string(),
            contents,
            mimetype: mimetype.parse().unwrap(),
            http_headers: None,
        }
    }

    fn build(message: &str, attachments: &[Attachment], xop: bool, rules: &[XopIncludeRule]) -> MultipartBody {
        build_with_boundary(message, attachments, xop, rules, "BOUNDARY".to_string())
    }

    #[test]
    fn test_message_part_plain() {
        let body = build("<Add/>", &[], false, &[]);
        assert_eq!(
            body.body,
            "--BOUNDARY\r\n\
             Content-Type: text/xml; charset=\"utf-8\"\r\n\
             Content-Transfer-Encoding: 8bit\r\n\
             Content-ID: <message>\r\n\
             \r\n\
             <Add/>\r\n\
             --BOUNDARY--\r\n"
        );
        assert_eq!(body.headers["MIME-Version"], "1.0");
        assert_eq!(
            body.headers["Content-Type"],
            r#"multipart/related; boundary="BOUNDARY"; type="text/xml"; start="<message>""#
        );
    }

    #[test]
    fn test_message_part_xop() {
        let body = build("<Add/>", &[], true, &[]);
        assert!(body
            .body
            .contains(r#"Content-Type: application/xop+xml; charset="utf-8"; type="text/xml""#));
        assert!(body.headers["Content-Type"].contains(r#"type="application/xop+xml""#));
        assert!(body.headers["Content-Type"].contains(r#"start-info="text/xml""#));
    }

    #[test]
    fn test_one_part_per_attachment() {
        let attachments = vec![
            attachment("image.png", "image/png", AttachmentContents::Binary(vec![0x89, 0x50, 0x4e, 0x47])),
            attachment("doc.pdf", "application/pdf", AttachmentContents::Binary(b"%PDF".to_vec())),
            attachment("note.txt", "text/plain", AttachmentContents::Text("hello".to_string())),
        ];
        let body = build("<Upload/>", &attachments, false, &[]);

        assert_eq!(body.body.matches("--BOUNDARY\r\n").count(), 4);
        assert!(body.body.contains("Content-ID: <message>"));
        for name in ["image.png", "doc.pdf", "note.txt"] {
            assert!(body.body.contains(&format!("Content-ID: <{name}>")));
            assert!(body
                .body
                .contains(&format!(r#"Content-Disposition: attachment; filename="{name}""#)));
        }

        assert!(body.body.contains("Content-Type: image/png\r\nContent-Transfer-Encoding: base64"));
        assert!(body.body.contains("iVBORw==")); // base64 of the PNG magic
        assert!(body.body.contains("JVBERg==")); // "%PDF", read from the attachment itself
        assert!(body
            .body
            .contains("Content-Type: text/plain; charset=\"utf-8\"\r\nContent-Transfer-Encoding: 8bit"));
        assert!(body.body.contains("\r\n\r\nhello\r\n"));
    }

    #[test]
    fn test_binary_text_attachment_falls_back_to_base64() {
        let attachments = vec![attachment(
            "raw.txt",
            "text/plain",
            AttachmentContents::Binary(vec![0xff, 0xfe, 0x00]),
        )];
        let body = build("<m/>", &attachments, false, &[]);
        assert!(body.body.contains("Content-Type: text/plain\r\nContent-Transfer-Encoding: base64"));
        assert!(body.body.contains("//4A"));
    }

    #[test]
    fn test_unknown_maintype_is_skipped() {
        let attachments = vec![
            attachment("song.mp3", "audio/mpeg", AttachmentContents::Binary(vec![1, 2])),
            attachment("a.bin", "application/octet-stream", AttachmentContents::Binary(vec![1, 2])),
        ];
        let body = build("<m/>", &attachments, false, &[]);
        assert!(!body.body.contains("song.mp3"));
        assert!(body.body.contains("Content-ID: <a.bin>"));
    }

    #[test]
    fn test_long_base64_is_wrapped() {
        let attachments = vec![attachment(
            "big.bin",
            "application/octet-stream",
            AttachmentContents::Binary(vec![7u8; 200]),
        )];
        let body = build("<m/>", &attachments, false, &[]);
        let part = body.body.split("Content-Disposition").nth(1).unwrap();
        let longest = part.split("\r\n").map(str::len).max().unwrap();
        assert!(longest <= BASE64_LINE);
    }

    #[test]
    fn test_extra_headers() {
        let mut with_headers = attachment("a.png", "image/png", AttachmentContents::Binary(vec![1]));
        with_headers.http_headers = Some("X-Custom: yes\nnot a header line".to_string());
        let body = build("<m/>", &[with_headers], false, &[]);
        assert!(body.body.contains("X-Custom: yes\r\n"));
        assert!(!body.body.contains("not a header line"));
    }

    #[test]
    fn test_extra_headers_do_not_override_generated() {
        let mut with_headers = attachment("a.png", "image/png", AttachmentContents::Binary(vec![1]));
        with_headers.http_headers = Some("content-type: text/html\nContent-ID: <evil>\nX-Trace: 7".to_string());
        let body = build("<m/>", &[with_headers], false, &[]);

        assert_eq!(body.body.matches("Content-Type: image/png").count(), 1);
        assert!(!body.body.to_ascii_lowercase().contains("content-type: text/html"));
        assert!(!body.body.contains("<evil>"));
        assert!(body.body.contains("Content-ID: <a.png>\r\n"));
        assert!(body.body.contains("X-Trace: 7\r\n"));
    }

    #[test]
    fn test_merge_headers_keeps_soap_12_action() {
        let mut original = Headers::new();
        original.insert(
            "Content-Type".to_string(),
            r#"application/soap+xml; charset=utf-8; action="http://tempuri.org/Add""#.to_string(),
        );
        original.insert("X-Request".to_string(), "1".to_string());
        let container = build("<m/>", &[], false, &[]).headers;

        let merged = merge_headers(&original, container);
        assert!(merged["Content-Type"].starts_with("multipart/related"));
        assert!(merged["Content-Type"].ends_with(r#"; action="http://tempuri.org/Add""#));
        assert_eq!(merged["X-Request"], "1");
        assert_eq!(merged["MIME-Version"], "1.0");
    }

    #[test]
    fn test_merge_headers_without_action() {
        let mut original = Headers::new();
        original.insert("content-type".to_string(), "text/xml; charset=utf-8".to_string());
        let merged = merge_headers(&original, build("<m/>", &[], false, &[]).headers);
        assert!(!merged.contains_key("content-type"));
        assert!(!merged["Content-Type"].contains("action="));
    }

    #[test]
    fn test_content_type_param() {
        let value = r#"application/soap+xml; charset=utf-8; ACTION="urn:a\"b""#;
        assert_eq!(content_type_param(value, "action").as_deref(), Some(r#"urn:a"b"#));
        assert_eq!(content_type_param(value, "charset").as_deref(), Some("utf-8"));
        assert_eq!(content_type_param(value, "boundary"), None);
        assert_eq!(content_type_param("action=x", "action"), None);
    }

    #[test]
    fn test_xop_include_rewrite() {
        let rules = vec![XopIncludeRule {
            placeholder: "<Data>cid:payload</Data>".to_string(),
            content_id: "payload.bin".to_string(),
        }];
        let message = "<Upload><Data>cid:payload</Data></Upload>";

        let body = build(message, &[], true, &rules);
        assert!(body.body.contains(
            r#"<Upload><xop:Include xmlns:xop="http://www.w3.org/2004/08/xop/include" href="cid:payload.bin"/></Upload>"#
        ));

        // Rules only apply under XOP.
        let plain = build(message, &[], false, &rules);
        assert!(plain.body.contains(message));
    }

    #[test]
    fn test_fresh_boundary_per_body() {
        let a = build_multipart_body("<m/>", &[], false, &[]);
        let b = build_multipart_body("<m/>", &[], false, &[]);
        assert_ne!(a.boundary, b.boundary);
        assert!(a.headers["Content-Type"].contains(&a.boundary));
        assert!(a.body.ends_with(&format!("--{}--\r\n", a.boundary)));
    }

    #[test]
    fn test_call_transport_rewrites_only_first_post() {
        let recorder = RecordingTransport::default();
        let backend = EchoBackend::default();
        let args = OperationArgs::new();
        let attachments = vec![attachment("a.png", "image/png", AttachmentContents::Binary(vec![1]))];
        let transport = CallTransport::new(
            &recorder,
            &backend,
            "Upload",
            &args,
            BodyStrategy::Multipart {
                attachments: &attachments,
                xop: false,
                xop_includes: &[],
            },
            true,
        );

        let mut headers = Headers::new();
        headers.insert("content-type".to_string(), "text/xml".to_string());
        headers.insert("SOAPAction".to_string(), "\"Upload\"".to_string());
        transport.post("http://x", b"<original/>", &headers).unwrap();
        transport.post("http://x", b"<second/>", &headers).unwrap();

        let posts = recorder.posts.borrow();
        assert_eq!(posts.len(), 2);
        assert!(!posts[0].body.contains("<original/>"));
        assert!(posts[0].body.contains("<Upload>{}</Upload>"));
        assert!(!posts[0].headers.contains_key("content-type"));
        assert!(posts[0].headers["Content-Type"].starts_with("multipart/related"));
        assert_eq!(posts[0].headers["SOAPAction"], "\"Upload\"");
        assert_eq!(posts[1].body, "<second/>");
        assert_eq!(posts[1].headers["content-type"], "text/xml");
    }

    #[test]
    fn test_call_transport_plain_passes_through() {
        let recorder = RecordingTransport::default();
        let backend = EchoBackend::default();
        let args = OperationArgs::new();
        let transport = CallTransport::new(&recorder, &backend, "Ping", &args, BodyStrategy::Plain, false);

        transport.post("http://x", b"<Ping/>", &Headers::new()).unwrap();
        assert_eq!(recorder.posts.borrow()[0].body, "<Ping/>");
    }
}
