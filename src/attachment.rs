//! File attachments queued on a client.
//!
//! Attachments are read fully into memory when added and stay on the client
//! until it is closed or the list is cleared explicitly.

use crate::error::{Result, SoapClientError};
use mime_guess::mime::Mime;
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Extensions marking a file as compressed or transfer-encoded.
const ENCODING_SUFFIXES: &[&str] = &["gz", "bz2", "xz", "z", "br", "zst"];

/// Content type used when nothing better is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Contents of an attachment as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentContents {
    /// Exact bytes of the file
    Binary(Vec<u8>),
    /// UTF-8 decoded text of the file
    Text(String),
}

impl AttachmentContents {
    /// Raw bytes of the contents.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    /// Contents as text, if they are valid UTF-8.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Text(text) => Some(Cow::Borrowed(text)),
            Self::Binary(bytes) => std::str::from_utf8(bytes).ok().map(Cow::Borrowed),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `maintype/subtype` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MimeType {
    pub maintype: String,
    pub subtype: String,
}

impl MimeType {
    pub fn new(maintype: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            maintype: maintype.into(),
            subtype: subtype.into(),
        }
    }

    /// `application/octet-stream`.
    pub fn octet_stream() -> Self {
        Self::new("application", "octet-stream")
    }
}

impl From<&Mime> for MimeType {
    fn from(mime: &Mime) -> Self {
        Self::new(mime.type_().as_str(), mime.subtype().as_str())
    }
}

impl FromStr for MimeType {
    type Err = SoapClientError;

    fn from_str(s: &str) -> Result<Self> {
        let mime: Mime = s
            .trim()
            .parse()
            .map_err(|_| SoapClientError::InvalidMimeType(s.to_string()))?;
        Ok(Self::from(&mime))
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.maintype, self.subtype)
    }
}

/// A file queued for the next operation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Name used for `Content-ID` and `Content-Disposition`
    pub filename: String,
    /// File contents
    pub contents: AttachmentContents,
    /// Content type
    pub mimetype: MimeType,
    /// Extra header lines copied verbatim into the attachment part
    pub http_headers: Option<String>,
}

/// Arguments of `Add attachment`.
#[derive(Debug, Clone)]
pub struct AttachmentSource<'a> {
    pub path: &'a Path,
    pub filename: Option<&'a str>,
    pub mimetype: Option<&'a str>,
    pub binary: bool,
    pub http_headers: Option<String>,
}

impl<'a> AttachmentSource<'a> {
    /// Binary attachment with everything else derived from `path`.
    pub fn new(path: &'a Path) -> Self {
        Self {
            path,
            filename: None,
            mimetype: None,
            binary: true,
            http_headers: None,
        }
    }
}

impl Attachment {
    /// Read the file described by `source`.
    ///
    /// Empty `filename` and `mimetype` count as omitted. Omitted values are
    /// derived from the path, with `fallback` used when the type is unknown.
    ///
    /// The file name ends up in part headers, so control characters are
    /// rejected with [`SoapClientError::InvalidFilename`].
    pub fn load(source: AttachmentSource<'_>, fallback: &MimeType) -> Result<Self> {
        let filename = match source.filename.filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => base_name(source.path),
        };
        if filename.chars().any(char::is_control) {
            return Err(SoapClientError::InvalidFilename(filename));
        }

        let contents = if source.binary {
            AttachmentContents::Binary(std::fs::read(source.path)?)
        } else {
            AttachmentContents::Text(std::fs::read_to_string(source.path)?)
        };

        let mimetype = match source.mimetype.filter(|m| !m.trim().is_empty()) {
            Some(m) => m.parse()?,
            None => guess_mimetype(&filename, fallback),
        };

        debug!(
            path = %source.path.display(),
            filename = %filename,
            mimetype = %mimetype,
            size = contents.len(),
            "Loaded attachment"
        );

        Ok(Self {
            filename,
            contents,
            mimetype,
            http_headers: source.http_headers,
        })
    }
}

/// Guess the content type from a file name's extension.
///
/// Compressed or encoded files (`.gz`, `.bz2`, ...) get `fallback`, as do
/// unknown extensions.
pub fn guess_mimetype(filename: &str, fallback: &MimeType) -> MimeType {
    let path = Path::new(filename);
    let encoded = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ENCODING_SUFFIXES.iter().any(|s| ext.eq_ignore_ascii_case(s)));
    if encoded {
        return fallback.clone();
    }

    mime_guess::from_path(path)
        .first()
        .map(|mime| MimeType::from(&mime))
        .unwrap_or_else(|| fallback.clone())
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
