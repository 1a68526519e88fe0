use bytes::Bytes;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_ENCODING: &str = "utf-8";

/// Response body with lazily derived text and JSON views
#[derive(Debug, Default)]
pub struct ResponsePayload {
    data: Bytes,
    file: Option<PathBuf>,
    encoding: String,
    from_cache: bool,
    text: OnceLock<Option<String>>,
    json: OnceLock<Option<Value>>,
}

impl ResponsePayload {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            encoding: DEFAULT_ENCODING.to_string(),
            ..Self::default()
        }
    }

    /// Body that was streamed to disk
    pub fn from_file(path: PathBuf) -> Self {
        Self {
            file: Some(path),
            encoding: DEFAULT_ENCODING.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn from_cache(data: Bytes, encoding: String) -> Self {
        Self {
            data,
            encoding,
            from_cache: true,
            ..Self::default()
        }
    }

    pub(crate) fn with_encoding(mut self, encoding: String) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    /// Body decoded as text; `None` if it is not valid in its encoding
    pub fn text(&self) -> Option<&str> {
        self.text
            .get_or_init(|| {
                if self.encoding.eq_ignore_ascii_case(DEFAULT_ENCODING)
                    || self.encoding.eq_ignore_ascii_case("utf8")
                {
                    std::str::from_utf8(&self.data).ok().map(str::to_string)
                } else {
                    None
                }
            })
            .as_deref()
    }

    /// Body decoded as JSON; `None` if empty or malformed
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| {
                if self.data.is_empty() {
                    None
                } else {
                    serde_json::from_slice(&self.data).ok()
                }
            })
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lazy_views() {
        let payload = ResponsePayload::from_bytes(r#"{"id": 7}"#);
        assert_eq!(payload.text(), Some(r#"{"id": 7}"#));
        assert_eq!(payload.json(), Some(&json!({"id": 7})));
        assert!(!payload.is_from_cache());
    }

    #[test]
    fn test_invalid_views() {
        let payload = ResponsePayload::from_bytes(vec![0xff, 0xfe]);
        assert!(payload.text().is_none());
        assert!(payload.json().is_none());

        let empty = ResponsePayload::from_bytes(Bytes::new());
        assert!(empty.json().is_none());
        assert_eq!(empty.text(), Some(""));
    }

    #[test]
    fn test_unsupported_encoding_has_no_text() {
        let payload = ResponsePayload::from_cache(Bytes::from_static(b"abc"), "latin1".into());
        assert!(payload.is_from_cache());
        assert!(payload.text().is_none());
    }
}
