// Adapter URIs: `<scheme>://<authority>?<query>`, with bare paths and `-` meaning local files.
use std::fmt;

use crate::core::error::{Error, ErrorKind};

pub const FILE_SCHEME: &str = "file";
pub const STDIO: &str = "-";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdapterUri {
    raw: String,
    scheme: String,
    authority: String,
    options: Vec<(String, String)>,
}

impl AdapterUri {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("empty adapter uri"));
        }
        let Some((scheme, rest)) = text.split_once("://") else {
            return Ok(Self {
                raw: text.to_string(),
                scheme: FILE_SCHEME.to_string(),
                authority: text.to_string(),
                options: Vec::new(),
            });
        };
        if !valid_scheme(scheme) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid uri scheme `{scheme}`"))
                .with_uri(text)
                .with_hint("Schemes start with a letter, e.g. file:// or gcs://."));
        }
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, query),
            None => (rest, ""),
        };
        let options = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect::<Vec<_>>();
        Ok(Self {
            raw: text.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_string(),
            options,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything between `://` and `?`; the file path for `file` URIs.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Last value given for `key`; later occurrences win.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn require_option(&self, key: &str) -> Result<&str, Error> {
        self.option(key).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("missing required `{key}` option"))
                .with_uri(self.raw.clone())
                .with_hint(format!("Append ?{key}=<value> to the uri."))
        })
    }

    pub fn is_stdio(&self) -> bool {
        self.scheme == FILE_SCHEME && self.authority == STDIO
    }
}

impl fmt::Display for AdapterUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(ch) if ch.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::AdapterUri;
    use crate::core::error::ErrorKind;

    #[test]
    fn blob_uri_keeps_project_and_bucket_in_authority() {
        let uri =
            AdapterUri::parse("gcs://test-project:test-bucket?path=/path/to/records/*/*.avro")
                .unwrap();
        assert_eq!(uri.scheme(), "gcs");
        assert_eq!(uri.authority(), "test-project:test-bucket");
        assert_eq!(uri.option("path"), Some("/path/to/records/*/*.avro"));
        assert_eq!(uri.option("selector"), None);
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let uri = AdapterUri::parse("gcs://p:b?path=/x&selector=r.idx+%3E%3D+3").unwrap();
        assert_eq!(uri.option("selector"), Some("r.idx >= 3"));
        assert_eq!(uri.options().count(), 2);
    }

    #[test]
    fn bare_paths_and_dash_are_files() {
        let uri = AdapterUri::parse("/tmp/out.records").unwrap();
        assert_eq!(uri.scheme(), "file");
        assert_eq!(uri.authority(), "/tmp/out.records");
        assert!(!uri.is_stdio());
        assert!(AdapterUri::parse("-").unwrap().is_stdio());

        let explicit = AdapterUri::parse("file:///tmp/out.records").unwrap();
        assert_eq!(explicit.authority(), "/tmp/out.records");
    }

    #[test]
    fn missing_required_option_is_usage() {
        let uri = AdapterUri::parse("gcs://p:b").unwrap();
        let err = uri.require_option("path").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.uri(), Some("gcs://p:b"));
    }

    #[test]
    fn bad_scheme_is_rejected() {
        let err = AdapterUri::parse("9x://host").expect_err("scheme");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(AdapterUri::parse("   ").is_err());
    }
}
