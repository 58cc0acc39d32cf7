//! Purpose: Write-only adapter that forwards records to a Splunk indexer.
//! Exports: `SplunkWriter`, `Protocol`, `SourceType`, `key_value_line`, `json_event`.
//! Role: `splunk[+tcp|+http|+https]://host:port?tag=..&token=..&sourcetype=..` sink.
//! Invariants: TCP sends one key-value line per record as it is written.
//! Invariants: HTTP(S) posts batches of `RECORD_BUFFER_LIMIT` lines; `close` sends the remainder.
//! Invariants: Field names Splunk reserves are renamed with an `rd_` prefix.
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};
use url::Url;

use super::{AdapterTarget, RecordSink};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::value::Value;

pub const SCHEMES: [&str; 4] = ["splunk", "splunk+tcp", "splunk+http", "splunk+https"];

/// Lines bundled into one HTTP collector request.
pub const RECORD_BUFFER_LIMIT: usize = 20;

const RESERVED_FIELDS: [&str; 7] = [
    "_indextime",
    "_time",
    "index",
    "punct",
    "source",
    "sourcetype",
    "tag",
];

const TAG_FIELD: &str = "rdtag";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Http,
    Https,
}

impl Protocol {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "splunk" | "splunk+tcp" => Some(Protocol::Tcp),
            "splunk+http" => Some(Protocol::Http),
            "splunk+https" => Some(Protocol::Https),
            _ => None,
        }
    }

    fn url_scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceType {
    /// `key="value"` lines, sent raw.
    Records,
    /// Collector event objects.
    Json,
}

impl SourceType {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "records" => Some(SourceType::Records),
            "json" => Some(SourceType::Json),
            _ => None,
        }
    }
}

enum Transport {
    Tcp(TcpStream),
    Http(HttpCollector),
}

struct HttpCollector {
    agent: ureq::Agent,
    url: Url,
    authorization: String,
    channel: String,
    buffer: Vec<Vec<u8>>,
}

impl HttpCollector {
    fn push(&mut self, line: Vec<u8>) -> Result<(), Error> {
        self.buffer.push(line);
        if self.buffer.len() >= RECORD_BUFFER_LIMIT {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let body = self.buffer.concat();
        let lines = self.buffer.len();
        self.buffer.clear();
        debug!(url = %self.url, lines, "posting to splunk collector");
        let response = self
            .agent
            .post(self.url.as_str())
            .set("Authorization", &self.authorization)
            .set("X-Splunk-Request-Channel", &self.channel)
            .send_bytes(&body);
        match response {
            Ok(resp) if resp.status() == 200 => Ok(()),
            Ok(resp) => Err(collector_error(resp.status(), resp)),
            Err(ureq::Error::Status(code, resp)) => Err(collector_error(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message("splunk collector request failed")
                .with_uri(self.url.as_str())
                .with_source(err)),
        }
    }
}

fn collector_error(status: u16, response: ureq::Response) -> Error {
    let url = response.get_url().to_string();
    let body = response.into_string().unwrap_or_default();
    let err = Error::new(ErrorKind::Io)
        .with_message(format!("splunk collector returned status {status}"))
        .with_uri(url);
    match body.trim() {
        "" => err,
        text => err.with_hint(text.to_string()),
    }
}

pub struct SplunkWriter {
    label: String,
    protocol: Protocol,
    sourcetype: SourceType,
    tag: Option<String>,
    transport: Option<Transport>,
    warned_tag_field: bool,
}

impl SplunkWriter {
    pub fn create(target: AdapterTarget) -> Result<Self, Error> {
        let uri = &target.uri;
        let label = uri.as_str().to_string();
        let usage = |message: String| {
            Error::new(ErrorKind::Usage)
                .with_message(message)
                .with_uri(label.clone())
        };

        let protocol = Protocol::from_scheme(uri.scheme())
            .ok_or_else(|| usage(format!("unsupported splunk scheme `{}`", uri.scheme())))?;
        let sourcetype = match uri.option("sourcetype") {
            Some(text) => SourceType::parse(text).ok_or_else(|| {
                usage(format!("unsupported sourcetype `{text}`"))
                    .with_hint("Use sourcetype=records or sourcetype=json.")
            })?,
            None => {
                warn!("no sourcetype given; assuming `records`");
                SourceType::Records
            }
        };
        if protocol == Protocol::Tcp && sourcetype != SourceType::Records {
            return Err(usage("splunk over tcp only accepts the `records` sourcetype".into())
                .with_hint("Use splunk+http:// or splunk+https:// for json events."));
        }

        let endpoint = Url::parse(&format!("{}://{}", protocol.url_scheme(), uri.authority()))
            .map_err(|err| usage("invalid splunk address".into()).with_source(err))?;
        let Some(host) = endpoint.host_str().filter(|host| !host.is_empty()) else {
            return Err(usage("splunk address has no host".into())
                .with_hint("Use splunk+tcp://<host>:<port>."));
        };

        let transport = match protocol {
            Protocol::Tcp => {
                let port = endpoint.port().ok_or_else(|| {
                    usage("splunk tcp address needs a port".into())
                        .with_hint("Use splunk+tcp://<host>:<port>.")
                })?;
                let stream = TcpStream::connect((host, port)).map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to connect to splunk")
                        .with_uri(label.clone())
                        .with_source(err)
                })?;
                Transport::Tcp(stream)
            }
            Protocol::Http | Protocol::Https => {
                let token = uri.option("token").filter(|t| !t.is_empty()).ok_or_else(|| {
                    usage("the splunk http collector needs a token".into())
                        .with_hint("Append ?token=<hec token> to the uri.")
                })?;
                let authorization = if token.starts_with("Splunk ") {
                    token.to_string()
                } else {
                    format!("Splunk {token}")
                };
                let verify = !matches!(
                    uri.option("ssl_verify").map(str::to_ascii_lowercase).as_deref(),
                    Some("0" | "false")
                );
                let mut url = endpoint.clone();
                url.set_path(match sourcetype {
                    SourceType::Records => "/services/collector/raw",
                    SourceType::Json => "/services/collector/event",
                });
                url.set_query(Some("auto_extract_timestamp=true"));
                Transport::Http(HttpCollector {
                    agent: build_agent(verify),
                    url,
                    authorization,
                    channel: request_channel()?,
                    buffer: Vec::with_capacity(RECORD_BUFFER_LIMIT),
                })
            }
        };
        debug!(uri = %label, ?protocol, ?sourcetype, "opened splunk writer");

        Ok(Self {
            label,
            protocol,
            sourcetype,
            tag: uri.option("tag").map(str::to_string),
            transport: Some(transport),
            warned_tag_field: false,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn sourcetype(&self) -> SourceType {
        self.sourcetype
    }
}

impl RecordSink for SplunkWriter {
    fn write(&mut self, record: &Record) -> Result<(), Error> {
        if !self.warned_tag_field && record.get(TAG_FIELD).is_some() {
            self.warned_tag_field = true;
            warn!(
                descriptor = record.descriptor().name(),
                "record has an `rdtag` field; splunk output will carry it twice"
            );
        }
        let mut line = match self.sourcetype {
            SourceType::Records => key_value_line(record, self.tag.as_deref()),
            SourceType::Json => json_event(record, self.tag.as_deref()).to_string(),
        }
        .into_bytes();
        line.push(b'\n');

        match self.transport.as_mut() {
            Some(Transport::Tcp(stream)) => stream.write_all(&line).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to send record to splunk")
                    .with_uri(self.label.clone())
                    .with_source(err)
            }),
            Some(Transport::Http(collector)) => collector.push(line),
            None => Err(Error::new(ErrorKind::Usage).with_message("record sink is closed")),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        match self.transport.take() {
            Some(Transport::Tcp(mut stream)) => {
                let flushed = stream.flush();
                let _ = stream.shutdown(Shutdown::Both);
                flushed.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to flush splunk connection")
                        .with_uri(self.label.clone())
                        .with_source(err)
                })
            }
            Some(Transport::Http(mut collector)) => collector.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for SplunkWriter {
    fn drop(&mut self) {
        if self.transport.is_some() {
            if let Err(err) = self.close() {
                warn!(error = %err, "splunk writer dropped without a clean close");
            }
        }
    }
}

/// One `type="..." rdtag=... field="value"` line; bytes are base64 encoded.
pub fn key_value_line(record: &Record, tag: Option<&str>) -> String {
    let mut parts = vec![format!("type=\"{}\"", record.descriptor().name())];
    parts.push(match tag {
        Some(tag) => format!("{TAG_FIELD}=\"{tag}\""),
        None => format!("{TAG_FIELD}=None"),
    });
    for (name, value) in record.fields() {
        let name = splunk_field_name(name);
        if value.is_null() {
            parts.push(format!("{name}=None"));
            continue;
        }
        let text = plain_text(value).replace('\\', "\\\\").replace('"', "\\\"");
        parts.push(format!("{name}=\"{text}\""));
    }
    parts.join(" ")
}

/// Collector event: indexer fields at the top level, the record under `event`.
pub fn json_event(record: &Record, tag: Option<&str>) -> JsonValue {
    let mut event = match record.to_json() {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    };
    for reserved in RESERVED_FIELDS {
        if let Some(value) = event.remove(reserved) {
            event.insert(format!("rd_{reserved}"), value);
        }
    }
    event.insert(
        TAG_FIELD.to_string(),
        tag.map_or(JsonValue::Null, |tag| JsonValue::String(tag.to_string())),
    );

    let mut out = Map::new();
    let host = ["host", "hostname"]
        .into_iter()
        .filter_map(|field| record.get(field))
        .find(|value| !is_empty(value));
    if let Some(host) = host {
        out.insert("host".to_string(), JsonValue::String(plain_text(host)));
    }
    match record.get("ts") {
        Some(Value::Datetime(ts)) => {
            let epoch = ts.unix_timestamp() as f64 + f64::from(ts.nanosecond()) / 1e9;
            out.insert("time".to_string(), JsonValue::from(epoch));
        }
        Some(value) if !is_empty(value) => {
            out.insert("time".to_string(), JsonValue::String(plain_text(value)));
        }
        _ => {}
    }
    if let Some(source) = record.source().filter(|s| !s.is_empty()) {
        out.insert("source".to_string(), JsonValue::String(source.to_string()));
    }
    out.insert("event".to_string(), JsonValue::Object(event));
    JsonValue::Object(out)
}

fn splunk_field_name(name: &str) -> String {
    if RESERVED_FIELDS.contains(&name) {
        format!("rd_{name}")
    } else {
        name.to_string()
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bytes(bytes) => BASE64.encode(bytes),
        other => other.to_string(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Bytes(bytes) => bytes.is_empty(),
        _ => false,
    }
}

fn build_agent(verify: bool) -> ureq::Agent {
    if verify {
        return ureq::AgentBuilder::new().build();
    }
    warn!("splunk certificate verification is disabled");
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAllServerCertVerifier))
        .with_no_client_auth();
    ureq::builder().tls_config(Arc::new(tls_config)).build()
}

/// Random v4 UUID naming this writer's collector channel.
fn request_channel() -> Result<String, Error> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate request channel: {err}"))
    })?;
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

#[derive(Debug)]
struct AcceptAllServerCertVerifier;

impl ServerCertVerifier for AcceptAllServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
