//! Purpose: Resolve adapter URIs to record sources and sinks.
//! Exports: `RecordSource`, `RecordSink`, `AdapterTarget`, `Dispatcher`, plus the blob/file adapters.
//! Role: Entry point the CLI and library callers use instead of wiring readers by hand.
//! Invariants: Selectors compile before any byte is read; a bad selector fails construction.
//! Invariants: An explicit selector argument takes precedence over the `selector` query option.
//! Invariants: Unknown schemes are `Usage` errors naming the registered schemes.
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::schema::Registry;
use crate::core::selector::CompiledSelector;

pub mod blob;
pub mod file;
pub mod glob;
pub mod splunk;
pub mod store;
pub mod uri;

pub use blob::BlobReader;
pub use file::{FileReader, FileWriter};
pub use splunk::SplunkWriter;
pub use store::{DirStore, MemoryStore, ObjectInfo, ObjectStore, ObjectStoreConnector};
pub use uri::AdapterUri;

/// A lazy, forward-only sequence of records that owns a releasable resource.
pub trait RecordSource: Iterator<Item = Result<Record, Error>> + Send {
    /// Releases the underlying resource; calling it again is a no-op.
    fn close(&mut self) -> Result<(), Error>;
}

pub trait RecordSink: Send {
    fn write(&mut self, record: &Record) -> Result<(), Error>;

    /// Flushes buffered records; required for the last write to be durable.
    fn close(&mut self) -> Result<(), Error>;
}

/// Everything an adapter constructor receives for one URI.
#[derive(Clone, Debug)]
pub struct AdapterTarget {
    pub uri: AdapterUri,
    pub selector: Option<CompiledSelector>,
    pub registry: Registry,
}

impl AdapterTarget {
    pub fn new(uri: AdapterUri) -> Self {
        Self {
            uri,
            selector: None,
            registry: Registry::global().clone(),
        }
    }

    pub fn with_selector(mut self, selector: CompiledSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }
}

type ReaderFactory =
    Arc<dyn Fn(AdapterTarget) -> Result<Box<dyn RecordSource>, Error> + Send + Sync>;
type WriterFactory = Arc<dyn Fn(AdapterTarget) -> Result<Box<dyn RecordSink>, Error> + Send + Sync>;

#[derive(Clone)]
pub struct Dispatcher {
    readers: BTreeMap<String, ReaderFactory>,
    writers: BTreeMap<String, WriterFactory>,
    registry: Registry,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// A dispatcher with no schemes registered.
    pub fn new() -> Self {
        Self {
            readers: BTreeMap::new(),
            writers: BTreeMap::new(),
            registry: Registry::global().clone(),
        }
    }

    /// Registers the `file` scheme for both directions and the `splunk` writers.
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_reader(uri::FILE_SCHEME, |target| {
            Ok(Box::new(FileReader::open(target)?) as Box<dyn RecordSource>)
        });
        dispatcher.register_writer(uri::FILE_SCHEME, |target| {
            Ok(Box::new(FileWriter::create(target)?) as Box<dyn RecordSink>)
        });
        for scheme in splunk::SCHEMES {
            dispatcher.register_writer(scheme, |target| {
                Ok(Box::new(SplunkWriter::create(target)?) as Box<dyn RecordSink>)
            });
        }
        dispatcher
    }

    /// Decodes every opened source against `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn register_reader<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(AdapterTarget) -> Result<Box<dyn RecordSource>, Error> + Send + Sync + 'static,
    {
        self.readers
            .insert(scheme.to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn register_writer<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(AdapterTarget) -> Result<Box<dyn RecordSink>, Error> + Send + Sync + 'static,
    {
        self.writers
            .insert(scheme.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Serves `scheme://project:bucket?path=...` through `connector`.
    pub fn register_object_store<C>(&mut self, scheme: &str, connector: C)
    where
        C: ObjectStoreConnector + 'static,
    {
        let connector: Arc<dyn ObjectStoreConnector> = Arc::new(connector);
        self.register_reader(scheme, move |target| {
            Ok(Box::new(BlobReader::open(target, connector.as_ref())?) as Box<dyn RecordSource>)
        });
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes = self
            .readers
            .keys()
            .chain(self.writers.keys())
            .map(String::as_str)
            .collect::<Vec<_>>();
        schemes.sort_unstable();
        schemes.dedup();
        schemes
    }

    pub fn open_reader(
        &self,
        uri: &str,
        selector: Option<&str>,
    ) -> Result<Box<dyn RecordSource>, Error> {
        let uri = AdapterUri::parse(uri)?;
        let selector = match selector.or_else(|| uri.option("selector")) {
            Some(text) => {
                Some(CompiledSelector::compile(text).map_err(|err| err.with_uri(uri.as_str()))?)
            }
            None => None,
        };
        let factory = self
            .readers
            .get(uri.scheme())
            .ok_or_else(|| self.unknown_scheme(&uri, "reader"))?;
        debug!(uri = %uri, selector = ?selector.as_ref().map(CompiledSelector::text), "opening reader");
        let mut target = AdapterTarget::new(uri).with_registry(self.registry.clone());
        target.selector = selector;
        factory(target)
    }

    pub fn open_writer(&self, uri: &str) -> Result<Box<dyn RecordSink>, Error> {
        let uri = AdapterUri::parse(uri)?;
        let factory = self
            .writers
            .get(uri.scheme())
            .ok_or_else(|| self.unknown_scheme(&uri, "writer"))?;
        debug!(uri = %uri, "opening writer");
        factory(AdapterTarget::new(uri).with_registry(self.registry.clone()))
    }

    fn unknown_scheme(&self, uri: &AdapterUri, direction: &str) -> Error {
        let known = match direction {
            "reader" => self.readers.keys().cloned().collect::<Vec<_>>(),
            _ => self.writers.keys().cloned().collect::<Vec<_>>(),
        };
        Error::new(ErrorKind::Usage)
            .with_message(format!(
                "no {direction} registered for scheme `{}`",
                uri.scheme()
            ))
            .with_uri(uri.as_str())
            .with_hint(format!("Registered schemes: {}.", known.join(", ")))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}
