//! Purpose: Stream records out of every object in a bucket that matches a path glob.
//! Exports: `BlobReader`.
//! Role: Object-store adapter behind `gcs://<project>:<bucket>?path=<path>[&selector=<expr>]`.
//! Invariants: Listing is deferred to the first pull and asks the store for the literal prefix only.
//! Invariants: Zero-size objects are skipped before glob matching and never opened.
//! Invariants: A failing object yields one error; iteration resumes at the next listed object.
//! Invariants: `close` releases the store exactly once.
use std::io::Read;

use tracing::{debug, warn};

use super::glob::{fnmatch, split_glob};
use super::store::{ObjectListing, ObjectStore, ObjectStoreConnector};
use super::{AdapterTarget, RecordSource};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::schema::Registry;
use crate::core::selector::CompiledSelector;
use crate::core::stream::StreamReader;

type ObjectStream = StreamReader<Box<dyn Read + Send>>;

pub struct BlobReader {
    project: String,
    bucket: String,
    prefix: String,
    glob: Option<String>,
    selector: Option<CompiledSelector>,
    registry: Registry,
    store: Option<Box<dyn ObjectStore>>,
    listing: Option<ObjectListing>,
    current: Option<(String, ObjectStream)>,
    exhausted: bool,
}

impl BlobReader {
    pub fn open(target: AdapterTarget, connector: &dyn ObjectStoreConnector) -> Result<Self, Error> {
        let uri = target.uri;
        let (project, bucket) = uri
            .authority()
            .split_once(':')
            .filter(|(project, bucket)| !project.is_empty() && !bucket.is_empty())
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("blob uri must name `<project>:<bucket>`")
                    .with_uri(uri.as_str())
                    .with_hint(format!(
                        "Use {}://<project>:<bucket>?path=<path>.",
                        uri.scheme()
                    ))
            })?;
        let (prefix, glob) = split_glob(uri.require_option("path")?);
        let store = connector
            .connect(project)
            .map_err(|err| err.with_uri(uri.as_str()))?;
        debug!(project, bucket, prefix = %prefix, glob = ?glob, "opened blob reader");
        Ok(Self {
            project: project.to_string(),
            bucket: bucket.to_string(),
            prefix,
            glob,
            selector: target.selector,
            registry: target.registry,
            store: Some(store),
            listing: None,
            current: None,
            exhausted: false,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Literal part of `path`, sent to the store as the listing prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full `path` when it contains glob syntax.
    pub fn glob(&self) -> Option<&str> {
        self.glob.as_deref()
    }

    fn selected(&self, record: &Record) -> bool {
        self.selector
            .as_ref()
            .is_none_or(|selector| selector.matches(record))
    }

    /// Opens the next listed object worth reading, or returns the error that stopped it.
    fn open_next(&mut self) -> Option<Result<(), Error>> {
        let store = self.store.as_ref()?;
        if self.listing.is_none() {
            match store.list_objects(&self.bucket, &self.prefix) {
                Ok(listing) => self.listing = Some(listing),
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        let listing = self.listing.as_mut()?;
        loop {
            let object = match listing.next() {
                Some(Ok(object)) => object,
                Some(Err(err)) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
                None => {
                    self.exhausted = true;
                    return None;
                }
            };
            if object.size == 0 {
                debug!(object = %object.name, "skipping empty object");
                continue;
            }
            if let Some(glob) = &self.glob {
                if !fnmatch(&object.name, glob) {
                    continue;
                }
            }
            debug!(object = %object.name, size = object.size, "reading object");
            return match store.open_object(&self.bucket, &object.name) {
                Ok(body) => {
                    let stream = StreamReader::with_registry(body, self.registry.clone());
                    self.current = Some((object.name, stream));
                    Some(Ok(()))
                }
                Err(err) => Some(Err(err.with_uri(object.name))),
            };
        }
    }
}

impl Iterator for BlobReader {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((name, stream)) = self.current.as_mut() {
                match stream.next() {
                    Some(Ok(record)) => {
                        if self.selected(&record) {
                            return Some(Ok(record));
                        }
                        continue;
                    }
                    Some(Err(err)) => {
                        warn!(object = %name, error = %err, "abandoning unreadable object");
                        let err = err.with_uri(name.clone());
                        self.current = None;
                        return Some(Err(err));
                    }
                    None => {
                        self.current = None;
                    }
                }
            }
            if self.exhausted {
                return None;
            }
            match self.open_next()? {
                Ok(()) => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl RecordSource for BlobReader {
    fn close(&mut self) -> Result<(), Error> {
        self.current = None;
        self.listing = None;
        self.exhausted = true;
        match self.store.take() {
            Some(mut store) => store.close(),
            None => Ok(()),
        }
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close object store");
        }
    }
}
