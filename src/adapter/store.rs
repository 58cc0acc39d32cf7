//! Purpose: Object-store collaborator contract plus in-memory and directory-backed stores.
//! Exports: `ObjectInfo`, `ObjectListing`, `ObjectStore`, `ObjectStoreConnector`, `MemoryStore`, `DirStore`.
//! Role: Seam between the blob adapter and whatever client actually talks to a bucket.
//! Invariants: Listings are prefix-filtered by the store; glob filtering happens in the adapter.
//! Invariants: Stores never retry; transport failures surface as `Io`/`NotFound` errors.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;
use walkdir::WalkDir;

use super::map_io_error_kind;
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::stream::StreamWriter;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
}

pub type ObjectListing = Box<dyn Iterator<Item = Result<ObjectInfo, Error>> + Send>;

pub trait ObjectStore: Send {
    /// Lists objects in `bucket` whose names start with `prefix`, in store order.
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<ObjectListing, Error>;

    fn open_object(&self, bucket: &str, name: &str) -> Result<Box<dyn Read + Send>, Error>;

    fn close(&mut self) -> Result<(), Error>;
}

/// Builds a store client for a project; authentication lives behind this seam.
pub trait ObjectStoreConnector: Send + Sync {
    fn connect(&self, project: &str) -> Result<Box<dyn ObjectStore>, Error>;
}

#[derive(Default)]
struct MemoryInner {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Arc<[u8]>>>>,
    projects: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

/// Shared in-memory store; clones see the same buckets.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, name: &str, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        let data: Arc<[u8]> = Arc::from(data.into());
        self.inner
            .buckets
            .lock()
            .map_err(|_| poisoned())?
            .entry(bucket.to_string())
            .or_default()
            .insert(name.to_string(), data);
        Ok(())
    }

    pub fn put_records(&self, bucket: &str, name: &str, records: &[Record]) -> Result<(), Error> {
        let mut writer = StreamWriter::new(Vec::new())?;
        for record in records {
            writer.write(record)?;
        }
        self.put(bucket, name, writer.finish()?)
    }

    /// Projects passed to `connect`, in call order.
    pub fn connected_projects(&self) -> Vec<String> {
        self.inner
            .projects
            .lock()
            .map(|projects| projects.clone())
            .unwrap_or_default()
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryStore {
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<ObjectListing, Error> {
        let buckets = self.inner.buckets.lock().map_err(|_| poisoned())?;
        let Some(objects) = buckets.get(bucket) else {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("bucket `{bucket}` does not exist")));
        };
        let listing = objects
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| {
                Ok(ObjectInfo {
                    name: name.clone(),
                    size: data.len() as u64,
                })
            })
            .collect::<Vec<_>>();
        Ok(Box::new(listing.into_iter()))
    }

    fn open_object(&self, bucket: &str, name: &str) -> Result<Box<dyn Read + Send>, Error> {
        let buckets = self.inner.buckets.lock().map_err(|_| poisoned())?;
        let data = buckets
            .get(bucket)
            .and_then(|objects| objects.get(name))
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("object `{name}` not found in bucket `{bucket}`"))
            })?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ObjectStoreConnector for MemoryStore {
    fn connect(&self, project: &str) -> Result<Box<dyn ObjectStore>, Error> {
        self.inner
            .projects
            .lock()
            .map_err(|_| poisoned())?
            .push(project.to_string());
        Ok(Box::new(self.clone()))
    }
}

fn poisoned() -> Error {
    Error::new(ErrorKind::Internal).with_message("memory store lock poisoned")
}

/// Serves buckets from subdirectories of a local root; object names are `/`-joined relative paths.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, Error> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid bucket name `{bucket}`")));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(name.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid object name `{name}`")));
        }
        Ok(self.bucket_dir(bucket)?.join(relative))
    }
}

impl ObjectStore for DirStore {
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<ObjectListing, Error> {
        let bucket_dir = self.bucket_dir(bucket)?;
        if !bucket_dir.is_dir() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("bucket `{bucket}` does not exist"))
                .with_hint(format!("Expected a directory at {}", bucket_dir.display())));
        }
        // A rooted prefix lists rooted names; the bucket directory is the root either way.
        let rooted = prefix.starts_with('/');
        let relative_prefix = prefix.trim_start_matches('/');
        let start_rel = match relative_prefix.rfind('/') {
            Some(pos) => &relative_prefix[..pos],
            None => "",
        };
        if Path::new(start_rel)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid listing prefix `{prefix}`")));
        }
        let start_dir = bucket_dir.join(start_rel);
        let mut objects = Vec::new();
        if start_dir.is_dir() {
            walk(&bucket_dir, &start_dir, &mut objects)?;
        }
        if rooted {
            for object in &mut objects {
                object.name.insert(0, '/');
            }
        }
        objects.retain(|object| object.name.starts_with(prefix));
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(bucket, prefix, count = objects.len(), "listed directory store");
        Ok(Box::new(objects.into_iter().map(Ok)))
    }

    fn open_object(&self, bucket: &str, name: &str) -> Result<Box<dyn Read + Send>, Error> {
        let path = self.object_path(bucket, name)?;
        let file = File::open(&path).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message(format!("failed to open object `{name}`"))
                .with_source(err)
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl ObjectStoreConnector for DirStore {
    fn connect(&self, project: &str) -> Result<Box<dyn ObjectStore>, Error> {
        debug!(project, root = %self.root.display(), "connecting directory store");
        Ok(Box::new(self.clone()))
    }
}

fn walk(bucket_dir: &Path, start_dir: &Path, out: &mut Vec<ObjectInfo>) -> Result<(), Error> {
    for entry in WalkDir::new(start_dir).follow_links(false) {
        let entry = entry.map_err(|err| {
            let kind = err.io_error().map_or(ErrorKind::Io, map_io_error_kind);
            Error::new(kind)
                .with_message(format!("failed to list {}", start_dir.display()))
                .with_source(err)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(bucket_dir) else {
            continue;
        };
        let Some(name) = object_name(relative) else {
            continue;
        };
        let meta = entry.metadata().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to stat `{name}`"))
                .with_source(err)
        })?;
        out.push(ObjectInfo {
            name,
            size: meta.len(),
        });
    }
    Ok(())
}

/// `/`-joined object name for a path relative to the bucket; `None` for non UTF-8 paths.
fn object_name(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::{DirStore, MemoryStore, ObjectInfo, ObjectStore, ObjectStoreConnector};
    use crate::core::error::ErrorKind;
    use std::io::Read;

    #[test]
    fn memory_store_lists_by_prefix_in_name_order() {
        let store = MemoryStore::new();
        store.put("b", "logs/2.records", vec![1, 2]).unwrap();
        store.put("b", "logs/1.records", vec![1]).unwrap();
        store.put("b", "other/1.records", vec![]).unwrap();
        let names = store
            .list_objects("b", "logs/")
            .unwrap()
            .map(|info| info.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                ObjectInfo {
                    name: "logs/1.records".to_string(),
                    size: 1
                },
                ObjectInfo {
                    name: "logs/2.records".to_string(),
                    size: 2
                },
            ]
        );
    }

    #[test]
    fn memory_store_tracks_connects_and_closes() {
        let store = MemoryStore::new();
        let mut client = store.connect("proj").unwrap();
        client.close().unwrap();
        assert_eq!(store.connected_projects(), vec!["proj".to_string()]);
        assert_eq!(store.close_count(), 1);
    }

    #[test]
    fn missing_objects_and_buckets_are_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store.list_objects("nope", "").err().unwrap().kind(),
            ErrorKind::NotFound
        );
        store.put("b", "x", vec![1]).unwrap();
        assert_eq!(
            store.open_object("b", "y").err().unwrap().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn dir_store_walks_nested_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bucket = temp.path().join("bucket");
        std::fs::create_dir_all(bucket.join("a/results")).unwrap();
        std::fs::create_dir_all(bucket.join("b")).unwrap();
        std::fs::write(bucket.join("a/results/x.records"), b"abc").unwrap();
        std::fs::write(bucket.join("a/top.records"), b"").unwrap();
        std::fs::write(bucket.join("b/y.records"), b"z").unwrap();

        let store = DirStore::new(temp.path());
        let listed = store
            .list_objects("bucket", "a/")
            .unwrap()
            .map(|info| info.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            listed,
            vec![
                ObjectInfo {
                    name: "a/results/x.records".to_string(),
                    size: 3
                },
                ObjectInfo {
                    name: "a/top.records".to_string(),
                    size: 0
                },
            ]
        );

        let mut body = String::new();
        store
            .open_object("bucket", "a/results/x.records")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "abc");
    }

    #[test]
    fn dir_store_keeps_rooted_names_rooted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bucket = temp.path().join("bucket");
        std::fs::create_dir_all(bucket.join("path/to")).unwrap();
        std::fs::write(bucket.join("path/to/x.records"), b"abc").unwrap();

        let store = DirStore::new(temp.path());
        let names = store
            .list_objects("bucket", "/path/")
            .unwrap()
            .map(|info| info.unwrap().name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["/path/to/x.records".to_string()]);
        assert!(store.open_object("bucket", &names[0]).is_ok());
    }

    #[test]
    fn dir_store_rejects_escaping_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(temp.path());
        let err = store.open_object("bucket", "../secret").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = store.list_objects("..", "").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Usage);
        std::fs::create_dir_all(temp.path().join("bucket")).unwrap();
        let err = store.list_objects("bucket", "../x/").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
