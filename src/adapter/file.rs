// Local file adapter: record streams from a path or stdin, and to a locked path or stdout.
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use super::{AdapterTarget, RecordSink, RecordSource, map_io_error_kind};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::selector::CompiledSelector;
use crate::core::stream::{StreamReader, StreamWriter};

type BoxedRead = Box<dyn Read + Send>;

pub struct FileReader {
    label: String,
    reader: Option<StreamReader<BoxedRead>>,
    selector: Option<CompiledSelector>,
}

impl FileReader {
    pub fn open(target: AdapterTarget) -> Result<Self, Error> {
        let label = target.uri.authority().to_string();
        let source: BoxedRead = if target.uri.is_stdio() {
            Box::new(io::stdin())
        } else {
            let file = File::open(&label).map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to open record file")
                    .with_uri(label.clone())
                    .with_source(err)
            })?;
            Box::new(BufReader::new(file))
        };
        debug!(path = %label, "opened record file");
        Ok(Self {
            label,
            reader: Some(StreamReader::with_registry(source, target.registry)),
            selector: target.selector,
        })
    }
}

impl Iterator for FileReader {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        loop {
            match reader.next()? {
                Ok(record) => {
                    if self.selector.as_ref().is_none_or(|s| s.matches(&record)) {
                        return Some(Ok(record));
                    }
                }
                Err(err) => return Some(Err(err.with_uri(self.label.clone()))),
            }
        }
    }
}

impl RecordSource for FileReader {
    fn close(&mut self) -> Result<(), Error> {
        self.reader = None;
        Ok(())
    }
}

/// Exclusive advisory lock held for the lifetime of the writer.
struct LockedFile {
    file: File,
}

impl Write for LockedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

enum Output {
    Stdout(StreamWriter<io::Stdout>),
    File {
        path: PathBuf,
        writer: StreamWriter<LockedFile>,
    },
}

pub struct FileWriter {
    output: Option<Output>,
}

impl FileWriter {
    pub fn create(target: AdapterTarget) -> Result<Self, Error> {
        if target.uri.is_stdio() {
            return Ok(Self {
                output: Some(Output::Stdout(StreamWriter::new(io::stdout())?)),
            });
        }
        let path = PathBuf::from(target.uri.authority());
        let file = lock_for_write(&path)?;
        let writer = StreamWriter::new(LockedFile { file })
            .map_err(|err| err.with_uri(path.display().to_string()))?;
        debug!(path = %path.display(), "opened record file for writing");
        Ok(Self {
            output: Some(Output::File { path, writer }),
        })
    }

    pub fn records_written(&self) -> u64 {
        match &self.output {
            Some(Output::Stdout(writer)) => writer.records_written(),
            Some(Output::File { writer, .. }) => writer.records_written(),
            None => 0,
        }
    }
}

fn lock_for_write(path: &Path) -> Result<File, Error> {
    let uri = path.display().to_string();
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create record file")
                .with_uri(uri.clone())
                .with_source(err)
        })?;
    file.try_lock_exclusive().map_err(|err| {
        Error::new(ErrorKind::Conflict)
            .with_message("record file is locked by another writer")
            .with_uri(uri.clone())
            .with_source(err)
    })?;
    // Truncate only while holding the lock.
    file.set_len(0).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to truncate record file")
            .with_uri(uri)
            .with_source(err)
    })?;
    Ok(file)
}

impl RecordSink for FileWriter {
    fn write(&mut self, record: &Record) -> Result<(), Error> {
        match self.output.as_mut() {
            Some(Output::Stdout(writer)) => writer.write(record),
            Some(Output::File { path, writer }) => writer
                .write(record)
                .map_err(|err| err.with_uri(path.display().to_string())),
            None => Err(Error::new(ErrorKind::Usage).with_message("record sink is closed")),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        match self.output.take() {
            Some(Output::Stdout(writer)) => {
                writer.finish()?;
            }
            Some(Output::File { path, writer }) => {
                let locked = writer.finish()?;
                locked.file.sync_all().map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to sync record file")
                        .with_uri(path.display().to_string())
                        .with_source(err)
                })?;
            }
            None => {}
        }
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.output.is_some() {
            if let Err(err) = self.close() {
                warn!(error = %err, "record file writer dropped without a clean close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FileReader, FileWriter};
    use crate::adapter::{AdapterTarget, AdapterUri, RecordSink, RecordSource};
    use crate::core::error::ErrorKind;
    use crate::core::record::Record;
    use crate::core::schema::Registry;
    use crate::core::selector::CompiledSelector;
    use crate::core::value::Value;

    fn target(path: &std::path::Path, registry: &Registry) -> AdapterTarget {
        let uri = AdapterUri::parse(path.to_str().unwrap()).unwrap();
        AdapterTarget::new(uri).with_registry(registry.clone())
    }

    fn write_records(path: &std::path::Path, registry: &Registry, count: i64) {
        let descriptor = registry
            .define("test/file", [("varint", "idx")])
            .unwrap();
        let mut writer = FileWriter::create(target(path, registry)).unwrap();
        for idx in 0..count {
            writer
                .write(&Record::new(&descriptor, [("idx", Value::from(idx))]).unwrap())
                .unwrap();
        }
        assert_eq!(writer.records_written(), count as u64);
        writer.close().unwrap();
    }

    #[test]
    fn reads_back_with_selector() {
        let registry = Registry::new();
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("x.records");
        write_records(&path, &registry, 5);

        let target = target(&path, &registry)
            .with_selector(CompiledSelector::compile("r.idx > 2").unwrap());
        let reader = FileReader::open(target).unwrap();
        let idxs = reader
            .map(|r| r.unwrap().get("idx").and_then(Value::as_i64).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(idxs, vec![3, 4]);
    }

    #[test]
    fn rewriting_truncates_previous_content() {
        let registry = Registry::new();
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("x.records");
        write_records(&path, &registry, 5);
        write_records(&path, &registry, 2);
        assert_eq!(FileReader::open(target(&path, &registry)).unwrap().count(), 2);
    }

    #[test]
    fn second_writer_is_a_conflict() {
        let registry = Registry::new();
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("x.records");
        let _first = FileWriter::create(target(&path, &registry)).unwrap();
        let err = FileWriter::create(target(&path, &registry))
            .err()
            .expect("locked");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn missing_file_is_not_found_and_close_is_idempotent() {
        let registry = Registry::new();
        let temp = tempfile::tempdir().expect("tempdir");
        let err = FileReader::open(target(&temp.path().join("nope"), &registry))
            .err()
            .expect("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let path = temp.path().join("x.records");
        write_records(&path, &registry, 1);
        let mut reader = FileReader::open(target(&path, &registry)).unwrap();
        reader.close().unwrap();
        reader.close().unwrap();
        assert!(reader.next().is_none());
    }
}
