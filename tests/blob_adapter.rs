use flowrecord::adapter::{Dispatcher, MemoryStore, RecordSource};
use flowrecord::core::stream::StreamWriter;
use flowrecord::{Descriptor, ErrorKind, Record, Registry, Value};

fn generate_records(amount: i64) -> Vec<Record> {
    let descriptor = Descriptor::new(
        "test/record",
        [("string", "name"), ("string", "foo"), ("varint", "idx")],
    )
    .expect("descriptor");
    (0..amount)
        .map(|idx| {
            Record::new(
                &descriptor,
                [
                    ("name", Value::from(format!("record{idx}"))),
                    ("foo", Value::from("bar")),
                    ("idx", Value::from(idx)),
                ],
            )
            .expect("record")
        })
        .collect()
}

fn encode(records: &[Record]) -> Vec<u8> {
    let mut writer = StreamWriter::new(Vec::new()).expect("writer");
    for record in records {
        writer.write(record).expect("write");
    }
    writer.finish().expect("finish")
}

fn dispatcher(store: &MemoryStore) -> Dispatcher {
    let mut dispatcher = Dispatcher::new().with_registry(Registry::new());
    dispatcher.register_object_store("gcs", store.clone());
    dispatcher
}

fn idx_of(record: &Record) -> i64 {
    record.get("idx").and_then(Value::as_i64).expect("idx")
}

#[test]
fn glob_selects_only_matching_objects() {
    let store = MemoryStore::new();
    let test_records = generate_records(10);
    store
        .put_records(
            "test-bucket",
            "/path/to/records/subfolder/results/tests.records",
            &test_records,
        )
        .unwrap();
    store
        .put_records(
            "test-bucket",
            "/path/to/records/subfolder2/donotselect/false.records",
            &test_records,
        )
        .unwrap();

    let mut reader = dispatcher(&store)
        .open_reader(
            "gcs://test-project:test-bucket?path=/path/to/records/*/results/*.records",
            None,
        )
        .unwrap();
    let found = reader.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(found.len(), 10);
    for (record, expected) in found.iter().zip(&test_records) {
        assert_eq!(record.get("foo"), Some(&Value::from("bar")));
        assert_eq!(record, expected);
    }

    reader.close().unwrap();
    assert_eq!(store.close_count(), 1);
    assert_eq!(store.connected_projects(), vec!["test-project".to_string()]);
}

#[test]
fn empty_object_yields_nothing() {
    let store = MemoryStore::new();
    store
        .put("test-bucket", "/path/to/records/emptyfile.records", Vec::new())
        .unwrap();
    let reader = dispatcher(&store)
        .open_reader(
            "gcs://test-project:test-bucket?path=/path/to/records/emptyfile.records",
            None,
        )
        .unwrap();
    assert_eq!(reader.count(), 0);
}

#[test]
fn selector_filters_records_in_order() {
    let store = MemoryStore::new();
    store
        .put_records("test-bucket", "/test.records", &generate_records(10))
        .unwrap();
    let reader = dispatcher(&store)
        .open_reader(
            "gcs://test-project:test-bucket?path=/test.records",
            Some("r.idx >= 3"),
        )
        .unwrap();
    let idxs = reader.map(|r| idx_of(&r.unwrap())).collect::<Vec<_>>();
    assert_eq!(idxs, vec![3, 4, 5, 6, 7, 8, 9]);
}

#[test]
fn zero_size_objects_are_skipped_even_when_matching() {
    let store = MemoryStore::new();
    store.put("b", "logs/a.records", Vec::new()).unwrap();
    store
        .put_records("b", "logs/b.records", &generate_records(2))
        .unwrap();
    let reader = dispatcher(&store)
        .open_reader("gcs://p:b?path=logs/*.records", None)
        .unwrap();
    assert_eq!(reader.count(), 2);
}

#[test]
fn objects_are_read_in_listing_order() {
    let store = MemoryStore::new();
    let records = generate_records(6);
    store.put_records("b", "day/2.records", &records[3..]).unwrap();
    store.put_records("b", "day/1.records", &records[..3]).unwrap();
    let reader = dispatcher(&store)
        .open_reader("gcs://p:b?path=day/", None)
        .unwrap();
    let idxs = reader.map(|r| idx_of(&r.unwrap())).collect::<Vec<_>>();
    assert_eq!(idxs, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn corrupt_object_reports_once_and_reading_continues() {
    let store = MemoryStore::new();
    let records = generate_records(6);
    let mut broken = encode(&records[..3]);
    broken.truncate(broken.len() - 3);
    store.put("b", "runs/1.records", broken).unwrap();
    store.put_records("b", "runs/2.records", &records[3..]).unwrap();

    let results = dispatcher(&store)
        .open_reader("gcs://p:b?path=runs/*", None)
        .unwrap()
        .collect::<Vec<_>>();
    let errors = results.iter().filter(|r| r.is_err()).collect::<Vec<_>>();
    assert_eq!(errors.len(), 1);
    let err = errors[0].as_ref().expect_err("corrupt");
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert_eq!(err.uri(), Some("runs/1.records"));

    let idxs = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(idx_of)
        .collect::<Vec<_>>();
    assert_eq!(idxs, vec![0, 1, 3, 4, 5]);
}

#[test]
fn selector_type_mismatch_excludes_records() {
    let store = MemoryStore::new();
    store
        .put_records("b", "x.records", &generate_records(4))
        .unwrap();
    let reader = dispatcher(&store)
        .open_reader("gcs://p:b?path=x.records", Some("r.idx == 2 or r.name > 3"))
        .unwrap();
    let idxs = reader.map(|r| idx_of(&r.unwrap())).collect::<Vec<_>>();
    assert_eq!(idxs, vec![2]);
}
