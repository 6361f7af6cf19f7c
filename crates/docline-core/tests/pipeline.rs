use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use docline_core::{
    Content, ContentFormat, DirectorySink, LoadError, LoaderConfig, MemorySink, Pipeline,
    RecordMeta, Sink, SinkError, Summary,
};
use tempfile::TempDir;

/// Fresh interrupt flag per test so parallel tests never see each other's signals
fn flag() -> &'static AtomicBool {
    Box::leak(Box::new(AtomicBool::new(false)))
}

fn run(config: LoaderConfig, sink: Arc<dyn Sink>) -> Result<Summary, LoadError> {
    Pipeline::new(config, sink).interrupt_flag(flag()).run()
}

fn config(inputs: &[&Path], f: impl FnOnce(&mut LoaderConfig)) -> LoaderConfig {
    let mut config = LoaderConfig {
        inputs: inputs.iter().map(|p| p.to_path_buf()).collect(),
        record_name: Some("rec".into()),
        id_name: "@id".into(),
        threads: 2,
        monitor_interval_secs: 60,
        ..Default::default()
    };
    f(&mut config);
    config
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    std::fs::write(path, buf).unwrap();
}

fn records(ids: &[&str]) -> String {
    let body: String = ids
        .iter()
        .map(|id| format!(r#"<rec id="{id}"><title>t{id}</title></rec>"#))
        .collect();
    format!("<root>{body}</root>")
}

#[test]
fn attribute_ids_become_keys() {
    let dir = TempDir::new().unwrap();
    let input = write(
        dir.path(),
        "in.xml",
        r#"<root><rec id="1">A</rec><rec id="2">B</rec></root>"#,
    );
    let sink = Arc::new(MemorySink::new());
    let summary = run(
        config(&[&input], |c| c.uri_prefix = "prefix/".into()),
        sink.clone(),
    )
    .unwrap();

    assert_eq!(sink.keys(), ["prefix/1", "prefix/2"]);
    assert_eq!(sink.get("prefix/1").unwrap().content, br#"<rec id="1">A</rec>"#);
    assert_eq!(sink.get("prefix/2").unwrap().content, br#"<rec id="2">B</rec>"#);
    assert_eq!((summary.units, summary.inserted, summary.errors), (1, 2, 0));
    assert!(sink.is_closed());
}

#[test]
fn namespaces_redeclared_on_each_record() {
    let dir = TempDir::new().unwrap();
    let input = write(
        dir.path(),
        "ns.xml",
        r#"<feed xmlns="urn:feed" xmlns:x="urn:x"><rec id="a"><x:t>1</x:t></rec></feed>"#,
    );
    let sink = Arc::new(MemorySink::new());
    run(
        config(&[&input], |c| c.record_namespace = Some("urn:feed".into())),
        sink.clone(),
    )
    .unwrap();

    let body = String::from_utf8(sink.get("a").unwrap().content).unwrap();
    assert!(body.starts_with("<rec "), "{body}");
    assert!(body.contains(r#"xmlns="urn:feed""#), "{body}");
    assert!(body.contains(r#"xmlns:x="urn:x""#), "{body}");
    assert!(body.ends_with("<x:t>1</x:t></rec>"), "{body}");
}

#[test]
fn skip_existing_rerun_inserts_nothing() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "batch.xml", &records(&["a", "b", "c", "d", "e"]));
    let out = dir.path().join("out");
    let sink: Arc<dyn Sink> = Arc::new(DirectorySink::open(&out).unwrap());

    let first = run(config(&[&input], |_| {}), sink).unwrap();
    assert_eq!(first.inserted, 5);
    assert!(out.join("c").is_file());

    let sink: Arc<dyn Sink> = Arc::new(DirectorySink::open(&out).unwrap());
    let second = run(config(&[&input], |c| c.skip_existing = true), sink).unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 5);
    assert_eq!(second.events, 5);
}

#[test]
fn start_id_with_many_threads() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "batch.xml", &records(&["a", "b", "c", "d"]));
    for threads in [1, 4] {
        let sink = Arc::new(MemorySink::new());
        let summary = run(
            config(&[&input], |c| {
                c.threads = threads;
                c.start_id = Some("c".into());
            }),
            sink.clone(),
        )
        .unwrap();
        assert_eq!(sink.keys(), ["c", "d"], "threads = {threads}");
        assert_eq!(summary.skipped, 2);
    }
}

#[test]
fn structural_error_halts_in_fatal_mode() {
    let dir = TempDir::new().unwrap();
    let input = write(
        dir.path(),
        "bad.xml",
        r#"<root><rec>missing</rec><rec id="2">B</rec></root>"#,
    );
    let sink = Arc::new(MemorySink::new());
    let err = run(config(&[&input], |_| {}), sink.clone()).unwrap_err();
    match err {
        LoadError::Halted(cause) => assert!(cause.contains("no id attribute"), "{cause}"),
        other => panic!("expected halt, got {other}"),
    }
    assert!(sink.is_empty());
}

#[test]
fn structural_error_skips_record_when_not_fatal() {
    let dir = TempDir::new().unwrap();
    let input = write(
        dir.path(),
        "bad.xml",
        r#"<root><rec>missing</rec><rec id="2">B</rec></root>"#,
    );
    let sink = Arc::new(MemorySink::new());
    let summary = run(config(&[&input], |c| c.fatal_errors = false), sink.clone()).unwrap();
    assert_eq!(sink.keys(), ["2"]);
    assert_eq!((summary.errors, summary.inserted, summary.events), (1, 1, 2));
}

#[test]
fn existing_key_with_error_existing_halts() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "batch.xml", &records(&["a", "b"]));
    let sink = Arc::new(MemorySink::with_keys(["b"]));
    let err = run(
        config(&[&input], |c| {
            c.error_existing = true;
            c.fatal_errors = false;
        }),
        sink,
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::Halted(cause) if cause.contains("already exists")));
}

#[test]
fn archive_entries_filtered_and_loaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.zip");
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        for i in 0..10 {
            let name = if i == 3 {
                "README.txt".to_string()
            } else {
                format!("doc{i}.xml")
            };
            zip.start_file(name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(format!("<doc n=\"{i}\">body</doc>").as_bytes())
                .unwrap();
        }
        zip.finish().unwrap();
    }
    std::fs::write(&path, buf).unwrap();

    let sink = Arc::new(MemorySink::new());
    let summary = run(
        config(&[&path], |c| {
            c.record_name = None;
            c.id_name = "#FILENAME".into();
            c.uri_prefix = "/zip/".into();
            c.delete_input = true;
        }),
        sink.clone(),
    )
    .unwrap();

    assert_eq!((summary.units, summary.excluded), (9, 1));
    assert_eq!(sink.len(), 9);
    assert_eq!(
        sink.get("/zip/doc4.xml").unwrap().content,
        br#"<doc n="4">body</doc>"#
    );
    assert!(!path.exists(), "clean archive should be deleted");
}

#[test]
fn gzip_and_plain_files_from_directory() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "one.xml", &records(&["1", "2"]));
    write(dir.path(), "skip.json", "{}");
    let gz_path = dir.path().join("two.xml.gz");
    let mut gz = flate2::write::GzEncoder::new(
        std::fs::File::create(&gz_path).unwrap(),
        flate2::Compression::default(),
    );
    gz.write_all(records(&["3"]).as_bytes()).unwrap();
    gz.finish().unwrap();

    let sink = Arc::new(MemorySink::new());
    let summary = run(
        config(&[dir.path()], |c| {
            c.use_filename_path = true;
            c.use_filename_collection = true;
        }),
        sink.clone(),
    )
    .unwrap();

    assert_eq!((summary.units, summary.excluded), (2, 1));
    assert_eq!(sink.keys(), ["one.xml/1", "one.xml/2", "two.xml/3"]);
    assert_eq!(sink.get("two.xml/3").unwrap().collections, ["two.xml"]);
}

#[test]
fn backpressure_loads_every_unit() {
    let dir = TempDir::new().unwrap();
    for i in 0..25 {
        write(dir.path(), &format!("f{i:02}.xml"), &records(&[&format!("r{i}")]));
    }
    let sink = Arc::new(MemorySink::new());
    let summary = run(
        config(&[dir.path()], |c| {
            c.threads = 3;
            c.queue_capacity = 2;
        }),
        sink.clone(),
    )
    .unwrap();
    assert_eq!(summary.units, 25);
    assert_eq!(sink.len(), 25);
}

#[test]
fn delete_input_only_after_clean_unit() {
    let dir = TempDir::new().unwrap();
    let good = write(dir.path(), "good.xml", &records(&["g"]));
    let bad = write(dir.path(), "bad.xml", r#"<root><rec>no id</rec></root>"#);
    let sink = Arc::new(MemorySink::new());
    run(
        config(&[&good, &bad], |c| {
            c.delete_input = true;
            c.fatal_errors = false;
        }),
        sink,
    )
    .unwrap();
    assert!(!good.exists());
    assert!(bad.exists());
}

#[test]
fn interrupt_stops_looping_run() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "batch.xml", &records(&["a"]));
    let flag = flag();
    let sink = Arc::new(MemorySink::new());
    let config = config(&[&input], |c| {
        c.loop_forever = true;
        c.loop_interval_secs = 60;
    });

    let handle = std::thread::spawn(move || Pipeline::new(config, sink).interrupt_flag(flag).run());
    std::thread::sleep(std::time::Duration::from_millis(300));
    flag.store(true, std::sync::atomic::Ordering::Relaxed);
    let result = handle.join().unwrap();
    assert!(matches!(result, Err(LoadError::Interrupted)));
}

#[test]
fn missing_input_is_config_error() {
    let sink = Arc::new(MemorySink::new());
    let err = run(
        config(&[Path::new("/no/such/docline/input.xml")], |_| {}),
        sink,
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::Config(_)));
}

#[test]
fn no_inputs_rejected_before_start() {
    let sink = Arc::new(MemorySink::new());
    let err = run(config(&[], |_| {}), sink.clone()).unwrap_err();
    assert!(matches!(err, LoadError::Config(_)));
    assert!(!sink.is_closed());
}

/// Raises the interrupt flag on its second insert, then stalls long enough for
/// the monitor to notice.
struct InterruptingSink {
    inner: MemorySink,
    inserts: AtomicU64,
    flag: &'static AtomicBool,
}

impl Sink for InterruptingSink {
    fn exists(&self, key: &str) -> Result<bool, SinkError> {
        self.inner.exists(key)
    }

    fn insert(&self, meta: &RecordMeta, content: Content<'_>) -> Result<u64, SinkError> {
        let written = self.inner.insert(meta, content)?;
        if self.inserts.fetch_add(1, Ordering::Relaxed) + 1 == 2 {
            self.flag.store(true, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(800));
        }
        Ok(written)
    }

    fn close(&self) -> Result<(), SinkError> {
        self.inner.close()
    }
}

#[test]
fn interrupted_archive_is_not_deleted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.zip");
    let entries: Vec<(String, String)> = (0..5)
        .map(|i| (format!("doc{i}.txt"), format!("text {i}")))
        .collect();
    let refs: Vec<(&str, &str)> = entries
        .iter()
        .map(|(n, c)| (n.as_str(), c.as_str()))
        .collect();
    write_zip(&path, &refs);

    let flag = flag();
    let sink = Arc::new(InterruptingSink {
        inner: MemorySink::new(),
        inserts: AtomicU64::new(0),
        flag,
    });
    let config = config(&[&path], |c| {
        c.content_format = ContentFormat::Text;
        c.record_name = None;
        c.id_name = "#FILENAME".into();
        c.threads = 1;
        c.delete_input = true;
    });
    let result = Pipeline::new(config, sink.clone()).interrupt_flag(flag).run();

    assert!(matches!(result, Err(LoadError::Interrupted)));
    assert!(sink.inner.len() < 5, "loaded {}", sink.inner.len());
    assert!(path.exists(), "partly loaded archive must be kept");
}

struct PanickingSink;

impl Sink for PanickingSink {
    fn exists(&self, _key: &str) -> Result<bool, SinkError> {
        Ok(false)
    }

    fn insert(&self, _meta: &RecordMeta, _content: Content<'_>) -> Result<u64, SinkError> {
        panic!("insert failed hard")
    }

    fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[test]
fn panicking_worker_halts_run() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "batch.xml", &records(&["a", "b"]));
    for fatal in [true, false] {
        let err = run(
            config(&[&input], |c| c.fatal_errors = fatal),
            Arc::new(PanickingSink),
        )
        .unwrap_err();
        match err {
            LoadError::Halted(cause) => assert!(cause.contains("insert failed hard"), "{cause}"),
            other => panic!("expected halt, got {other}"),
        }
    }
}

#[test]
fn unreadable_archive_entry_counted_as_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mixed.zip");
    write_zip(
        &path,
        &[
            ("good.xml", records(&["g"]).as_str()),
            ("bad.xml", r#"<root><rec id="x">corrupt-body</rec></root>"#),
        ],
    );
    // Stored entries keep their bytes verbatim; change them so the CRC check fails
    let mut bytes = std::fs::read(&path).unwrap();
    let at = bytes
        .windows(12)
        .position(|w| w == b"corrupt-body")
        .unwrap();
    bytes[at..at + 12].copy_from_slice(b"CORRUPT-BODY");
    std::fs::write(&path, bytes).unwrap();

    let sink = Arc::new(MemorySink::new());
    let summary = run(
        config(&[&path], |c| {
            c.fatal_errors = false;
            c.delete_input = true;
        }),
        sink.clone(),
    )
    .unwrap();

    assert_eq!((summary.units, summary.inserted, summary.errors), (2, 1, 1));
    assert_eq!(sink.keys(), ["g"]);
    assert!(path.exists());
}

#[test]
fn first_miss_restarts_throttle_window() {
    let dir = TempDir::new().unwrap();
    let existing: Vec<String> = (0..40).map(|i| format!("old{i:02}")).collect();
    let mut ids: Vec<&str> = existing.iter().map(String::as_str).collect();
    ids.extend(["new1", "new2"]);
    let input = write(dir.path(), "batch.xml", &records(&ids));

    let sink = Arc::new(MemorySink::with_keys(existing.iter().map(String::as_str)));
    let started = Instant::now();
    let summary = run(
        config(&[&input], |c| {
            c.threads = 1;
            c.skip_existing = true;
            c.skip_existing_until_first_miss = true;
            c.throttle_events_per_second = Some(5.0);
        }),
        sink.clone(),
    )
    .unwrap();

    assert_eq!((summary.skipped, summary.inserted), (40, 2));
    // Measured from the start, 42 events at 5/s would hold the run for ~8s
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
}
