//! Per-unit loading: extract records, apply the skip policy, insert into the sink

use std::any::Any;
use std::io::{BufRead, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{ContentFormat, IdMode, LoaderConfig};
use crate::error::LoadError;
use crate::extract::text::decode;
use crate::extract::{ExtractOptions, RecordExtractor};
use crate::input::{InputUnit, UnitReader};
use crate::monitor::Monitor;
use crate::sink::{Content, RecordMeta, Sink};
use crate::skip::{SkipState, StartIdCheck};
use crate::timer::TimedEvent;
use crate::uri::KeyBuilder;

/// Everything a loader shares with its siblings for one run.
pub struct LoaderContext {
    pub options: Arc<ExtractOptions>,
    pub keys: KeyBuilder,
    pub skip: SkipState,
    pub sink: Arc<dyn Sink>,
    pub monitor: Monitor,
    /// Automatic id counter, shared across units
    pub sequence: Arc<AtomicU64>,
    format: ContentFormat,
    streaming: bool,
    fatal: bool,
    collections: Vec<String>,
    use_filename_collection: bool,
    delete_input: bool,
}

impl LoaderContext {
    pub fn new(
        config: &LoaderConfig,
        sink: Arc<dyn Sink>,
        monitor: Monitor,
    ) -> Result<Self, LoadError> {
        Ok(Self {
            options: Arc::new(ExtractOptions::from_config(config)?),
            keys: KeyBuilder::from_config(config),
            skip: SkipState::from_config(config),
            sink,
            monitor,
            sequence: Arc::new(AtomicU64::new(0)),
            format: config.content_format,
            streaming: config.streaming,
            fatal: config.fatal_errors,
            collections: config.collections.clone(),
            use_filename_collection: config.use_filename_collection,
            delete_input: config.delete_input,
        })
    }
}

/// Counters for one unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitOutcome {
    pub records: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub bytes: u64,
    /// Every record was reached; unset when a halt cut the unit short
    pub complete: bool,
}

impl UnitOutcome {
    /// Input may be deleted only after a clean unit.
    pub fn is_clean(&self) -> bool {
        self.complete && self.errors == 0
    }
}

enum Disposition {
    Inserted(u64),
    Skipped,
}

/// Loads every record of one input unit.
pub struct Loader {
    ctx: Arc<LoaderContext>,
    unit: InputUnit,
}

impl Loader {
    pub fn new(ctx: Arc<LoaderContext>, unit: InputUnit) -> Self {
        Self { ctx, unit }
    }

    /// Pool entry point. Fatal errors and panics halt the run; others are logged.
    pub fn run(self) {
        let ctx = self.ctx.clone();
        let name = self.unit.name().to_string();
        let result = match catch_unwind(AssertUnwindSafe(|| self.process())) {
            Ok(result) => result,
            Err(payload) => {
                let mut event = TimedEvent::start();
                event.set_error(true);
                event.stop();
                ctx.monitor.report(&event, false);
                Err(LoadError::Panicked(panic_message(&*payload)))
            }
        };
        match result {
            Ok(outcome) => log::debug!(
                "{name}: {} inserted, {} skipped, {} errors",
                outcome.inserted,
                outcome.skipped,
                outcome.errors
            ),
            Err(e) if ctx.fatal || e.is_always_fatal() => {
                log::debug!("{name}: {e}");
                ctx.monitor.halt(&e);
            }
            Err(e) => log::error!("{name}: {e}"),
        }
    }

    /// Load the unit, then release it: delete it after a clean load when
    /// configured, and drop its archive claim.
    pub fn process(mut self) -> Result<UnitOutcome, LoadError> {
        let mut outcome = UnitOutcome::default();
        let result = self.load(&mut outcome);
        let clean = result.is_ok() && outcome.is_clean();
        let finished = self.unit.finish(clean, self.ctx.delete_input);
        result?;
        finished?;
        Ok(outcome)
    }

    fn load(&mut self, outcome: &mut UnitOutcome) -> Result<(), LoadError> {
        let reader = match self.unit.open() {
            Ok(reader) => reader,
            Err(e) => {
                let mut event = TimedEvent::start();
                event.stop();
                return self.failed(e, "open", &mut event, outcome);
            }
        };
        match self.ctx.format {
            ContentFormat::Xml => self.records(reader, outcome),
            ContentFormat::Text | ContentFormat::Binary => self.whole(reader, outcome),
        }
    }

    fn collections(&self) -> Vec<String> {
        let mut collections = self.ctx.collections.clone();
        if self.ctx.use_filename_collection {
            if let Some(base) = self.unit.basename() {
                collections.push(base.to_string());
            }
        }
        collections
    }

    fn records(&self, reader: UnitReader, outcome: &mut UnitOutcome) -> Result<(), LoadError> {
        let ctx = &self.ctx;
        let mut extractor = RecordExtractor::new(
            reader,
            ctx.options.clone(),
            ctx.sequence.clone(),
            self.unit.basename().map(str::to_string),
        );
        let collections = self.collections();
        loop {
            if ctx.monitor.is_halted() {
                log::debug!("{}: halted after {} records", self.unit.name(), outcome.records);
                return Ok(());
            }
            let mut event = TimedEvent::start();
            let result = match extractor.next_record() {
                Ok(Some(_)) => self.record(&mut extractor, &collections),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            event.stop();
            outcome.records += 1;
            match result {
                Ok(disposition) => self.tally(disposition, &mut event, outcome),
                Err(e) => {
                    let at = format!("record {} near byte {}", outcome.records, extractor.position());
                    self.failed(e, &at, &mut event, outcome)?;
                    extractor.discard()?;
                }
            }
        }
        outcome.complete = true;
        Ok(())
    }

    /// Id, key, skip policy and insert for the record the extractor is on.
    fn record<R: BufRead>(
        &self,
        extractor: &mut RecordExtractor<R>,
        collections: &[String],
    ) -> Result<Disposition, LoadError> {
        let id = extractor.resolve_id()?;
        let key = self.ctx.keys.key(&id, self.unit.basename());
        if self.skip(&id, &key)? {
            extractor.discard()?;
            return Ok(Disposition::Skipped);
        }
        let meta = RecordMeta {
            key,
            collections: collections.to_vec(),
        };
        let sink = &self.ctx.sink;
        if self.ctx.streaming {
            let result = sink.insert(&meta, Content::Stream(&mut extractor.body()));
            if let Some(e) = extractor.take_error() {
                return Err(e);
            }
            Ok(Disposition::Inserted(result?))
        } else {
            let bytes = extractor.read_record()?;
            Ok(Disposition::Inserted(sink.insert(&meta, Content::Bytes(&bytes))?))
        }
    }

    /// Apply the start-id and existing-key policies. `true` means skip.
    fn skip(&self, id: &str, key: &str) -> Result<bool, LoadError> {
        let ctx = &self.ctx;
        match ctx.skip.check_start_id(id) {
            StartIdCheck::Skip => return Ok(true),
            StartIdCheck::Matched => {
                log::info!("Found start id {id}");
                ctx.monitor.reset_pool_limit();
                ctx.monitor.reset_throttle();
            }
            StartIdCheck::Inactive => {}
        }
        if !ctx.skip.should_check_existing() {
            return Ok(false);
        }
        if ctx.sink.exists(key)? {
            if ctx.skip.error_existing() {
                return Err(LoadError::Exists(key.to_string()));
            }
            if ctx.skip.skip_existing() {
                return Ok(true);
            }
        } else if ctx.skip.record_miss() {
            log::info!("{key} not found, no longer checking for existing records");
            ctx.monitor.reset_throttle();
        }
        Ok(false)
    }

    /// The whole unit as one text or binary record.
    fn whole(&self, mut reader: UnitReader, outcome: &mut UnitOutcome) -> Result<(), LoadError> {
        let mut event = TimedEvent::start();
        let result = self.whole_record(&mut reader);
        event.stop();
        outcome.records = 1;
        match result {
            Ok(disposition) => self.tally(disposition, &mut event, outcome),
            Err(e) => self.failed(e, "content", &mut event, outcome)?,
        }
        outcome.complete = true;
        Ok(())
    }

    fn whole_record(&self, reader: &mut UnitReader) -> Result<Disposition, LoadError> {
        let ctx = &self.ctx;
        let id = match (&ctx.options.id_mode, self.unit.basename()) {
            (IdMode::Auto, _) | (_, None) => {
                (ctx.sequence.fetch_add(1, Ordering::Relaxed) + 1).to_string()
            }
            (_, Some(base)) => base.to_string(),
        };
        let key = ctx.keys.key(&id, self.unit.basename());
        if self.skip(&id, &key)? {
            return Ok(Disposition::Skipped);
        }
        let meta = RecordMeta {
            key,
            collections: self.collections(),
        };
        if ctx.format == ContentFormat::Binary && ctx.streaming {
            return Ok(Disposition::Inserted(
                ctx.sink.insert(&meta, Content::Stream(reader))?,
            ));
        }
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let written = match ctx.format {
            ContentFormat::Text => {
                let text = decode(&bytes, ctx.options.malformed)?;
                ctx.sink.insert(&meta, Content::Bytes(text.as_bytes()))?
            }
            _ => ctx.sink.insert(&meta, Content::Bytes(&bytes))?,
        };
        Ok(Disposition::Inserted(written))
    }

    fn tally(&self, disposition: Disposition, event: &mut TimedEvent, outcome: &mut UnitOutcome) {
        match disposition {
            Disposition::Inserted(bytes) => {
                event.add_bytes(bytes);
                outcome.inserted += 1;
                outcome.bytes += bytes;
                self.ctx.monitor.report(event, false);
            }
            Disposition::Skipped => {
                outcome.skipped += 1;
                self.ctx.monitor.report(event, true);
            }
        }
    }

    /// Count a failed record. Returns the error when it must end the unit.
    fn failed(
        &self,
        e: LoadError,
        at: &str,
        event: &mut TimedEvent,
        outcome: &mut UnitOutcome,
    ) -> Result<(), LoadError> {
        event.set_error(true);
        outcome.errors += 1;
        self.ctx.monitor.report(event, false);
        if self.ctx.fatal || e.is_always_fatal() || !e.is_record_level() {
            return Err(e);
        }
        log::warn!("{}: {at}: {e}", self.unit.name());
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorSettings;
    use crate::sink::MemorySink;
    use indicatif::ProgressBar;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn monitor() -> Monitor {
        let settings = MonitorSettings {
            interval: Duration::from_secs(60),
            throttle: None,
            full_pool_limit: 2,
            interrupt: Box::leak(Box::new(AtomicBool::new(false))),
        };
        Monitor::start(settings, ProgressBar::hidden()).unwrap()
    }

    fn config(f: impl FnOnce(&mut LoaderConfig)) -> LoaderConfig {
        let mut config = LoaderConfig {
            record_name: Some("rec".into()),
            id_name: "@id".into(),
            ..Default::default()
        };
        f(&mut config);
        config
    }

    fn load(
        config: &LoaderConfig,
        sink: Arc<MemorySink>,
        input: &str,
    ) -> (Result<UnitOutcome, LoadError>, Monitor) {
        let monitor = monitor();
        let ctx = LoaderContext::new(config, sink, monitor.clone()).unwrap();
        let unit = InputUnit::bytes("batch.xml", input.as_bytes().to_vec());
        let result = Loader::new(Arc::new(ctx), unit).process();
        (result, monitor)
    }

    const TWO: &str = r#"<root><rec id="1">A</rec><rec id="2">B</rec></root>"#;

    #[test]
    fn inserts_each_record_under_its_key() {
        let sink = Arc::new(MemorySink::new());
        let config = config(|c| c.uri_prefix = "prefix/".into());
        let (result, monitor) = load(&config, sink.clone(), TWO);
        let outcome = result.unwrap();
        assert_eq!(outcome.inserted, 2);
        assert!(outcome.is_clean());
        assert_eq!(sink.keys(), ["prefix/1", "prefix/2"]);
        assert_eq!(sink.get("prefix/1").unwrap().content, br#"<rec id="1">A</rec>"#);
        assert_eq!(sink.get("prefix/2").unwrap().content, br#"<rec id="2">B</rec>"#);
        assert_eq!(monitor.finish().totals.events, 2);
    }

    #[test]
    fn streaming_matches_buffered() {
        let sink = Arc::new(MemorySink::new());
        let config = config(|c| c.streaming = true);
        let (result, monitor) = load(&config, sink.clone(), TWO);
        assert_eq!(result.unwrap().inserted, 2);
        assert_eq!(sink.get("2").unwrap().content, br#"<rec id="2">B</rec>"#);
        monitor.finish();
    }

    #[test]
    fn skip_existing_skips_and_counts() {
        let sink = Arc::new(MemorySink::with_keys(["1"]));
        let config = config(|c| c.skip_existing = true);
        let (result, monitor) = load(&config, sink.clone(), TWO);
        let outcome = result.unwrap();
        assert_eq!((outcome.inserted, outcome.skipped), (1, 1));
        assert!(sink.get("1").unwrap().content.is_empty());
        assert_eq!(monitor.finish().skipped, 1);
    }

    #[test]
    fn error_existing_is_fatal_even_when_not_fatal() {
        let sink = Arc::new(MemorySink::with_keys(["2"]));
        let config = config(|c| {
            c.error_existing = true;
            c.fatal_errors = false;
        });
        let (result, monitor) = load(&config, sink.clone(), TWO);
        assert!(matches!(result, Err(LoadError::Exists(key)) if key == "2"));
        assert_eq!(sink.inserts(), 1);
        monitor.finish();
    }

    #[test]
    fn first_miss_stops_checking() {
        let input = r#"<r><rec id="a"/><rec id="b"/><rec id="c"/></r>"#;
        let sink = Arc::new(MemorySink::with_keys(["a", "c"]));
        let config = config(|c| {
            c.skip_existing = true;
            c.skip_existing_until_first_miss = true;
        });
        let (result, monitor) = load(&config, sink.clone(), input);
        let outcome = result.unwrap();
        // "c" exists but checking stopped at the miss on "b"
        assert_eq!((outcome.skipped, outcome.inserted), (1, 2));
        assert_eq!(sink.get("c").unwrap().content, br#"<rec id="c"/>"#);
        monitor.finish();
    }

    #[test]
    fn start_id_skips_until_match() {
        let input = r#"<r><rec id="a"/><rec id="b"/><rec id="c"/><rec id="d"/></r>"#;
        let sink = Arc::new(MemorySink::new());
        let config = config(|c| c.start_id = Some("c".into()));
        let (result, monitor) = load(&config, sink.clone(), input);
        let outcome = result.unwrap();
        assert_eq!(outcome.skipped, 2);
        assert_eq!(sink.keys(), ["c", "d"]);
        monitor.finish();
    }

    #[test]
    fn bad_record_skipped_when_not_fatal() {
        let input = r#"<r><rec>no id</rec><rec id="2">B</rec></r>"#;
        let sink = Arc::new(MemorySink::new());
        let config = config(|c| c.fatal_errors = false);
        let (result, monitor) = load(&config, sink.clone(), input);
        let outcome = result.unwrap();
        assert_eq!((outcome.errors, outcome.inserted), (1, 1));
        assert!(!outcome.is_clean());
        assert_eq!(sink.keys(), ["2"]);
        assert_eq!(monitor.finish().totals.errors, 1);
    }

    #[test]
    fn unreadable_unit_counted_as_error() {
        let sink = Arc::new(MemorySink::new());
        let config = config(|c| c.fatal_errors = false);
        let monitor = monitor();
        let ctx = LoaderContext::new(&config, sink, monitor.clone()).unwrap();
        let unit = InputUnit::file("/nonexistent/docline/unit.xml");
        let result = Loader::new(Arc::new(ctx), unit).process();
        assert!(matches!(result, Err(LoadError::Io(_))));
        let report = monitor.finish();
        assert_eq!((report.totals.events, report.totals.errors), (1, 1));
    }

    struct PanickingSink;

    impl Sink for PanickingSink {
        fn exists(&self, _key: &str) -> Result<bool, crate::sink::SinkError> {
            Ok(false)
        }

        fn insert(
            &self,
            _meta: &RecordMeta,
            _content: Content<'_>,
        ) -> Result<u64, crate::sink::SinkError> {
            panic!("sink exploded")
        }

        fn close(&self) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
    }

    #[test]
    fn panic_halts_run_and_counts_error() {
        for fatal in [true, false] {
            let config = config(|c| c.fatal_errors = fatal);
            let monitor = monitor();
            let ctx = LoaderContext::new(&config, Arc::new(PanickingSink), monitor.clone()).unwrap();
            let unit = InputUnit::bytes("batch.xml", TWO.as_bytes().to_vec());
            Loader::new(Arc::new(ctx), unit).run();
            assert!(monitor.is_halted());
            let report = monitor.finish();
            assert_eq!(report.totals.errors, 1);
            let cause = report.cause.unwrap();
            assert!(cause.contains("sink exploded"), "{cause}");
        }
    }

    #[test]
    fn bad_record_ends_unit_when_fatal() {
        let input = r#"<r><rec>no id</rec><rec id="2">B</rec></r>"#;
        let sink = Arc::new(MemorySink::new());
        let (result, monitor) = load(&config(|_| {}), sink.clone(), input);
        assert!(matches!(result, Err(LoadError::Structure(_))));
        assert!(sink.is_empty());
        monitor.finish();
    }

    #[test]
    fn collections_include_basename() {
        let sink = Arc::new(MemorySink::new());
        let config = config(|c| {
            c.collections = vec!["batch".into()];
            c.use_filename_collection = true;
        });
        let (result, monitor) = load(&config, sink.clone(), TWO);
        result.unwrap();
        assert_eq!(sink.get("1").unwrap().collections, ["batch", "batch.xml"]);
        monitor.finish();
    }

    #[test]
    fn text_unit_is_one_record() {
        let sink = Arc::new(MemorySink::new());
        let config = config(|c| {
            c.content_format = ContentFormat::Text;
            c.id_name = "#FILENAME".into();
            c.uri_prefix = "/text/".into();
        });
        let (result, monitor) = load(&config, sink.clone(), "just some text");
        assert_eq!(result.unwrap().inserted, 1);
        assert_eq!(sink.get("/text/batch.xml").unwrap().content, b"just some text");
        monitor.finish();
    }

    #[test]
    fn halted_monitor_stops_unit() {
        let sink = Arc::new(MemorySink::new());
        let monitor = monitor();
        monitor.halt(&LoadError::Interrupted);
        let ctx = LoaderContext::new(&config(|_| {}), sink.clone(), monitor.clone()).unwrap();
        let unit = InputUnit::bytes("batch.xml", TWO.as_bytes().to_vec());
        let outcome = Loader::new(Arc::new(ctx), unit).process().unwrap();
        assert!(!outcome.complete);
        assert!(sink.is_empty());
        monitor.finish();
    }
}
