//! Record extraction from a markup token stream
//!
//! [`RecordExtractor`] walks a `quick-xml` event stream and re-serializes one
//! record at a time. Bytes are produced incrementally through [`RecordBody`],
//! so a record can be streamed to a sink without holding the container in
//! memory. Namespace declarations in scope at the record root are re-declared
//! on the root tag so every fragment stands alone.

mod namespaces;
pub mod text;

use std::io::{self, BufRead, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::config::{BoundaryRule, IdMode, LoaderConfig, MalformedAction};
use crate::error::LoadError;
use namespaces::{NamespaceStack, declared_prefix, split_qname};
use text::{EntityPolicy, decode};

/// Settings shared by every extractor of a run
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub boundary: BoundaryRule,
    pub id_mode: IdMode,
    /// Token-level problems fail the record instead of being repaired
    pub fatal: bool,
    pub malformed: MalformedAction,
    pub entities: EntityPolicy,
}

impl ExtractOptions {
    pub fn from_config(config: &LoaderConfig) -> Result<Self, LoadError> {
        Ok(Self {
            boundary: config.boundary(),
            id_mode: config.id_mode()?,
            fatal: config.fatal_errors,
            malformed: config.malformed_input,
            entities: EntityPolicy {
                fatal: config.fatal_errors,
                replacement: config.entity_replacement.clone(),
            },
        })
    }
}

/// What is known about a record when its start tag is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHead {
    /// Local name of the record root
    pub name: String,
    pub namespace: Option<String>,
    /// Unset until [`RecordExtractor::resolve_id`] when ids come from a child element
    pub id: Option<String>,
}

/// A start or empty tag with its attributes parsed.
#[derive(Debug)]
struct Tag {
    qname: String,
    /// (key, raw value) in document order
    attrs: Vec<(String, String)>,
    /// Namespace declarations, values resolved
    decls: Vec<(String, String)>,
    /// A malformed attribute was dropped; the tag must be rebuilt
    dropped: bool,
}

impl Tag {
    fn parse(e: &BytesStart<'_>, options: &ExtractOptions) -> Result<Self, LoadError> {
        let qname = decode(e.name().as_ref(), options.malformed)?.into_owned();
        let mut attrs = Vec::new();
        let mut decls = Vec::new();
        let mut dropped = false;
        for attr in e.attributes() {
            let attr = match attr {
                Ok(attr) => attr,
                Err(err) if options.fatal => {
                    return Err(LoadError::Attribute(format!("<{qname}>: {err}")));
                }
                Err(err) => {
                    log::debug!("dropping malformed attribute on <{qname}>: {err}");
                    dropped = true;
                    break;
                }
            };
            let key = decode(attr.key.as_ref(), options.malformed)?.into_owned();
            let value = decode(&attr.value, options.malformed)?.into_owned();
            if let Some(prefix) = declared_prefix(&key) {
                decls.push((
                    prefix.to_string(),
                    text::unescape(&value, &options.entities)?,
                ));
            }
            attrs.push((key, value));
        }
        Ok(Self {
            qname,
            attrs,
            decls,
            dropped,
        })
    }

    fn prefix(&self) -> &str {
        split_qname(&self.qname).0
    }

    fn local(&self) -> &str {
        split_qname(&self.qname).1
    }

    /// Serialize the tag, appending `extra` namespace declarations.
    ///
    /// The original text is kept unless an attribute had to be dropped.
    fn write(
        &self,
        raw: &[u8],
        extra: &[(String, String)],
        empty: bool,
        action: MalformedAction,
        out: &mut Vec<u8>,
    ) -> Result<(), LoadError> {
        out.push(b'<');
        if self.dropped {
            out.extend_from_slice(self.qname.as_bytes());
            for (key, value) in &self.attrs {
                out.push(b' ');
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(b"=\"");
                for b in value.bytes() {
                    match b {
                        b'"' => out.extend_from_slice(b"&quot;"),
                        b'<' => out.extend_from_slice(b"&lt;"),
                        _ => out.push(b),
                    }
                }
                out.push(b'"');
            }
        } else {
            let raw = decode(raw, action)?;
            out.extend_from_slice(raw.trim_end().as_bytes());
        }
        for (prefix, uri) in extra {
            out.extend_from_slice(b" xmlns");
            if !prefix.is_empty() {
                out.push(b':');
                out.extend_from_slice(prefix.as_bytes());
            }
            out.extend_from_slice(b"=\"");
            text::escape_into(uri, true, out);
            out.push(b'"');
        }
        let close: &[u8] = if empty { b"/>" } else { b">" };
        out.extend_from_slice(close);
        Ok(())
    }
}

#[derive(Debug)]
struct IdCapture {
    depth: usize,
    text: String,
}

#[derive(Debug)]
struct RecordState {
    /// Element depth of the record root
    depth: usize,
    qname: Vec<u8>,
    name: String,
    id: Option<String>,
    id_capture: Option<IdCapture>,
    /// Skip fast-path: advance to the end tag without buffering
    skipping: bool,
    finished: bool,
    out: Vec<u8>,
    pos: usize,
}

/// Splits one input into records.
///
/// Records are produced strictly in document order. Only one record is open
/// at a time; calling [`next_record`](Self::next_record) discards whatever is
/// left of the previous one.
pub struct RecordExtractor<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    options: Arc<ExtractOptions>,
    /// Run-wide counter for automatic ids
    sequence: Arc<AtomicU64>,
    filename_id: Option<String>,
    namespaces: NamespaceStack,
    record: Option<RecordState>,
    done: bool,
    error: Option<LoadError>,
}

impl<R: BufRead> RecordExtractor<R> {
    pub fn new(
        input: R,
        options: Arc<ExtractOptions>,
        sequence: Arc<AtomicU64>,
        filename_id: Option<String>,
    ) -> Self {
        let mut reader = Reader::from_reader(input);
        let config = reader.config_mut();
        config.trim_text(false);
        config.expand_empty_elements = false;
        config.check_end_names = true;
        Self {
            reader,
            buf: Vec::with_capacity(8 * 1024),
            options,
            sequence,
            filename_id,
            namespaces: NamespaceStack::new(),
            record: None,
            done: false,
            error: None,
        }
    }

    /// Advance to the next record start.
    ///
    /// Returns `Ok(None)` at end of input. On an identifier error the record
    /// is still open, so the caller can [`discard`](Self::discard) it and go on.
    pub fn next_record(&mut self) -> Result<Option<RecordHead>, LoadError> {
        if self.record.as_ref().is_some_and(|r| !r.finished) {
            self.discard()?;
        }
        self.record = None;
        self.error = None;
        let mut buf = std::mem::take(&mut self.buf);
        let result = self.scan(&mut buf);
        self.buf = buf;
        result
    }

    fn scan(&mut self, buf: &mut Vec<u8>) -> Result<Option<RecordHead>, LoadError> {
        while !self.done {
            buf.clear();
            let (e, empty) = match self.read_event(buf)? {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(_) => {
                    self.namespaces.pop_scope();
                    continue;
                }
                Event::Eof => {
                    self.done = true;
                    break;
                }
                _ => continue,
            };
            let tag = match Tag::parse(&e, &self.options) {
                Ok(tag) => tag,
                Err(err) => {
                    if !empty {
                        self.namespaces.push_scope(Vec::new());
                    }
                    return Err(err);
                }
            };
            self.namespaces.push_scope(tag.decls.iter().cloned());
            let namespace = self.namespaces.resolve(tag.prefix()).map(str::to_string);
            let is_record = match &self.options.boundary {
                BoundaryRule::WholeDocument => self.namespaces.depth() == 1,
                rule => rule.matches(tag.local(), namespace.as_deref()),
            };
            if is_record {
                return self.begin(&e, tag, namespace, empty).map(Some);
            }
            if empty {
                self.namespaces.pop_scope();
            }
        }
        Ok(None)
    }

    fn begin(
        &mut self,
        e: &BytesStart<'_>,
        tag: Tag,
        namespace: Option<String>,
        empty: bool,
    ) -> Result<RecordHead, LoadError> {
        let depth = self.namespaces.depth();
        let extra: Vec<(String, String)> = self
            .namespaces
            .in_scope()
            .into_iter()
            .filter(|(prefix, uri)| {
                !uri.is_empty() && !tag.decls.iter().any(|(declared, _)| declared == prefix)
            })
            .map(|(prefix, uri)| (prefix.to_string(), uri.to_string()))
            .collect();
        let id = self.initial_id(&tag, namespace.as_deref());
        if empty {
            self.namespaces.pop_scope();
        }
        self.record = Some(RecordState {
            depth,
            qname: e.name().as_ref().to_vec(),
            name: tag.qname.clone(),
            id: None,
            id_capture: None,
            skipping: false,
            finished: empty,
            out: Vec::new(),
            pos: 0,
        });

        let mut out = Vec::with_capacity(e.len() + 64);
        tag.write(e, &extra, empty, self.options.malformed, &mut out)?;
        let id = id?;
        let rec = self.current()?;
        rec.out = out;
        rec.id = id.clone();
        Ok(RecordHead {
            name: tag.local().to_string(),
            namespace,
            id,
        })
    }

    /// Identifier known from the start tag alone.
    fn initial_id(&self, tag: &Tag, namespace: Option<&str>) -> Result<Option<String>, LoadError> {
        match &self.options.id_mode {
            IdMode::Element(_) => Ok(None),
            IdMode::Auto => {
                let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(Some(n.to_string()))
            }
            IdMode::Filename => match &self.filename_id {
                Some(name) => Ok(Some(name.clone())),
                None => Err(LoadError::Structure(
                    "file name id requested for an unnamed input".into(),
                )),
            },
            IdMode::Attribute(name) => {
                let plain = tag.attrs.iter().find(|(key, _)| key == name);
                let qualified = || {
                    tag.attrs.iter().find(|(key, _)| {
                        let (prefix, local) = split_qname(key);
                        !prefix.is_empty()
                            && prefix != "xmlns"
                            && local == name
                            && self.namespaces.resolve(prefix) == namespace
                    })
                };
                match plain.or_else(qualified) {
                    Some((_, value)) => text::unescape(value, &self.options.entities).map(Some),
                    None => Err(LoadError::Structure(format!(
                        "<{}> has no {name} attribute",
                        tag.qname
                    ))),
                }
            }
        }
    }

    /// Identifier of the current record, reading ahead to the id element if needed.
    pub fn resolve_id(&mut self) -> Result<String, LoadError> {
        loop {
            let Some(rec) = self.record.as_ref() else {
                return Err(LoadError::Structure("no record is open".into()));
            };
            match &rec.id {
                Some(id) if id.is_empty() => {
                    return Err(LoadError::Structure(format!(
                        "<{}> has an empty identifier",
                        rec.name
                    )));
                }
                Some(id) => return Ok(id.clone()),
                None if rec.finished => {
                    let element = match &self.options.id_mode {
                        IdMode::Element(name) => name.as_str(),
                        _ => "id",
                    };
                    return Err(LoadError::Structure(format!(
                        "<{}> has no {element} element",
                        rec.name
                    )));
                }
                None => self.step()?,
            }
        }
    }

    /// Pull interface over the current record's bytes.
    pub fn body(&mut self) -> RecordBody<'_, R> {
        RecordBody { extractor: self }
    }

    /// Read the rest of the current record into memory.
    pub fn read_record(&mut self) -> Result<Vec<u8>, LoadError> {
        let mut bytes = Vec::new();
        let result = self.body().read_to_end(&mut bytes);
        match result {
            Ok(_) => Ok(bytes),
            Err(e) => Err(self.take_error().unwrap_or(LoadError::Io(e))),
        }
    }

    /// Skip the rest of the current record without buffering it.
    pub fn discard(&mut self) -> Result<(), LoadError> {
        let Some(rec) = self.record.as_mut() else {
            return Ok(());
        };
        rec.skipping = true;
        rec.id_capture = None;
        rec.out = Vec::new();
        rec.pos = 0;
        while self.record.as_ref().is_some_and(|r| !r.finished) {
            self.step()?;
        }
        Ok(())
    }

    /// Error behind the last failed read of [`RecordBody`].
    pub fn take_error(&mut self) -> Option<LoadError> {
        self.error.take()
    }

    /// Byte offset of the token reader in the input
    pub fn position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    fn current(&mut self) -> Result<&mut RecordState, LoadError> {
        self.record
            .as_mut()
            .ok_or_else(|| LoadError::Structure("no record is open".into()))
    }

    fn read_event<'b>(&mut self, buf: &'b mut Vec<u8>) -> Result<Event<'b>, LoadError> {
        match self.reader.read_event_into(buf) {
            Ok(event) => Ok(event),
            Err(e) => {
                self.done = true;
                if let Some(rec) = self.record.as_mut() {
                    rec.finished = true;
                }
                Err(LoadError::Xml {
                    position: self.reader.error_position() as u64,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Consume one token of the open record.
    fn step(&mut self) -> Result<(), LoadError> {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let result = self.step_with(&mut buf);
        self.buf = buf;
        result
    }

    fn step_with(&mut self, buf: &mut Vec<u8>) -> Result<(), LoadError> {
        let event = self.read_event(buf)?;
        let options = Arc::clone(&self.options);
        let Some(rec) = self.record.as_mut() else {
            return Ok(());
        };
        let id_element = match &options.id_mode {
            IdMode::Element(name) if rec.id.is_none() && rec.id_capture.is_none() => {
                Some(name.as_str())
            }
            _ => None,
        };

        match event {
            Event::Start(e) => {
                if rec.skipping {
                    self.namespaces.push_scope(Vec::new());
                    return Ok(());
                }
                let tag = match Tag::parse(&e, &options) {
                    Ok(tag) => tag,
                    Err(err) => {
                        self.namespaces.push_scope(Vec::new());
                        return Err(err);
                    }
                };
                self.namespaces.push_scope(tag.decls.iter().cloned());
                tag.write(&e, &[], false, options.malformed, &mut rec.out)?;
                if id_element.is_some_and(|name| tag.local() == name) {
                    rec.id_capture = Some(IdCapture {
                        depth: self.namespaces.depth(),
                        text: String::new(),
                    });
                }
            }
            Event::Empty(e) => {
                if rec.skipping {
                    return Ok(());
                }
                let tag = Tag::parse(&e, &options)?;
                tag.write(&e, &[], true, options.malformed, &mut rec.out)?;
                if id_element.is_some_and(|name| tag.local() == name) {
                    rec.id = Some(String::new());
                }
            }
            Event::End(e) => {
                let depth = self.namespaces.depth();
                self.namespaces.pop_scope();
                if rec.id_capture.as_ref().is_some_and(|c| c.depth == depth) {
                    if let Some(capture) = rec.id_capture.take() {
                        rec.id = Some(capture.text);
                    }
                }
                if depth == rec.depth && e.name().as_ref() == rec.qname.as_slice() {
                    rec.finished = true;
                }
                if !rec.skipping {
                    let qname = e.name();
                    let name = decode(qname.as_ref(), options.malformed)?;
                    rec.out.extend_from_slice(b"</");
                    rec.out.extend_from_slice(name.as_bytes());
                    rec.out.push(b'>');
                }
            }
            Event::Text(e) => {
                if rec.skipping {
                    return Ok(());
                }
                let raw = decode(&e, options.malformed)?;
                text::write_text(&raw, &options.entities, &mut rec.out)?;
                if let Some(capture) = rec.id_capture.as_mut() {
                    capture
                        .text
                        .push_str(&text::unescape(&raw, &options.entities)?);
                }
            }
            Event::CData(e) => {
                if rec.skipping {
                    return Ok(());
                }
                let raw = decode(&e, options.malformed)?;
                rec.out.extend_from_slice(b"<![CDATA[");
                rec.out.extend_from_slice(raw.as_bytes());
                rec.out.extend_from_slice(b"]]>");
                if let Some(capture) = rec.id_capture.as_mut() {
                    capture.text.push_str(&raw);
                }
            }
            Event::Comment(e) => {
                if !rec.skipping {
                    wrap(&mut rec.out, b"<!--", &e, b"-->", options.malformed)?;
                }
            }
            Event::PI(e) => {
                if !rec.skipping {
                    wrap(&mut rec.out, b"<?", &e, b"?>", options.malformed)?;
                }
            }
            Event::DocType(e) => {
                if !rec.skipping {
                    wrap(&mut rec.out, b"<!DOCTYPE ", &e, b">", options.malformed)?;
                }
            }
            Event::Eof => {
                self.done = true;
                rec.finished = true;
                if !rec.skipping {
                    return Err(LoadError::Structure(format!(
                        "end of document inside <{}>",
                        rec.name
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn wrap(
    out: &mut Vec<u8>,
    open: &[u8],
    raw: &[u8],
    close: &[u8],
    action: MalformedAction,
) -> Result<(), LoadError> {
    let raw = decode(raw, action)?;
    out.extend_from_slice(open);
    out.extend_from_slice(raw.as_bytes());
    out.extend_from_slice(close);
    Ok(())
}

/// Lazy, finite, non-restartable byte stream of one record.
///
/// Each read consumes tokens only until enough bytes are buffered. A failed
/// read leaves the underlying error in [`RecordExtractor::take_error`].
pub struct RecordBody<'a, R: BufRead> {
    extractor: &'a mut RecordExtractor<R>,
}

impl<R: BufRead> Read for RecordBody<'_, R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            let x = &mut *self.extractor;
            if x.error.is_some() {
                return Err(io::Error::other("record extraction already failed"));
            }
            let Some(rec) = x.record.as_mut() else {
                return Ok(0);
            };
            if rec.pos < rec.out.len() {
                let n = dst.len().min(rec.out.len() - rec.pos);
                dst[..n].copy_from_slice(&rec.out[rec.pos..rec.pos + n]);
                rec.pos += n;
                if rec.pos == rec.out.len() {
                    rec.out.clear();
                    rec.pos = 0;
                }
                return Ok(n);
            }
            if rec.finished {
                return Ok(0);
            }
            if let Err(e) = x.step() {
                let message = e.to_string();
                x.error = Some(e);
                return Err(io::Error::other(message));
            }
        }
    }
}
