use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use refcheck_core::{DocumentStore, Field, FieldSelector, ReconcileError, Record};
use sha2::{Digest, Sha256};
use ulid::Ulid;

const UTF8_BOM: char = '\u{feff}';
const INDENT_SIZE: usize = 2;

/// A flat XML document: one root element whose children are records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    pub root: String,
    pub root_attributes: Vec<Field>,
    pub records: Vec<Record>,
    /// The XML declaration as written in the source, replayed verbatim on save.
    pub declaration: Option<BytesDecl<'static>>,
}

#[derive(Debug, Default)]
struct DocumentBuilder {
    root: Option<(String, Vec<Field>)>,
    root_closed: bool,
    records: Vec<Record>,
    record: Option<Record>,
    field: Option<Field>,
    depth: usize,
}

impl DocumentBuilder {
    fn open(&mut self, name: String, attributes: Vec<Field>) -> Result<()> {
        match self.depth {
            0 => {
                if self.root.is_some() {
                    bail!("document has more than one root element: <{name}>");
                }
                self.root = Some((name, attributes));
            }
            1 => {
                self.record = Some(Record { kind: name, attributes, fields: Vec::new() });
            }
            2 => {
                if !attributes.is_empty() {
                    bail!("field element <{name}> carries attributes, which are not supported");
                }
                self.field = Some(Field::new(name, String::new()));
            }
            _ => bail!("element <{name}> is nested below the record field level"),
        }
        self.depth += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.depth {
            3 => {
                let field = self.field.take().context("field element closed twice")?;
                self.record.as_mut().context("field element outside a record")?.fields.push(field);
            }
            2 => {
                let record = self.record.take().context("record element closed twice")?;
                self.records.push(record);
            }
            1 => self.root_closed = true,
            _ => bail!("unexpected closing tag outside the root element"),
        }
        self.depth -= 1;
        Ok(())
    }

    // Field text is kept byte for byte; whitespace anywhere else is layout.
    fn text(&mut self, value: &str) -> Result<()> {
        match (self.depth, self.field.as_mut()) {
            (3, Some(field)) => {
                field.value.push_str(value);
                Ok(())
            }
            _ if value.trim().is_empty() => Ok(()),
            _ => Err(anyhow!("text content `{}` appears outside a field element", preview(value))),
        }
    }

    fn finish(self, declaration: Option<BytesDecl<'static>>) -> Result<XmlDocument> {
        let Some((root, root_attributes)) = self.root else {
            bail!("document has no root element");
        };
        if !self.root_closed || self.depth != 0 {
            bail!("root element <{root}> is not closed");
        }
        Ok(XmlDocument { root, root_attributes, records: self.records, declaration })
    }
}

fn preview(value: &str) -> String {
    const LIMIT: usize = 32;
    if value.chars().count() <= LIMIT {
        value.to_string()
    } else {
        format!("{}...", value.chars().take(LIMIT).collect::<String>())
    }
}

fn element_name(start: &BytesStart<'_>) -> Result<String> {
    let name = std::str::from_utf8(start.name().as_ref())
        .context("element name is not valid UTF-8")?
        .to_string();
    Ok(name)
}

fn element_attributes(start: &BytesStart<'_>) -> Result<Vec<Field>> {
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.context("malformed attribute")?;
        let name = std::str::from_utf8(attribute.key.as_ref())
            .context("attribute name is not valid UTF-8")?;
        let value = attribute
            .unescape_value()
            .with_context(|| format!("invalid value for attribute `{name}`"))?;
        attributes.push(Field::new(name, value.into_owned()));
    }
    Ok(attributes)
}

/// Parse a flat record document.
///
/// # Errors
/// Returns an error for malformed XML, a missing or repeated root element,
/// elements nested below the field level, or text outside field elements.
pub fn parse_document(source: &str) -> Result<XmlDocument> {
    let source = source.strip_prefix(UTF8_BOM).unwrap_or(source);
    let mut reader = Reader::from_str(source);

    let mut builder = DocumentBuilder::default();
    let mut declaration = None;
    loop {
        let position = reader.buffer_position();
        let event = reader
            .read_event()
            .with_context(|| format!("malformed XML near byte {position}"))?;
        match event {
            Event::Decl(decl) => declaration = Some(decl.into_owned()),
            Event::Start(start) => {
                builder.open(element_name(&start)?, element_attributes(&start)?)?;
            }
            Event::Empty(start) => {
                builder.open(element_name(&start)?, element_attributes(&start)?)?;
                builder.close()?;
            }
            Event::End(_) => builder.close()?,
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .with_context(|| format!("invalid text content near byte {position}"))?;
                builder.text(&value)?;
            }
            Event::CData(cdata) => {
                let bytes = cdata.into_inner();
                let value = std::str::from_utf8(&bytes)
                    .with_context(|| format!("CDATA near byte {position} is not valid UTF-8"))?;
                builder.text(value)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    builder.finish(declaration)
}

/// Render a document back to indented XML.
///
/// # Errors
/// Returns an error when the XML writer fails.
pub fn render_document(document: &XmlDocument) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', INDENT_SIZE);

    if let Some(declaration) = &document.declaration {
        writer
            .write_event(Event::Decl(declaration.clone()))
            .context("failed to write XML declaration")?;
    }

    let mut root = BytesStart::new(document.root.as_str());
    for attribute in &document.root_attributes {
        root.push_attribute((attribute.name.as_str(), attribute.value.as_str()));
    }
    if document.records.is_empty() {
        writer.write_event(Event::Empty(root)).context("failed to write root element")?;
    } else {
        writer.write_event(Event::Start(root)).context("failed to write root element")?;
        for record in &document.records {
            write_record(&mut writer, record)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(document.root.as_str())))
            .context("failed to close root element")?;
    }

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn write_record(writer: &mut Writer<Vec<u8>>, record: &Record) -> Result<()> {
    let mut start = BytesStart::new(record.kind.as_str());
    for attribute in &record.attributes {
        start.push_attribute((attribute.name.as_str(), attribute.value.as_str()));
    }

    if record.fields.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .with_context(|| format!("failed to write record <{}>", record.kind));
    }

    writer
        .write_event(Event::Start(start))
        .with_context(|| format!("failed to write record <{}>", record.kind))?;
    for field in &record.fields {
        let field_start = BytesStart::new(field.name.as_str());
        if field.value.is_empty() {
            writer
                .write_event(Event::Empty(field_start))
                .with_context(|| format!("failed to write field <{}>", field.name))?;
            continue;
        }
        writer
            .write_event(Event::Start(field_start))
            .with_context(|| format!("failed to write field <{}>", field.name))?;
        writer
            .write_event(Event::Text(BytesText::new(&field.value)))
            .with_context(|| format!("failed to write text of field <{}>", field.name))?;
        writer
            .write_event(Event::End(BytesEnd::new(field.name.as_str())))
            .with_context(|| format!("failed to close field <{}>", field.name))?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(record.kind.as_str())))
        .with_context(|| format!("failed to close record <{}>", record.kind))
}

fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Follow symlinks so the rewrite lands on the file the link points at.
fn resolve_target(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(target) => Ok(target),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(path.to_path_buf()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to resolve document path {}", path.display()))
        }
    }
}

fn replace_with(temp_path: &Path, target: &Path) -> Result<()> {
    match fs::metadata(target) {
        Ok(metadata) => fs::set_permissions(temp_path, metadata.permissions()).with_context(|| {
            format!("failed to copy permissions of {} to {}", target.display(), temp_path.display())
        })?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read metadata of {}", target.display()));
        }
    }
    fs::rename(temp_path, target).with_context(|| {
        format!("failed to replace document {} with {}", target.display(), temp_path.display())
    })
}

/// Write through a sibling temp file renamed over the resolved target of
/// `path`, so readers see either the old or the new document.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let target = resolve_target(path)?;
    let file_name = target
        .file_name()
        .ok_or_else(|| anyhow!("document path has no file name: {}", target.display()))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(format!(".{}.tmp", Ulid::new()));
    let temp_path = target.with_file_name(temp_name);

    fs::write(&temp_path, bytes)
        .with_context(|| format!("failed to write temporary document {}", temp_path.display()))?;
    if let Err(err) = replace_with(&temp_path, &target) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}

/// Document store backed by one XML file on disk.
#[derive(Debug, Clone)]
pub struct XmlDocumentStore {
    path: PathBuf,
    document: XmlDocument,
    digest: String,
}

impl XmlDocumentStore {
    /// Read and parse the document at `path`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, is not UTF-8, or fails
    /// [`parse_document`].
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read document {}", path.display()))?;
        let source = std::str::from_utf8(&bytes)
            .with_context(|| format!("document {} is not valid UTF-8", path.display()))?;
        let document = parse_document(source)
            .with_context(|| format!("failed to parse document {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), document, digest: sha256_digest(&bytes) })
    }

    #[must_use]
    pub fn document(&self) -> &XmlDocument {
        &self.document
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Rewrite the full document to its original path.
    ///
    /// # Errors
    /// Returns an error when rendering or the atomic write fails.
    pub fn persist(&mut self) -> Result<()> {
        let bytes = render_document(&self.document)?;
        write_atomically(&self.path, &bytes)?;
        self.digest = sha256_digest(&bytes);
        Ok(())
    }
}

impl DocumentStore for XmlDocumentStore {
    fn open(path: &Path) -> Result<Self, ReconcileError> {
        Self::load(path).map_err(|err| ReconcileError::LoadFailed(format!("{err:#}")))
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> &[Record] {
        &self.document.records
    }

    fn remove_record(&mut self, kind: &str, selector: &FieldSelector, key: &str) -> usize {
        let before = self.document.records.len();
        self.document.records.retain(|record| !record.matches(kind, selector, key));
        before - self.document.records.len()
    }

    fn save(&mut self) -> Result<(), ReconcileError> {
        self.persist().map_err(|err| ReconcileError::PersistenceFailed(format!("{err:#}")))
    }

    fn content_digest(&self) -> Option<&str> {
        Some(&self.digest)
    }
}
