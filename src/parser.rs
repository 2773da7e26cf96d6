//! Document parsers and the extension-keyed parser registry.
//!
//! Every parser turns one file into [`DocumentChunk`]s tagged with the
//! originating path. Paged formats emit one chunk per page, slide, or sheet;
//! the ingestion pipeline re-chunks them to the configured size afterwards.
//!
//! | Extension | Parser | Sections |
//! |-----------|--------|----------|
//! | `.txt` | [`PlainTextParser`] | whole file |
//! | `.md` | [`PlainTextParser`] | whole file |
//! | `.pdf` | [`PdfParser`] | per page when page breaks are present |
//! | `.docx` | [`DocxParser`] | whole document |
//! | `.pptx` | [`PptxParser`] | per slide |
//! | `.xlsx` | [`XlsxParser`] | per sheet |

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{KbError, KbResult};
use crate::models::{ChunkMetadata, DocumentChunk, DocumentFormat};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// A parser for one document format.
pub trait DocumentParser: Send + Sync {
    fn format(&self) -> DocumentFormat;

    /// Parse `path` into chunks. Every returned chunk carries `path` as its
    /// `source_path`.
    fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>>;
}

/// Maps lowercase file extensions to parsers.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: BTreeMap<String, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    /// An empty registry; every lookup fails with `UnsupportedFormat`.
    pub fn new() -> Self {
        Self {
            parsers: BTreeMap::new(),
        }
    }

    /// Registry with all built-in parsers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("txt", Arc::new(PlainTextParser::new(DocumentFormat::Text)));
        registry.register("md", Arc::new(PlainTextParser::new(DocumentFormat::Markdown)));
        registry.register("pdf", Arc::new(PdfParser));
        registry.register("docx", Arc::new(DocxParser));
        registry.register("pptx", Arc::new(PptxParser));
        registry.register("xlsx", Arc::new(XlsxParser));
        registry
    }

    /// Register (or replace) the parser for `extension` (without the dot).
    pub fn register(&mut self, extension: &str, parser: Arc<dyn DocumentParser>) {
        self.parsers
            .insert(extension.trim_start_matches('.').to_lowercase(), parser);
    }

    pub fn extensions(&self) -> Vec<&str> {
        self.parsers.keys().map(|k| k.as_str()).collect()
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.parser_for(path).is_ok()
    }

    pub fn parser_for(&self, path: &Path) -> KbResult<&dyn DocumentParser> {
        let extension = extension_of(path);
        self.parsers
            .get(&extension)
            .map(|p| p.as_ref())
            .ok_or_else(|| KbError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            })
    }

    /// Look up the parser for `path` and run it.
    pub fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>> {
        self.parser_for(path)?.parse(path)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn read_bytes(path: &Path) -> KbResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| KbError::io(path, e))
}

fn section(path: &Path, format: DocumentFormat, label: Option<String>, text: String) -> DocumentChunk {
    DocumentChunk {
        text,
        metadata: ChunkMetadata {
            source_path: path.to_path_buf(),
            page_or_section: label,
            format,
        },
    }
}

/// Build one chunk per non-empty section; labels are only attached when
/// there is more than one section.
fn sections_to_chunks(
    path: &Path,
    format: DocumentFormat,
    unit: &str,
    sections: Vec<String>,
) -> Vec<DocumentChunk> {
    let labelled = sections.len() > 1;
    sections
        .into_iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(i, text)| {
            let label = labelled.then(|| format!("{} {}", unit, i + 1));
            section(path, format, label, text)
        })
        .collect()
}

// ============ Plain text / Markdown ============

pub struct PlainTextParser {
    format: DocumentFormat,
}

impl PlainTextParser {
    pub fn new(format: DocumentFormat) -> Self {
        Self { format }
    }
}

impl DocumentParser for PlainTextParser {
    fn format(&self) -> DocumentFormat {
        self.format
    }

    fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>> {
        let bytes = read_bytes(path)?;
        let text = String::from_utf8(bytes).map_err(|e| KbError::parse(path, e))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![section(path, self.format, None, text)])
    }
}

// ============ PDF ============

pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>> {
        let bytes = read_bytes(path)?;
        let text =
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| KbError::parse(path, e))?;
        // Form feeds separate pages in the extracted text.
        let pages: Vec<String> = text.split('\u{000C}').map(|p| p.to_string()).collect();
        Ok(sections_to_chunks(path, DocumentFormat::Pdf, "page", pages))
    }
}

// ============ OOXML (docx / pptx / xlsx) ============

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive<'a>(path: &Path, bytes: &'a [u8]) -> KbResult<Archive<'a>> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| KbError::parse(path, e))
}

fn read_zip_entry_bounded(
    path: &Path,
    archive: &mut Archive<'_>,
    name: &str,
) -> KbResult<Option<Vec<u8>>> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(KbError::parse(path, e)),
    };
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| KbError::parse(path, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(KbError::parse(
            path,
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, MAX_XML_ENTRY_BYTES),
        ));
    }
    Ok(Some(out))
}

/// Entries matching `{prefix}N.xml`, sorted numerically by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<*:t>` element. Paragraph ends (`</*:p>`)
/// become newlines so docx paragraphs survive into the chunker.
fn collect_text_runs(path: &Path, xml: &[u8]) -> KbResult<String> {
    let mut out = String::new();
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(|e| KbError::parse(path, e))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(KbError::parse(path, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

pub struct DocxParser;

impl DocumentParser for DocxParser {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Docx
    }

    fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>> {
        let bytes = read_bytes(path)?;
        let mut archive = open_archive(path, &bytes)?;
        let xml = read_zip_entry_bounded(path, &mut archive, "word/document.xml")?
            .ok_or_else(|| KbError::parse(path, "word/document.xml not found"))?;
        let text = collect_text_runs(path, &xml)?;
        Ok(sections_to_chunks(path, DocumentFormat::Docx, "part", vec![text]))
    }
}

pub struct PptxParser;

impl DocumentParser for PptxParser {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pptx
    }

    fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>> {
        let bytes = read_bytes(path)?;
        let mut archive = open_archive(path, &bytes)?;
        let mut slides = Vec::new();
        for name in numbered_entries(&archive, "ppt/slides/slide") {
            if let Some(xml) = read_zip_entry_bounded(path, &mut archive, &name)? {
                slides.push(collect_text_runs(path, &xml)?);
            }
        }
        Ok(sections_to_chunks(path, DocumentFormat::Pptx, "slide", slides))
    }
}

pub struct XlsxParser;

impl DocumentParser for XlsxParser {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Xlsx
    }

    fn parse(&self, path: &Path) -> KbResult<Vec<DocumentChunk>> {
        let bytes = read_bytes(path)?;
        let mut archive = open_archive(path, &bytes)?;
        let shared_strings = match read_zip_entry_bounded(path, &mut archive, "xl/sharedStrings.xml")? {
            Some(xml) => read_shared_strings(path, &xml)?,
            None => Vec::new(),
        };
        let mut sheets = Vec::new();
        for name in numbered_entries(&archive, "xl/worksheets/sheet")
            .into_iter()
            .take(XLSX_MAX_SHEETS)
        {
            if let Some(xml) = read_zip_entry_bounded(path, &mut archive, &name)? {
                sheets.push(extract_sheet_cells(path, &xml, &shared_strings)?);
            }
        }
        Ok(sections_to_chunks(path, DocumentFormat::Xlsx, "sheet", sheets))
    }
}

fn read_shared_strings(path: &Path, xml: &[u8]) -> KbResult<Vec<String>> {
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(|e| KbError::parse(path, e))?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(KbError::parse(path, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one sheet, row-major, space separated. Shared-string
/// cells are resolved; numeric and inline values are taken verbatim.
fn extract_sheet_cells(path: &Path, xml: &[u8], shared_strings: &[String]) -> KbResult<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| KbError::parse(path, e))?;
                let value = raw.trim();
                if cell_is_shared_str {
                    if let Some(s) = value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i))
                    {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_is_shared_str = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(KbError::parse(path, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn zip_with(entries: &[(&str, String)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let registry = ParserRegistry::with_defaults();
        let err = registry.parse(Path::new("/tmp/archive.tar")).unwrap_err();
        assert!(matches!(err, KbError::UnsupportedFormat { ref extension, .. } if extension == "tar"));
    }

    #[test]
    fn extension_lookup_is_case_insensitive() {
        let registry = ParserRegistry::with_defaults();
        assert!(registry.supports(Path::new("NOTES.MD")));
        assert!(registry.supports(Path::new("report.Pdf")));
        assert!(!registry.supports(Path::new("no_extension")));
    }

    #[test]
    fn text_file_tagged_with_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.md");
        std::fs::write(&path, "# Notes\n\nSome content.").unwrap();
        let chunks = ParserRegistry::with_defaults().parse(&path).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.source_path, path);
        assert_eq!(chunks[0].metadata.format, DocumentFormat::Markdown);
        assert!(chunks[0].text.contains("Some content."));
    }

    #[test]
    fn invalid_utf8_text_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.txt");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0xc3]).unwrap();
        let err = ParserRegistry::with_defaults().parse(&path).unwrap_err();
        assert!(matches!(err, KbError::Parse { .. }));
    }

    #[test]
    fn invalid_pdf_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        let err = ParserRegistry::with_defaults().parse(&path).unwrap_err();
        assert!(matches!(err, KbError::Parse { .. }));
    }

    #[test]
    fn invalid_zip_is_parse_error_for_docx() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.docx");
        std::fs::write(&path, b"not a zip").unwrap();
        let err = ParserRegistry::with_defaults().parse(&path).unwrap_err();
        assert!(matches!(err, KbError::Parse { .. }));
    }

    #[test]
    fn docx_paragraphs_extracted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("memo.docx");
        let xml = "<?xml version=\"1.0\"?><w:document xmlns:w=\"w\"><w:body>\
            <w:p><w:r><w:t>First line.</w:t></w:r></w:p>\
            <w:p><w:r><w:t>Second line.</w:t></w:r></w:p>\
            </w:body></w:document>"
            .to_string();
        std::fs::write(&path, zip_with(&[("word/document.xml", xml)])).unwrap();
        let chunks = ParserRegistry::with_defaults().parse(&path).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "First line.\nSecond line.");
        assert_eq!(chunks[0].metadata.format, DocumentFormat::Docx);
    }

    #[test]
    fn pptx_emits_one_chunk_per_slide_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deck.pptx");
        let slide = |t: &str| format!("<p:sld xmlns:a=\"a\" xmlns:p=\"p\"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>", t);
        std::fs::write(
            &path,
            zip_with(&[
                ("ppt/slides/slide10.xml", slide("ten")),
                ("ppt/slides/slide2.xml", slide("two")),
                ("ppt/slides/slide1.xml", slide("one")),
            ]),
        )
        .unwrap();
        let chunks = ParserRegistry::with_defaults().parse(&path).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "ten"]);
        assert_eq!(chunks[2].metadata.page_or_section.as_deref(), Some("slide 3"));
    }

    #[test]
    fn xlsx_resolves_shared_strings_and_numbers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("book.xlsx");
        let shared = "<sst><si><t>Revenue</t></si><si><t>Paris</t></si></sst>".to_string();
        let sheet = "<worksheet><sheetData><row>\
            <c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\"><v>42</v></c><c r=\"C1\" t=\"s\"><v>1</v></c>\
            </row></sheetData></worksheet>"
            .to_string();
        std::fs::write(
            &path,
            zip_with(&[
                ("xl/sharedStrings.xml", shared),
                ("xl/worksheets/sheet1.xml", sheet),
            ]),
        )
        .unwrap();
        let chunks = ParserRegistry::with_defaults().parse(&path).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Revenue 42 Paris");
    }
}
