use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use bzip2::read::MultiBzDecoder;
use quick_xml::Reader;
use quick_xml::escape::resolve_html5_entity;
use quick_xml::events::Event;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::entity_map::DEFAULT_PROGRESS_INTERVAL;

pub const JSONL_SUFFIX: &str = "-ZID-and-json-only.jsonl";

static ID_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Z\d+$").expect("id title regex"));
static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{0,31});")
        .expect("entity regex")
});

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("XML error in dump")]
    Xml(#[from] quick_xml::Error),
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("page {title} does not contain valid JSON")]
    InvalidJson {
        title: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    pub progress_interval: usize,
    /// Abort on the first page whose text is not JSON instead of skipping it.
    pub strict: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertStats {
    pub pages: usize,
    pub matched: usize,
    pub written: usize,
    pub invalid_json: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpPage {
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Text,
}

/// Pulls `<page>` elements one at a time out of a MediaWiki export.
pub struct PageReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl<R: BufRead> PageReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            reader: Reader::from_reader(input),
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    pub fn next_page(&mut self) -> Result<Option<DumpPage>, ConvertError> {
        let mut path: Vec<Vec<u8>> = Vec::new();
        let mut page: Option<DumpPage> = None;
        let mut field: Option<Field> = None;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(ref e) => {
                    let name = e.local_name().as_ref().to_vec();
                    match name.as_slice() {
                        b"page" => page = Some(DumpPage::default()),
                        b"title" if page.is_some() && path.last().is_some_and(|tag| tag == b"page") => {
                            field = Some(Field::Title);
                        }
                        b"text"
                            if page.is_some()
                                && path.last().is_some_and(|tag| tag == b"revision") =>
                        {
                            field = Some(Field::Text);
                        }
                        _ => {}
                    }
                    path.push(name);
                }
                Event::Text(e) => {
                    if let (Some(page), Some(field)) = (page.as_mut(), field) {
                        let text = e.unescape()?;
                        match field {
                            Field::Title => page.title.push_str(&text),
                            Field::Text => page.text.push_str(&text),
                        }
                    }
                }
                Event::CData(e) => {
                    if let (Some(page), Some(Field::Text)) = (page.as_mut(), field) {
                        page.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                    }
                }
                Event::End(ref e) => {
                    path.pop();
                    field = None;
                    if e.local_name().as_ref() == b"page"
                        && let Some(page) = page.take()
                    {
                        return Ok(Some(page));
                    }
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }
}

pub fn is_id_title(title: &str) -> bool {
    ID_TITLE.is_match(title)
}

/// Resolves HTML entities one at a time. Unknown names and bare `&` stay as
/// written.
pub fn unescape_entities(text: &str) -> Cow<'_, str> {
    ENTITY.replace_all(text, |caps: &Captures| {
        resolve_entity(&caps[1]).unwrap_or_else(|| {
            tracing::debug!(entity = &caps[0], "unknown entity left as written");
            caps[0].to_string()
        })
    })
}

fn resolve_entity(name: &str) -> Option<String> {
    if let Some(number) = name.strip_prefix('#') {
        let code = match number.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    resolve_html5_entity(name).map(str::to_string)
}

/// Page text after the second entity pass, parsed as JSON.
pub fn page_json(page: &DumpPage) -> Result<Value, serde_json::Error> {
    serde_json::from_str(&unescape_entities(&page.text))
}

/// Writes one compact JSON line per id-titled page.
pub fn convert_stream<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    output_path: &Path,
    options: &ConvertOptions,
) -> Result<ConvertStats, ConvertError> {
    let mut pages = PageReader::new(input);
    let mut stats = ConvertStats::default();
    let interval = options.progress_interval.max(1);
    let io_error = |source| ConvertError::Io {
        path: output_path.to_path_buf(),
        source,
    };

    while let Some(page) = pages.next_page()? {
        stats.pages += 1;
        if stats.pages % interval == 0 {
            tracing::info!(pages = stats.pages, ids = stats.matched, "dump conversion progress");
        }
        if !is_id_title(page.title.trim()) {
            continue;
        }
        stats.matched += 1;

        let value = match page_json(&page) {
            Ok(value) => value,
            Err(source) if options.strict => {
                return Err(ConvertError::InvalidJson {
                    title: page.title,
                    source,
                });
            }
            Err(error) => {
                stats.invalid_json += 1;
                tracing::error!(title = %page.title, %error, "page text is not JSON, skipping");
                continue;
            }
        };
        serde_json::to_writer(&mut output, &value)
            .map_err(|error| io_error(io::Error::other(error)))?;
        output.write_all(b"\n").map_err(io_error)?;
        stats.written += 1;
    }

    output.flush().map_err(io_error)?;
    Ok(stats)
}

pub fn is_compressed(input: &Path) -> bool {
    input.extension().is_some_and(|extension| extension == "bz2")
}

/// File name without the `.bz2` and `.xml` suffixes.
pub fn dump_stem(input: &Path) -> String {
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".bz2").unwrap_or(&name);
    let stem = name.strip_suffix(".xml").unwrap_or(name);
    if stem.is_empty() {
        "dump".to_string()
    } else {
        stem.to_string()
    }
}

pub fn output_path_for(input: &Path, output_dir: &Path) -> PathBuf {
    output_dir.join(format!("{}{JSONL_SUFFIX}", dump_stem(input)))
}

pub fn convert_file(
    input: &Path,
    output_dir: &Path,
    options: &ConvertOptions,
) -> Result<(PathBuf, ConvertStats), ConvertError> {
    tracing::info!(input = %input.display(), "converting dump");
    fs::create_dir_all(output_dir).map_err(|source| ConvertError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let file = File::open(input).map_err(|source| ConvertError::Io {
        path: input.to_path_buf(),
        source,
    })?;
    let output_path = output_path_for(input, output_dir);
    let writer = BufWriter::new(File::create(&output_path).map_err(|source| {
        ConvertError::Io {
            path: output_path.clone(),
            source,
        }
    })?);

    let stats = if is_compressed(input) {
        let decoder = MultiBzDecoder::new(file);
        convert_stream(BufReader::new(decoder), writer, &output_path, options)?
    } else {
        convert_stream(BufReader::new(file), writer, &output_path, options)?
    };
    tracing::info!(
        input = %input.display(),
        output = %output_path.display(),
        pages = stats.pages,
        ids = stats.written,
        skipped = stats.invalid_json,
        "dump converted"
    );
    Ok((output_path, stats))
}

/// Converts every `*.xml` and `*.xml.bz2` dump in `data_dir`, in name order.
/// A plain dump wins over an archive of the same name. Outside strict mode a
/// dump that fails to convert is logged and left out.
pub fn convert_all(
    data_dir: &Path,
    output_dir: &Path,
    options: &ConvertOptions,
) -> Result<Vec<PathBuf>, ConvertError> {
    let entries = fs::read_dir(data_dir).map_err(|source| ConvertError::Io {
        path: data_dir.to_path_buf(),
        source,
    })?;
    let mut inputs = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| ConvertError::Io {
                path: data_dir.to_path_buf(),
                source,
            })?
            .path();
        let name = path.file_name().map(|name| name.to_string_lossy().into_owned());
        if name.is_some_and(|name| name.ends_with(".xml") || name.ends_with(".xml.bz2")) {
            inputs.push(path);
        }
    }
    inputs.sort();
    let mut stems = HashSet::new();
    inputs.retain(|input| {
        let fresh = stems.insert(dump_stem(input));
        if !fresh {
            tracing::debug!(path = %input.display(), "archive shadowed by plain dump, skipping");
        }
        fresh
    });

    let mut outputs = Vec::new();
    for input in inputs {
        match convert_file(&input, output_dir, options) {
            Ok((output, _)) => outputs.push(output),
            Err(error) if options.strict => return Err(error),
            Err(error) => {
                tracing::error!(input = %input.display(), %error, "dump conversion failed");
            }
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use bzip2::Compression;
    use bzip2::write::BzEncoder;
    use tempfile::tempdir;

    use super::*;

    const EXPORT: &str = r#"<mediawiki xmlns="http://www.mediawiki.org/xml/export-0.11/" version="0.11">
  <siteinfo><sitename>Wikifunctions</sitename></siteinfo>
  <page>
    <title>Z801</title>
    <ns>0</ns>
    <revision>
      <id>1</id>
      <text bytes="60" xml:space="preserve">{&quot;Z1K1&quot;: &quot;Z2&quot;, &quot;Z2K1&quot;: {&quot;Z1K1&quot;: &quot;Z6&quot;, &quot;Z6K1&quot;: &quot;Z801&quot;}, &quot;note&quot;: &quot;a &amp;amp; b&quot;}</text>
    </revision>
  </page>
  <page>
    <title>Wikifunctions:Main Page</title>
    <revision><text>not json</text></revision>
  </page>
  <page>
    <title>Z802</title>
    <revision><text>{broken</text></revision>
  </page>
  <page>
    <title>Z803</title>
    <revision><text>{&quot;Z1K1&quot;: &quot;Z2&quot;}</text></revision>
  </page>
</mediawiki>"#;

    fn convert(options: &ConvertOptions) -> Result<(Vec<String>, ConvertStats), ConvertError> {
        let mut output = Vec::new();
        let stats = convert_stream(EXPORT.as_bytes(), &mut output, Path::new("out.jsonl"), options)?;
        let lines = String::from_utf8(output)
            .expect("utf8 output")
            .lines()
            .map(ToString::to_string)
            .collect();
        Ok((lines, stats))
    }

    #[test]
    fn reads_pages_with_title_and_text() {
        let mut reader = PageReader::new(EXPORT.as_bytes());
        let first = reader.next_page().expect("parse").expect("first page");
        assert_eq!(first.title, "Z801");
        assert!(first.text.starts_with(r#"{"Z1K1": "Z2""#));
        let mut count = 1;
        while reader.next_page().expect("parse").is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn keeps_only_id_pages_and_skips_bad_json() {
        let (lines, stats) = convert(&ConvertOptions::default()).expect("convert");
        assert_eq!(stats.pages, 4);
        assert_eq!(stats.matched, 3);
        assert_eq!(stats.written, 2);
        assert_eq!(stats.invalid_json, 1);

        let first: Value = serde_json::from_str(&lines[0]).expect("json line");
        assert_eq!(first["Z2K1"]["Z6K1"], "Z801");
        assert_eq!(first["note"], "a & b");
    }

    #[test]
    fn strict_mode_aborts_on_bad_json() {
        let error = convert(&ConvertOptions {
            strict: true,
            ..ConvertOptions::default()
        })
        .expect_err("strict");
        assert!(matches!(error, ConvertError::InvalidJson { ref title, .. } if title == "Z802"));
    }

    #[test]
    fn id_titles_are_z_followed_by_digits() {
        assert!(is_id_title("Z1"));
        assert!(is_id_title("Z12345"));
        assert!(!is_id_title("Z"));
        assert!(!is_id_title("Z12a"));
        assert!(!is_id_title("Talk:Z12"));
    }

    fn compressed(text: &str) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).expect("compress");
        encoder.finish().expect("finish archive")
    }

    #[test]
    fn convert_all_handles_plain_and_compressed_dumps() {
        let temp = tempdir().expect("tempdir");
        let data = temp.path().join("data");
        let output = temp.path().join("output");
        fs::create_dir_all(&data).expect("data dir");
        fs::write(data.join("wikifunctionswiki-20250301-pages-meta-current.xml"), EXPORT)
            .expect("write dump");
        fs::write(
            data.join("wikifunctionswiki-20250302-pages-meta-current.xml.bz2"),
            compressed(EXPORT),
        )
        .expect("write archive");
        fs::write(data.join("notes.txt"), "ignore me").expect("write notes");

        let outputs = convert_all(&data, &output, &ConvertOptions::default()).expect("convert all");
        assert_eq!(
            outputs,
            vec![
                output.join("wikifunctionswiki-20250301-pages-meta-current-ZID-and-json-only.jsonl"),
                output.join("wikifunctionswiki-20250302-pages-meta-current-ZID-and-json-only.jsonl"),
            ]
        );
        for path in &outputs {
            let written = fs::read_to_string(path).expect("read output");
            assert_eq!(written.lines().count(), 2, "{}", path.display());
        }
    }

    #[test]
    fn compressed_dump_converts_like_plain_one() {
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("wikifunctionswiki-20250301-pages-meta-current.xml.bz2");
        fs::write(&archive, compressed(EXPORT)).expect("write archive");

        let (output, stats) = convert_file(&archive, &temp.path().join("out"), &ConvertOptions::default())
            .expect("convert archive");
        assert_eq!(
            output.file_name().and_then(|name| name.to_str()),
            Some("wikifunctionswiki-20250301-pages-meta-current-ZID-and-json-only.jsonl")
        );
        assert_eq!((stats.pages, stats.written, stats.invalid_json), (4, 2, 1));
        let first = fs::read_to_string(&output).expect("read output");
        let first: Value = serde_json::from_str(first.lines().next().expect("line")).expect("json");
        assert_eq!(first["Z2K1"]["Z6K1"], "Z801");
    }

    #[test]
    fn plain_dump_shadows_archive_with_same_name() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("dump-20250301.xml"), EXPORT).expect("write dump");
        fs::write(temp.path().join("dump-20250301.xml.bz2"), b"not an archive").expect("write");

        let outputs = convert_all(
            temp.path(),
            &temp.path().join("out"),
            &ConvertOptions {
                strict: true,
                ..ConvertOptions::default()
            },
        )
        .expect("plain dump only");
        assert_eq!(outputs.len(), 1);
        assert_eq!(dump_stem(Path::new("a/dump-20250301.xml.bz2")), "dump-20250301");
        assert_eq!(dump_stem(Path::new("dump.json")), "dump.json");
    }

    #[test]
    fn second_entity_pass_is_lenient_per_entity() {
        assert_eq!(
            unescape_entities("caf&eacute; &amp; tea & &bogus; &#x41;&#66;&nbsp;!"),
            "café & tea & &bogus; AB\u{a0}!"
        );
        let page = DumpPage {
            title: "Z900".to_string(),
            text: r#"{"Z1K1": "Z2", "label": "caf&eacute; &amp; more & &madeup;"}"#.to_string(),
        };
        let value = page_json(&page).expect("json");
        assert_eq!(value["label"], "café & more & &madeup;");
    }

    #[test]
    fn broken_xml_is_skipped_outside_strict_mode() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("a.xml"), "<mediawiki><page><title>Z1</title></revision>")
            .expect("write");
        let outputs = convert_all(temp.path(), &temp.path().join("out"), &ConvertOptions::default())
            .expect("convert all");
        assert!(outputs.is_empty());
    }
}
