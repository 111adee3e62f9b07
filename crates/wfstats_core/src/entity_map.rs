use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::entity::{Entity, EntityKind, ZObject};

pub const DEFAULT_PROGRESS_INTERVAL: usize = 1000;

/// Something that can be streamed line by line more than once.
pub trait JsonlSource {
    /// Name used for logging and for locating the dump date.
    fn name(&self) -> &str;

    fn open(&self) -> io::Result<Box<dyn BufRead + '_>>;
}

#[derive(Debug, Clone)]
pub struct JsonlFile {
    path: PathBuf,
    name: String,
}

impl JsonlFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.to_string_lossy().into_owned();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JsonlSource for JsonlFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// An in-memory source, mostly useful for tests and small fixtures.
#[derive(Debug, Clone)]
pub struct JsonlText {
    pub name: String,
    pub text: String,
}

impl JsonlText {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

impl JsonlSource for JsonlText {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
        Ok(Box::new(Cursor::new(self.text.as_bytes())))
    }
}

#[derive(Debug, Clone)]
pub struct MapOptions {
    pub progress_interval: usize,
    pub min_entries: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            min_entries: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("failed to read {source_name}")]
    Io {
        source_name: String,
        #[source]
        source: io::Error,
    },
    #[error(
        "{kind} map has {found} entries, below the minimum of {minimum}; the dump looks truncated"
    )]
    InsufficientData {
        kind: EntityKind,
        found: usize,
        minimum: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapBuildStats {
    pub lines: usize,
    pub malformed_lines: usize,
    pub wrong_kind: usize,
    pub missing_id: usize,
    pub duplicates: usize,
}

/// id -> entity for one kind, read-only once built.
#[derive(Debug)]
pub struct EntityMap<E> {
    entries: HashMap<String, Arc<E>>,
    pub stats: MapBuildStats,
}

impl<E> EntityMap<E> {
    pub fn get(&self, id: &str) -> Option<&Arc<E>> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Parses one raw JSONL line. `None` means the line is blank or not JSON;
/// invalid UTF-8 is just another malformed line.
pub fn parse_line(line: &[u8]) -> Option<ZObject> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_slice::<Value>(trimmed)
        .ok()
        .map(ZObject::from_line_value)
}

/// Reads the next raw line into `buf`. Returns `false` at end of input.
pub(crate) fn next_line<R: BufRead + ?Sized>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<bool> {
    buf.clear();
    Ok(reader.read_until(b'\n', buf)? > 0)
}

/// Streams `source` once and keeps the first record of kind `E` for every id.
pub fn build_map<E: Entity>(
    source: &dyn JsonlSource,
    options: &MapOptions,
) -> Result<EntityMap<E>, MapError> {
    let kind = E::KIND;
    tracing::info!(%kind, source = source.name(), "building entity map");
    let mut reader = source.open().map_err(|error| read_error(source, error))?;

    let mut entries: HashMap<String, Arc<E>> = HashMap::new();
    let mut stats = MapBuildStats::default();
    let interval = options.progress_interval.max(1);
    let mut line = Vec::new();

    while next_line(&mut reader, &mut line).map_err(|error| read_error(source, error))? {
        stats.lines += 1;
        if stats.lines % interval == 0 {
            tracing::info!(%kind, lines = stats.lines, collected = entries.len(), "map build progress");
        }

        let Some(object) = parse_line(&line) else {
            if !line.trim_ascii().is_empty() {
                stats.malformed_lines += 1;
                tracing::warn!(line = stats.lines, source = source.name(), "skipping malformed JSON line");
            }
            continue;
        };

        let entity = E::from_object(object);
        if !entity.is_correct_kind() {
            stats.wrong_kind += 1;
            continue;
        }
        let id = match entity.id() {
            Ok(id) => id.to_string(),
            Err(error) => {
                stats.missing_id += 1;
                tracing::debug!(line = stats.lines, %error, "skipping record without id");
                continue;
            }
        };
        if entries.contains_key(&id) {
            stats.duplicates += 1;
            continue;
        }
        entries.insert(id, Arc::new(entity));
    }

    tracing::info!(%kind, entries = entries.len(), lines = stats.lines, "entity map built");
    if entries.len() < options.min_entries {
        return Err(MapError::InsufficientData {
            kind,
            found: entries.len(),
            minimum: options.min_entries,
        });
    }

    Ok(EntityMap { entries, stats })
}

pub(crate) fn read_error(source: &dyn JsonlSource, error: io::Error) -> MapError {
    MapError::Io {
        source_name: source.name().to_string(),
        source: error,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::entity::{Implementation, Tester};

    fn tester_line(id: &str) -> String {
        format!(r#"{{"Z1K1":"Z2","Z2K1":{{"Z1K1":"Z6","Z6K1":"{id}"}},"Z2K2":{{"Z1K1":"Z20","Z20K1":"Z801"}}}}"#)
    }

    fn implementation_line(id: &str) -> String {
        format!(r#"{{"Z1K1":"Z2","Z2K1":{{"Z1K1":"Z6","Z6K1":"{id}"}},"Z2K2":{{"Z1K1":"Z14","Z14K1":"Z801"}}}}"#)
    }

    fn options(min_entries: usize) -> MapOptions {
        MapOptions {
            progress_interval: 2,
            min_entries,
        }
    }

    #[test]
    fn builds_one_entry_per_distinct_id() {
        let text = [tester_line("Z1"), tester_line("Z2"), tester_line("Z3")].join("\n");
        let source = JsonlText::new("dump-20250101.jsonl", text);
        let map = build_map::<Tester>(&source, &options(1)).expect("build map");
        assert_eq!(map.len(), 3);
        assert!(map.contains("Z2"));
        assert_eq!(map.stats.lines, 3);
    }

    #[test]
    fn first_occurrence_wins_on_duplicate_ids() {
        let duplicate = r#"{"Z2K1":{"Z6K1":"Z1"},"Z2K2":{"Z1K1":"Z20","marker":"second"}}"#;
        let text = [tester_line("Z1"), duplicate.to_string(), tester_line("Z2")].join("\n");
        let source = JsonlText::new("dump.jsonl", text);
        let map = build_map::<Tester>(&source, &options(1)).expect("build map");
        assert_eq!(map.len(), 2);
        assert_eq!(map.stats.duplicates, 1);
        let first = map.get("Z1").expect("Z1 present");
        assert!(first.object().raw()["Z2K2"].get("marker").is_none());
    }

    #[test]
    fn malformed_lines_and_other_kinds_are_skipped() {
        let text = [
            tester_line("Z1"),
            "{not json".to_string(),
            String::new(),
            implementation_line("Z5"),
            r#"{"Z2K2":{"Z1K1":"Z20"}}"#.to_string(),
            tester_line("Z2"),
        ]
        .join("\n");
        let source = JsonlText::new("dump.jsonl", text);
        let map = build_map::<Tester>(&source, &options(1)).expect("build map");
        assert_eq!(map.len(), 2);
        assert_eq!(map.stats.malformed_lines, 1);
        assert_eq!(map.stats.wrong_kind, 1);
        assert_eq!(map.stats.missing_id, 1);

        let implementations =
            build_map::<Implementation>(&source, &options(1)).expect("build map");
        assert_eq!(implementations.len(), 1);
    }

    #[test]
    fn below_minimum_is_insufficient_data() {
        let source = JsonlText::new("dump.jsonl", tester_line("Z1"));
        let error = build_map::<Tester>(&source, &options(2)).expect_err("must fail");
        match error {
            MapError::InsufficientData {
                kind,
                found,
                minimum,
            } => {
                assert_eq!(kind, EntityKind::Tester);
                assert_eq!(found, 1);
                assert_eq!(minimum, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reads_from_file_source() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("dump-20250101.jsonl");
        fs::write(&path, format!("{}\n{}\n", implementation_line("Z10"), implementation_line("Z11")))
            .expect("write jsonl");
        let source = JsonlFile::new(&path);
        let map = build_map::<Implementation>(&source, &MapOptions::default()).expect("build map");
        assert_eq!(map.len(), 2);

        let missing = JsonlFile::new(temp.path().join("absent.jsonl"));
        let error = build_map::<Implementation>(&missing, &MapOptions::default())
            .expect_err("missing file");
        assert!(matches!(error, MapError::Io { .. }));
    }

    #[test]
    fn invalid_utf8_line_is_skipped_not_fatal() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("dump-20250101.jsonl");
        let mut bytes = tester_line("T1").into_bytes();
        bytes.extend_from_slice(b"\n{\"bad\":\"\xff\xfe\"}\n");
        bytes.extend_from_slice(tester_line("T2").as_bytes());
        bytes.push(b'\n');
        fs::write(&path, bytes).expect("write jsonl");

        let map = build_map::<Tester>(&JsonlFile::new(&path), &options(1)).expect("build map");
        assert_eq!(map.len(), 2);
        assert!(map.contains("T1") && map.contains("T2"));
        assert_eq!(map.stats.lines, 3);
        assert_eq!(map.stats.malformed_lines, 1);
    }
}
