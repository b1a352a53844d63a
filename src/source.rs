use crate::error::SourceError;
use bzip2::read::BzDecoder;
use memchr::memchr2;
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Key that wraps the records array in a search-engine response, e.g.
/// `{"took": 5, "hits": {"total": 3, "hits": [ ... ]}}`.
const HITS_KEY: &[u8] = b"\"hits\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// One JSON record per line
    Ndjson,
    /// A top-level JSON array of records
    JsonArray,
    /// A search response envelope; records live in the inner `hits.hits` array
    SearchExport,
}

impl SourceFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ndjson" | "jsonl" => Some(SourceFormat::Ndjson),
            "array" | "json-array" => Some(SourceFormat::JsonArray),
            "search-export" | "es" => Some(SourceFormat::SearchExport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// 0-based position of the record in the source
    pub offset: u64,
    pub value: Value,
}

#[derive(Default)]
struct ScanState {
    /// Open brackets of the current element, innermost last
    open: Vec<u8>,
    in_string: bool,
    escaped: bool,
}

impl ScanState {
    /// Pops up to and including the opener matching `closer`. A closer with
    /// no matching opener unwinds the whole element so that a malformed
    /// element ends at the next top-level separator.
    fn close(&mut self, closer: u8) {
        let opener = if closer == b'}' { b'{' } else { b'[' };
        match self.open.iter().rposition(|&b| b == opener) {
            Some(pos) => self.open.truncate(pos),
            None => self.open.clear(),
        }
    }
}

/// Streams records out of an export without holding more than one record in memory.
///
/// Yields `Err(SourceError::Corrupt)` for a record that cannot be parsed and keeps
/// going with the next one; `Err(SourceError::Io)` means the underlying read failed.
pub struct SourceReader {
    reader: Box<dyn BufRead + Send>,
    format: SourceFormat,
    next_offset: u64,
    positioned: bool,
    done: bool,
    scan: ScanState,
}

impl SourceReader {
    /// Opens a file, transparently decompressing `.bz2` and detecting the layout
    /// unless `format` is given.
    pub fn open(path: &Path, format: Option<SourceFormat>) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        let compressed = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bz2"));

        let mut reader: Box<dyn BufRead + Send> = if compressed {
            Box::new(BufReader::with_capacity(
                READ_BUFFER_SIZE,
                BzDecoder::new(file),
            ))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file))
        };

        let format = match format {
            Some(f) => f,
            None => detect_format(path, &mut reader)?,
        };
        info!(path = %path.display(), ?format, compressed, "Opened source");

        Ok(Self::from_reader(reader, format))
    }

    pub fn from_reader(reader: Box<dyn BufRead + Send>, format: SourceFormat) -> Self {
        Self {
            reader,
            format,
            next_offset: 0,
            positioned: false,
            done: false,
            scan: ScanState::default(),
        }
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    /// Offset of the next record to be returned
    pub fn offset(&self) -> u64 {
        self.next_offset
    }

    /// Skips records without parsing them until `offset` is reached or the
    /// source ends. Returns the number of records skipped.
    pub fn skip_to(&mut self, offset: u64) -> Result<u64, SourceError> {
        let mut skipped = 0;
        while self.next_offset < offset {
            if self.next_raw()?.is_none() {
                break;
            }
            self.next_offset += 1;
            skipped += 1;
        }
        debug!(skipped, offset = self.next_offset, "Skipped to offset");
        Ok(skipped)
    }

    fn next_raw(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.format {
            SourceFormat::Ndjson => self.next_line(),
            SourceFormat::JsonArray | SourceFormat::SearchExport => {
                if !self.positioned {
                    self.positioned = true;
                    let found = match self.format {
                        SourceFormat::SearchExport => {
                            self.skip_past(HITS_KEY)? && self.skip_past(HITS_KEY)?
                        }
                        _ => true,
                    };
                    if !found || !self.skip_to_array_start()? {
                        self.done = true;
                        return Ok(Some(Vec::new()));
                    }
                }
                self.next_element()
            }
        }
    }

    fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                self.done = true;
                return Ok(None);
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Ok(Some(line));
            }
        }
    }

    /// Consumes bytes up to and including the next occurrence of `pattern`.
    /// The pattern must not overlap with itself except on its first byte.
    fn skip_past(&mut self, pattern: &[u8]) -> io::Result<bool> {
        let mut matched = 0;
        loop {
            let (consumed, found) = {
                let chunk = self.reader.fill_buf()?;
                if chunk.is_empty() {
                    return Ok(false);
                }
                let mut found = false;
                let mut i = 0;
                while i < chunk.len() {
                    if chunk[i] == pattern[matched] {
                        matched += 1;
                    } else {
                        matched = usize::from(chunk[i] == pattern[0]);
                    }
                    i += 1;
                    if matched == pattern.len() {
                        found = true;
                        break;
                    }
                }
                (i, found)
            };
            self.reader.consume(consumed);
            if found {
                return Ok(true);
            }
        }
    }

    /// Skips whitespace and `:` and consumes the opening `[` of the records array.
    fn skip_to_array_start(&mut self) -> io::Result<bool> {
        loop {
            let (consumed, outcome) = {
                let chunk = self.reader.fill_buf()?;
                if chunk.is_empty() {
                    return Ok(false);
                }
                match chunk
                    .iter()
                    .position(|b| !b.is_ascii_whitespace() && *b != b':')
                {
                    Some(pos) => (pos + 1, Some(chunk[pos] == b'[')),
                    None => (chunk.len(), None),
                }
            };
            self.reader.consume(consumed);
            if let Some(is_array) = outcome {
                return Ok(is_array);
            }
        }
    }

    /// Returns the raw bytes of the next array element, tracking nesting and
    /// string state across buffer refills.
    fn next_element(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut element = Vec::new();
        loop {
            let (consumed, boundary) = {
                let chunk = self.reader.fill_buf()?;
                if chunk.is_empty() {
                    self.done = true;
                    if element.iter().all(u8::is_ascii_whitespace) {
                        return Ok(None);
                    }
                    // Unterminated array: hand back what we have so it is reported
                    return Ok(Some(element));
                }

                let scan = &mut self.scan;
                let mut boundary = None;
                let mut i = 0;
                while i < chunk.len() {
                    if scan.escaped {
                        scan.escaped = false;
                        i += 1;
                        continue;
                    }
                    if scan.in_string {
                        match memchr2(b'"', b'\\', &chunk[i..]) {
                            Some(pos) => {
                                i += pos;
                                if chunk[i] == b'\\' {
                                    scan.escaped = true;
                                } else {
                                    scan.in_string = false;
                                }
                                i += 1;
                            }
                            None => i = chunk.len(),
                        }
                        continue;
                    }
                    match chunk[i] {
                        b'"' => scan.in_string = true,
                        b'{' | b'[' => scan.open.push(chunk[i]),
                        b'}' | b']' if !scan.open.is_empty() => scan.close(chunk[i]),
                        b']' => {
                            boundary = Some((i, true));
                            break;
                        }
                        b',' if scan.open.is_empty() => {
                            boundary = Some((i, false));
                            break;
                        }
                        _ => {}
                    }
                    i += 1;
                }

                match boundary {
                    Some((pos, end_of_array)) => {
                        element.extend_from_slice(&chunk[..pos]);
                        (pos + 1, Some(end_of_array))
                    }
                    None => {
                        element.extend_from_slice(chunk);
                        (chunk.len(), None)
                    }
                }
            };
            self.reader.consume(consumed);

            match boundary {
                Some(end_of_array) => {
                    if end_of_array {
                        self.done = true;
                    }
                    if element.iter().all(u8::is_ascii_whitespace) {
                        if end_of_array {
                            return Ok(None);
                        }
                        // Stray comma: nothing between separators
                        continue;
                    }
                    return Ok(Some(element));
                }
                None => continue,
            }
        }
    }
}

impl Iterator for SourceReader {
    type Item = Result<SourceRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.next_raw() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.done = true;
                return Some(Err(SourceError::Io(e)));
            }
        };

        let offset = self.next_offset;
        self.next_offset += 1;

        if raw.is_empty() {
            return Some(Err(SourceError::Corrupt {
                offset,
                message: "no records array found in source".to_string(),
            }));
        }

        Some(
            serde_json::from_slice::<Value>(&raw)
                .map(|value| SourceRecord { offset, value })
                .map_err(|e| SourceError::Corrupt {
                    offset,
                    message: e.to_string(),
                }),
        )
    }
}

fn detect_format(path: &Path, reader: &mut Box<dyn BufRead + Send>) -> io::Result<SourceFormat> {
    let name = path.to_string_lossy().to_ascii_lowercase();
    let name = name.strip_suffix(".bz2").unwrap_or(&name);
    if name.ends_with(".jsonl") || name.ends_with(".ndjson") {
        return Ok(SourceFormat::Ndjson);
    }

    let head = reader.fill_buf()?;
    let first = head.iter().find(|b| !b.is_ascii_whitespace()).copied();
    Ok(match first {
        Some(b'[') => SourceFormat::JsonArray,
        Some(b'{') if memchr::memmem::find(head, HITS_KEY).is_some() => SourceFormat::SearchExport,
        _ => SourceFormat::Ndjson,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: &str, format: SourceFormat) -> SourceReader {
        SourceReader::from_reader(Box::new(Cursor::new(data.as_bytes().to_vec())), format)
    }

    /// A reader whose buffer is tiny so that scanning crosses refills.
    fn tiny_reader(data: &str, format: SourceFormat) -> SourceReader {
        SourceReader::from_reader(
            Box::new(BufReader::with_capacity(3, Cursor::new(data.as_bytes().to_vec()))),
            format,
        )
    }

    fn ids(reader: SourceReader) -> Vec<Result<String, u64>> {
        reader
            .map(|r| match r {
                Ok(rec) => Ok(rec.value["Id"].as_str().unwrap_or_default().to_string()),
                Err(SourceError::Corrupt { offset, .. }) => Err(offset),
                Err(e) => panic!("unexpected error: {e}"),
            })
            .collect()
    }

    #[test]
    fn ndjson_skips_blank_lines() {
        let data = "{\"Id\":\"a\"}\n\n{\"Id\":\"b\"}\n";
        let got = ids(reader(data, SourceFormat::Ndjson));
        assert_eq!(got, vec![Ok("a".to_string()), Ok("b".to_string())]);
    }

    #[test]
    fn ndjson_bad_line_is_reported_and_skipped() {
        let data = "{\"Id\":\"a\"}\n{\"Id\": oops}\n{\"Id\":\"c\"}\n";
        let got = ids(reader(data, SourceFormat::Ndjson));
        assert_eq!(got, vec![Ok("a".to_string()), Err(1), Ok("c".to_string())]);
    }

    #[test]
    fn array_elements_with_nested_structures() {
        let data = r#"[ {"Id":"a","Persons":[{"x":[1,2]}]}, {"Id":"b, ]{","n":{"m":"}"}} ]"#;
        let got = ids(tiny_reader(data, SourceFormat::JsonArray));
        assert_eq!(got, vec![Ok("a".to_string()), Ok("b, ]{".to_string())]);
    }

    #[test]
    fn array_handles_escaped_quotes_across_refills() {
        let data = r#"[{"Id":"a\"b\\"},{"Id":"c"}]"#;
        let got = ids(tiny_reader(data, SourceFormat::JsonArray));
        assert_eq!(got, vec![Ok("a\"b\\".to_string()), Ok("c".to_string())]);
    }

    #[test]
    fn array_corrupt_element_does_not_stop_reader() {
        let data = r#"[{"Id":"a"}, {"Id": nope}, {"Id":"c"}]"#;
        let got = ids(reader(data, SourceFormat::JsonArray));
        assert_eq!(got, vec![Ok("a".to_string()), Err(1), Ok("c".to_string())]);
    }

    #[test]
    fn mismatched_bracket_only_spoils_its_element() {
        let data = r#"[{"Id":"a"},{"Id":"b","x":[1,2},{"Id":"c"},{"Id":"d"}]"#;
        let want = vec![
            Ok("a".to_string()),
            Err(1),
            Ok("c".to_string()),
            Ok("d".to_string()),
        ];
        assert_eq!(ids(reader(data, SourceFormat::JsonArray)), want);
        assert_eq!(ids(tiny_reader(data, SourceFormat::JsonArray)), want);
    }

    #[test]
    fn stray_closer_inside_element_is_contained() {
        let data = r#"[{"Id":"a","x":1]},{"Id":"b"}]"#;
        let got = ids(reader(data, SourceFormat::JsonArray));
        assert_eq!(got, vec![Err(0), Ok("b".to_string())]);
    }

    #[test]
    fn empty_array_yields_nothing() {
        assert!(ids(reader("  [ ]  ", SourceFormat::JsonArray)).is_empty());
    }

    #[test]
    fn unterminated_array_reports_tail() {
        let data = r#"[{"Id":"a"}, {"Id":"b""#;
        let got = ids(reader(data, SourceFormat::JsonArray));
        assert_eq!(got, vec![Ok("a".to_string()), Err(1)]);
    }

    #[test]
    fn search_export_streams_inner_hits() {
        let data = r#"{"took": 3, "timed_out": false,
            "hits": {"total": {"value": 2}, "hits": [
                {"_id": "x", "_source": {"Id": "a"}},
                {"_id": "y", "_source": {"Id": "b"}}
            ]}}"#;
        let records: Vec<_> = tiny_reader(data, SourceFormat::SearchExport)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value["_id"], "x");
        assert_eq!(records[1].value["_source"]["Id"], "b");
        assert_eq!(records[1].offset, 1);
    }

    #[test]
    fn search_export_without_hits_is_corrupt() {
        let mut r = reader(r#"{"took": 3}"#, SourceFormat::SearchExport);
        assert!(matches!(r.next(), Some(Err(SourceError::Corrupt { offset: 0, .. }))));
        assert!(r.next().is_none());
    }

    #[test]
    fn skip_to_resumes_at_offset() {
        let data = r#"[{"Id":"a"},{"Id":"b"},{"Id":"c"},{"Id":"d"}]"#;
        let mut r = reader(data, SourceFormat::JsonArray);
        assert_eq!(r.skip_to(2).unwrap(), 2);
        assert_eq!(r.offset(), 2);
        let rest = ids(r);
        assert_eq!(rest, vec![Ok("c".to_string()), Ok("d".to_string())]);
    }

    #[test]
    fn skip_past_end_stops_at_eof() {
        let mut r = reader("{\"Id\":\"a\"}\n", SourceFormat::Ndjson);
        assert_eq!(r.skip_to(10).unwrap(), 1);
        assert!(r.next().is_none());
    }

    #[test]
    fn open_detects_format_and_bz2() {
        use bzip2::write::BzEncoder;
        use bzip2::Compression;
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();

        let plain = dir.path().join("export.json");
        std::fs::write(&plain, r#"{"hits":{"hits":[{"Id":"a"}]}}"#).unwrap();
        let r = SourceReader::open(&plain, None).unwrap();
        assert_eq!(r.format(), SourceFormat::SearchExport);

        let lines = dir.path().join("export.jsonl.bz2");
        let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(b"{\"Id\":\"a\"}\n{\"Id\":\"b\"}\n").unwrap();
        std::fs::write(&lines, encoder.finish().unwrap()).unwrap();
        let r = SourceReader::open(&lines, None).unwrap();
        assert_eq!(r.format(), SourceFormat::Ndjson);
        assert_eq!(r.count(), 2);
    }

    #[test]
    fn format_names() {
        assert_eq!(SourceFormat::from_name("jsonl"), Some(SourceFormat::Ndjson));
        assert_eq!(SourceFormat::from_name("ARRAY"), Some(SourceFormat::JsonArray));
        assert_eq!(
            SourceFormat::from_name("search-export"),
            Some(SourceFormat::SearchExport)
        );
        assert_eq!(SourceFormat::from_name("xml"), None);
    }
}
