//! Incremental stream decoders turning raw import payloads into raw records.
//!
//! Both decoders pull from an `AsyncRead` and never buffer more than one line
//! (NDJSON) or one row (tabular) beyond the reader's own buffer, so the caller
//! controls backpressure simply by not polling while it is busy.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use jobfeed_core::RawRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub const CRATE_NAME: &str = "jobfeed-decode";

pub const DEFAULT_MAX_LINE_BYTES: usize = 1 << 20;

const EXCERPT_CHARS: usize = 120;
const BYTE_ORDER_MARK: char = '\u{feff}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Ndjson,
    Csv,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Ndjson => "ndjson",
            PayloadFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadFormat::Ndjson => "application/x-ndjson",
            PayloadFormat::Csv => "text/csv",
        }
    }

    /// Resolves a `Content-Type` header value, ignoring parameters such as `charset`.
    pub fn from_content_type(content_type: &str) -> Result<Self, FormatError> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/x-ndjson" | "application/ndjson" | "application/jsonl"
            | "application/x-jsonlines" => Ok(PayloadFormat::Ndjson),
            "text/csv" | "application/csv" => Ok(PayloadFormat::Csv),
            _ => Err(FormatError::UnsupportedContentType(content_type.to_string())),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, FormatError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "ndjson" | "jsonl" => Ok(PayloadFormat::Ndjson),
            "csv" => Ok(PayloadFormat::Csv),
            _ => Err(FormatError::UnknownExtension(path.display().to_string())),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ndjson" | "jsonl" => Ok(PayloadFormat::Ndjson),
            "csv" => Ok(PayloadFormat::Csv),
            other => Err(FormatError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unsupported content type `{0}`; expected application/x-ndjson or text/csv")]
    UnsupportedContentType(String),
    #[error("cannot infer payload format from file name `{0}`")]
    UnknownExtension(String),
    #[error("unknown payload format `{0}`; expected ndjson or csv")]
    UnknownFormat(String),
}

/// Failure of the underlying byte source. Unlike a malformed record, this ends the stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reading input stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("reading tabular input: {0}")]
    Csv(csv_async::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Record {
        position: u64,
        record: RawRecord,
    },
    /// One unusable line or row; decoding continues after it.
    Malformed {
        position: u64,
        reason: String,
        excerpt: String,
    },
}

impl DecodeEvent {
    pub fn position(&self) -> u64 {
        match self {
            DecodeEvent::Record { position, .. } | DecodeEvent::Malformed { position, .. } => {
                *position
            }
        }
    }
}

/// Format-dispatching decoder handed to the import coordinator.
pub enum RecordDecoder<R> {
    Ndjson(NdjsonDecoder<R>),
    Csv(CsvDecoder<R>),
}

impl<R> RecordDecoder<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(format: PayloadFormat, reader: R) -> Self {
        Self::with_max_line_bytes(format, reader, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(format: PayloadFormat, reader: R, max_line_bytes: usize) -> Self {
        match format {
            PayloadFormat::Ndjson => {
                RecordDecoder::Ndjson(NdjsonDecoder::new(reader).with_max_line_bytes(max_line_bytes))
            }
            PayloadFormat::Csv => RecordDecoder::Csv(CsvDecoder::new(reader)),
        }
    }

    pub fn format(&self) -> PayloadFormat {
        match self {
            RecordDecoder::Ndjson(_) => PayloadFormat::Ndjson,
            RecordDecoder::Csv(_) => PayloadFormat::Csv,
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<DecodeEvent>, DecodeError> {
        match self {
            RecordDecoder::Ndjson(decoder) => decoder.next_event().await,
            RecordDecoder::Csv(decoder) => decoder.next_event().await,
        }
    }
}

struct Line {
    bytes: Vec<u8>,
    overflowed: bool,
}

/// Newline-delimited JSON: one object per line, CRLF, CR and LF all end a line.
pub struct NdjsonDecoder<R> {
    reader: BufReader<R>,
    line_no: u64,
    max_line_bytes: usize,
    pending_cr: bool,
}

impl<R> NdjsonDecoder<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::from_buf_reader(BufReader::new(reader))
    }

    fn from_buf_reader(reader: BufReader<R>) -> Self {
        Self {
            reader,
            line_no: 0,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            pending_cr: false,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    pub async fn next_event(&mut self) -> Result<Option<DecodeEvent>, DecodeError> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            self.line_no += 1;

            if line.overflowed {
                return Ok(Some(DecodeEvent::Malformed {
                    position: self.line_no,
                    reason: format!("line exceeds {} bytes", self.max_line_bytes),
                    excerpt: excerpt(&line.bytes),
                }));
            }
            // Blank lines advance the position but are not records.
            if line.bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(parse_ndjson_line(self.line_no, &line.bytes)));
        }
    }

    async fn next_line(&mut self) -> Result<Option<Line>, DecodeError> {
        let mut bytes = Vec::new();
        let mut overflowed = false;

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                self.pending_cr = false;
                if bytes.is_empty() && !overflowed {
                    return Ok(None);
                }
                return Ok(Some(Line { bytes, overflowed }));
            }

            // The LF of a CRLF pair may arrive in the next chunk.
            if std::mem::take(&mut self.pending_cr) && available[0] == b'\n' {
                self.reader.consume(1);
                continue;
            }

            let (taken, terminator) = match available.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(idx) => (idx, Some(available[idx])),
                None => (available.len(), None),
            };

            if !overflowed {
                if bytes.len() + taken > self.max_line_bytes {
                    overflowed = true;
                    let room = (EXCERPT_CHARS * 4).saturating_sub(bytes.len());
                    bytes.extend_from_slice(&available[..taken.min(room)]);
                } else {
                    bytes.extend_from_slice(&available[..taken]);
                }
            }

            match terminator {
                Some(byte) => {
                    self.reader.consume(taken + 1);
                    self.pending_cr = byte == b'\r';
                    return Ok(Some(Line { bytes, overflowed }));
                }
                None => self.reader.consume(taken),
            }
        }
    }
}

fn parse_ndjson_line(position: u64, bytes: &[u8]) -> DecodeEvent {
    match serde_json::from_slice::<JsonValue>(bytes) {
        Ok(JsonValue::Object(record)) => DecodeEvent::Record { position, record },
        Ok(other) => DecodeEvent::Malformed {
            position,
            reason: format!("expected a JSON object, found {}", json_type_name(&other)),
            excerpt: excerpt(bytes),
        },
        Err(err) => DecodeEvent::Malformed {
            position,
            reason: format!("malformed JSON: {err}"),
            excerpt: excerpt(bytes),
        },
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn excerpt(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim()
        .chars()
        .take(EXCERPT_CHARS)
        .collect()
}

/// Tabular text: the first non-blank row names the fields of every later row.
///
/// Header names are decoded leniently; a data row that is not valid UTF-8 is
/// reported as malformed.
pub struct CsvDecoder<R> {
    reader: AsyncReader<R>,
    header: Option<Vec<String>>,
    row: ByteRecord,
}

impl<R> CsvDecoder<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        let reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .create_reader(reader);
        Self {
            reader,
            header: None,
            row: ByteRecord::new(),
        }
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    pub async fn next_event(&mut self) -> Result<Option<DecodeEvent>, DecodeError> {
        loop {
            match self.reader.read_byte_record(&mut self.row).await {
                Ok(false) => return Ok(None),
                Ok(true) => {}
                Err(err) if matches!(err.kind(), csv_async::ErrorKind::Io(_)) => {
                    return Err(DecodeError::Csv(err));
                }
                Err(err) => {
                    let position = err.position().map(|p| p.line()).unwrap_or_default();
                    return Ok(Some(DecodeEvent::Malformed {
                        position,
                        reason: format!("malformed row: {err}"),
                        excerpt: row_excerpt(&self.row),
                    }));
                }
            }

            let position = self.row.position().map(|p| p.line()).unwrap_or_default();

            if self.header.is_none() {
                let names: Vec<String> = self
                    .row
                    .iter()
                    .map(|cell| clean_cell(&String::from_utf8_lossy(cell)).unwrap_or_default())
                    .collect();
                if names.iter().any(|name| !name.is_empty()) {
                    self.header = Some(names);
                }
                continue;
            }

            let cells: Vec<Option<String>> = match self
                .row
                .iter()
                .map(std::str::from_utf8)
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(cells) => cells.into_iter().map(clean_cell).collect(),
                Err(err) => {
                    return Ok(Some(DecodeEvent::Malformed {
                        position,
                        reason: format!("malformed row: {err}"),
                        excerpt: row_excerpt(&self.row),
                    }));
                }
            };
            if cells.iter().all(Option::is_none) {
                continue;
            }
            let Some(header) = &self.header else {
                continue;
            };

            // Missing trailing cells become null; cells past the header are dropped.
            let mut record = RawRecord::new();
            for (idx, name) in header.iter().enumerate() {
                if name.is_empty() {
                    continue;
                }
                let value = cells
                    .get(idx)
                    .cloned()
                    .flatten()
                    .map(JsonValue::String)
                    .unwrap_or(JsonValue::Null);
                record.insert(name.clone(), value);
            }
            return Ok(Some(DecodeEvent::Record { position, record }));
        }
    }
}

fn row_excerpt(row: &ByteRecord) -> String {
    excerpt(&row.iter().collect::<Vec<_>>().join(&b','))
}

/// Trims a cell and maps empty text to "no value".
fn clean_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start_matches(BYTE_ORDER_MARK).trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn collect<R: AsyncRead + Unpin + Send>(mut decoder: RecordDecoder<R>) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event().await.expect("decode") {
            events.push(event);
        }
        events
    }

    fn record(event: &DecodeEvent) -> &RawRecord {
        match event {
            DecodeEvent::Record { record, .. } => record,
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ndjson_splits_on_every_line_ending_and_skips_blank_lines() {
        let input = b"{\"a\":1}\r\n\n{\"a\":2}\r{\"a\":3}\n   \n{\"a\":4}";
        let events = collect(RecordDecoder::new(PayloadFormat::Ndjson, &input[..])).await;

        let positions: Vec<_> = events.iter().map(DecodeEvent::position).collect();
        assert_eq!(positions, vec![1, 3, 4, 6]);
        assert_eq!(record(&events[3])["a"], json!(4));
    }

    #[tokio::test]
    async fn ndjson_crlf_split_across_buffer_boundary_is_one_line_ending() {
        let input = b"{\"k\":1}\r\n{\"k\":2}\r\n";
        let mut decoder =
            NdjsonDecoder::from_buf_reader(BufReader::with_capacity(8, &input[..]));
        let mut positions = Vec::new();
        while let Some(event) = decoder.next_event().await.unwrap() {
            positions.push(event.position());
        }
        assert_eq!(positions, vec![1, 2]);
    }

    #[tokio::test]
    async fn ndjson_bad_line_is_reported_and_decoding_continues() {
        let input = b"{\"a\":1}\n{\"a\":\n[1,2]\n{\"a\":4}\n";
        let events = collect(RecordDecoder::new(PayloadFormat::Ndjson, &input[..])).await;
        assert_eq!(events.len(), 4);

        match &events[1] {
            DecodeEvent::Malformed {
                position,
                reason,
                excerpt,
            } => {
                assert_eq!(*position, 2);
                assert!(reason.starts_with("malformed JSON"));
                assert_eq!(excerpt, "{\"a\":");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[2] {
            DecodeEvent::Malformed { reason, .. } => {
                assert_eq!(reason, "expected a JSON object, found array")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(record(&events[3])["a"], json!(4));
    }

    #[tokio::test]
    async fn ndjson_oversized_line_is_discarded_not_buffered() {
        let long = format!("{{\"blob\":\"{}\"}}", "x".repeat(4096));
        let input = format!("{long}\n{{\"a\":1}}\n");
        let decoder = RecordDecoder::with_max_line_bytes(PayloadFormat::Ndjson, input.as_bytes(), 256);
        let events = collect(decoder).await;

        match &events[0] {
            DecodeEvent::Malformed { reason, excerpt, .. } => {
                assert_eq!(reason, "line exceeds 256 bytes");
                assert_eq!(excerpt.chars().count(), EXCERPT_CHARS);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[1].position(), 2);
    }

    #[tokio::test]
    async fn csv_strips_bom_trims_cells_and_pads_ragged_rows() {
        let input = "\u{feff}company_slug, internal_job_id ,title\n\
                     acme , 1 ,  Engineer \n\
                     acme,2\n\
                     acme,3,Designer,extra\n\
                     , ,\n\
                     globex,4,\n";
        let events = collect(RecordDecoder::new(PayloadFormat::Csv, input.as_bytes())).await;
        assert_eq!(events.len(), 4);

        let first = record(&events[0]);
        assert_eq!(first["company_slug"], json!("acme"));
        assert_eq!(first["internal_job_id"], json!("1"));
        assert_eq!(first["title"], json!("Engineer"));

        assert_eq!(record(&events[1])["title"], JsonValue::Null);
        assert_eq!(record(&events[2]).len(), 3);
        assert_eq!(record(&events[3])["title"], JsonValue::Null);
        assert_eq!(events[3].position(), 6);
    }

    #[tokio::test]
    async fn csv_header_is_first_non_blank_row() {
        let input = "\n,,\nslug,id\nacme,1\n";
        let mut decoder = CsvDecoder::new(input.as_bytes());
        let event = decoder.next_event().await.unwrap().expect("one row");
        assert_eq!(decoder.header().unwrap(), ["slug", "id"]);
        assert_eq!(record(&event)["slug"], json!("acme"));
        assert!(decoder.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn csv_header_with_invalid_utf8_still_names_the_fields() {
        let input = b"company_slug,internal_job_id,ti\xFFtle\nacme,1,a\nacme,2,b\n";
        let mut decoder = CsvDecoder::new(&input[..]);

        let first = decoder.next_event().await.unwrap().expect("first row");
        assert_eq!(first.position(), 2);
        assert_eq!(record(&first)["internal_job_id"], json!("1"));
        assert_eq!(record(&first)["ti\u{FFFD}tle"], json!("a"));
        assert_eq!(decoder.next_event().await.unwrap().unwrap().position(), 3);
        assert!(decoder.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn csv_row_with_invalid_utf8_is_malformed_with_excerpt() {
        let input = b"company_slug,internal_job_id,title\nacme,1,Eng\xFFineer\nacme,2,Analyst\n";
        let events = collect(RecordDecoder::new(PayloadFormat::Csv, &input[..])).await;
        assert_eq!(events.len(), 2);

        match &events[0] {
            DecodeEvent::Malformed {
                position,
                reason,
                excerpt,
            } => {
                assert_eq!(*position, 2);
                assert!(reason.starts_with("malformed row"));
                assert_eq!(excerpt, "acme,1,Eng\u{FFFD}ineer");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(record(&events[1])["title"], json!("Analyst"));
    }

    #[test]
    fn content_type_negotiation() {
        assert_eq!(
            PayloadFormat::from_content_type("application/x-ndjson; charset=utf-8").unwrap(),
            PayloadFormat::Ndjson
        );
        assert_eq!(
            PayloadFormat::from_content_type("Text/CSV").unwrap(),
            PayloadFormat::Csv
        );
        assert!(matches!(
            PayloadFormat::from_content_type("application/json"),
            Err(FormatError::UnsupportedContentType(_))
        ));
        assert_eq!(
            PayloadFormat::from_path(Path::new("feeds/acme.jsonl")).unwrap(),
            PayloadFormat::Ndjson
        );
        assert!(PayloadFormat::from_path(Path::new("feed.xml")).is_err());
        assert_eq!("CSV".parse::<PayloadFormat>().unwrap(), PayloadFormat::Csv);
    }
}
