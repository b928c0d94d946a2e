//! Streaming CSV row reader
//!
//! Wraps `csv_async` over a `tokio::fs::File`. Records are read as raw bytes
//! and decoded per cell, so files in either supported encoding stream with a
//! single reusable [`ByteRecord`]. Rows may be ragged; width differences are
//! reported by the quality checks, not by the reader.

use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use std::path::Path;
use std::str::FromStr;

use super::models::IngestOptions;
use crate::error::{IngestError, IngestResult};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Character encodings accepted for uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

impl TextEncoding {
    /// Decode one cell; invalid UTF-8 sequences become U+FFFD
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            other => Err(other.to_string()),
        }
    }
}

/// Parsing settings resolved from [`IngestOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSettings {
    pub delimiter: u8,
    pub encoding: TextEncoding,
}

/// Check the user-supplied parsing options
pub fn validate_options(options: &IngestOptions) -> IngestResult<ReaderSettings> {
    if !options.delimiter.is_ascii() {
        return Err(IngestError::FileValidation(format!(
            "delimiter must be a single ASCII character, got {:?}",
            options.delimiter
        )));
    }
    if matches!(options.delimiter, '\n' | '\r' | '"') {
        return Err(IngestError::FileValidation(format!(
            "delimiter {:?} is not allowed",
            options.delimiter
        )));
    }
    let encoding = options.encoding.parse::<TextEncoding>().map_err(|enc| {
        IngestError::FileValidation(format!("unsupported encoding: {enc}"))
    })?;
    if options.max_rows == Some(0) {
        return Err(IngestError::FileValidation(
            "max_rows must be greater than zero".to_string(),
        ));
    }

    Ok(ReaderSettings {
        delimiter: options.delimiter as u8,
        encoding,
    })
}

/// One data row; `index` is 0-based over data rows, header excluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub index: u64,
    pub cells: Vec<String>,
}

impl RawRow {
    /// 1-based row number used in issues
    pub fn row_number(&self) -> i64 {
        self.index as i64 + 1
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|cell| cell.trim().is_empty())
    }
}

pub struct CsvRowReader {
    reader: AsyncReader<tokio::fs::File>,
    record: ByteRecord,
    encoding: TextEncoding,
    skip_empty_lines: bool,
    max_rows: Option<u64>,
    headers: Option<Vec<String>>,
    rows_read: u64,
    at_start: bool,
}

impl CsvRowReader {
    /// Open `path` and consume the header row when `has_headers` is set
    pub async fn open(path: &Path, options: &IngestOptions) -> IngestResult<Self> {
        let settings = validate_options(options)?;
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            IngestError::StructuralAnalysis(format!("cannot open {}: {e}", path.display()))
        })?;

        let reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .delimiter(settings.delimiter)
            .flexible(true)
            .create_reader(file);

        let mut rows = Self {
            reader,
            record: ByteRecord::new(),
            encoding: settings.encoding,
            skip_empty_lines: options.skip_empty_lines,
            max_rows: options.max_rows,
            headers: None,
            rows_read: 0,
            at_start: true,
        };

        if options.has_headers {
            rows.headers = rows.next_record().await?;
        }

        Ok(rows)
    }

    /// Header names as written in the file, if a header row was read
    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    /// Next data row, or `None` at end of file or once `max_rows` is reached
    pub async fn next_row(&mut self) -> IngestResult<Option<RawRow>> {
        if self.max_rows.is_some_and(|max| self.rows_read >= max) {
            return Ok(None);
        }

        loop {
            let Some(cells) = self.next_record().await? else {
                return Ok(None);
            };
            let row = RawRow {
                index: self.rows_read,
                cells,
            };
            if self.skip_empty_lines && row.is_blank() {
                continue;
            }
            self.rows_read += 1;
            return Ok(Some(row));
        }
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    async fn next_record(&mut self) -> IngestResult<Option<Vec<String>>> {
        let has_record = self
            .reader
            .read_byte_record(&mut self.record)
            .await
            .map_err(|e| IngestError::StructuralAnalysis(format!("malformed CSV: {e}")))?;
        if !has_record {
            return Ok(None);
        }

        let mut cells: Vec<String> = Vec::with_capacity(self.record.len());
        for (i, field) in self.record.iter().enumerate() {
            let field = if i == 0 && self.at_start {
                field.strip_prefix(UTF8_BOM).unwrap_or(field)
            } else {
                field
            };
            cells.push(self.encoding.decode(field));
        }
        self.at_start = false;

        Ok(Some(cells))
    }
}
