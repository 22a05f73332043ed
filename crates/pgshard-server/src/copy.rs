use pgshard_core::{PartitionFunction, ProxyError, ShardId};
use pgshard_router::statement::{CopyFormat, CopyStatement};
use std::collections::BTreeMap;

/// Splits a `COPY ... FROM STDIN` stream into per-shard streams.
///
/// Without a key every target shard receives the data unchanged. With a key
/// the stream is cut into rows (a row may span several CopyData chunks), each
/// row is routed by its key field, and the CSV header goes to every shard.
pub struct CopySplitter {
    format: CopyFormat,
    delimiter: u8,
    null: String,
    key: Option<(usize, PartitionFunction)>,
    targets: Vec<ShardId>,
    header_pending: bool,
    partial: Vec<u8>,
    in_quotes: bool,
    rows: u64,
}

pub type Batches = BTreeMap<ShardId, Vec<u8>>;

impl CopySplitter {
    pub fn new(
        copy: &CopyStatement,
        key: Option<(usize, PartitionFunction)>,
        targets: Vec<ShardId>,
    ) -> Result<Self, ProxyError> {
        if key.is_some() && copy.format == CopyFormat::Binary {
            return Err(ProxyError::NotSupported(format!(
                "binary COPY into sharded table {}",
                copy.table
            )));
        }
        Ok(Self {
            format: copy.format,
            delimiter: copy.delimiter,
            null: copy.null.clone(),
            header_pending: copy.header && copy.format == CopyFormat::Csv,
            key,
            targets,
            partial: Vec::new(),
            in_quotes: false,
            rows: 0,
        })
    }

    pub fn targets(&self) -> &[ShardId] {
        &self.targets
    }

    /// Data rows routed so far; zero when the stream is passed through unparsed.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Batches, ProxyError> {
        let mut out = Batches::new();
        if self.key.is_none() {
            for shard in &self.targets {
                out.insert(*shard, data.to_vec());
            }
            return Ok(out);
        }
        let scanned = self.partial.len();
        self.partial.extend_from_slice(data);
        let buffer = std::mem::take(&mut self.partial);
        let mut start = 0;
        for (i, byte) in buffer.iter().enumerate().skip(scanned) {
            match byte {
                b'"' if self.format == CopyFormat::Csv => self.in_quotes = !self.in_quotes,
                b'\n' if !self.in_quotes => {
                    self.route_line(&buffer[start..=i], &mut out)?;
                    start = i + 1;
                }
                _ => {}
            }
        }
        self.partial = buffer[start..].to_vec();
        Ok(out)
    }

    /// Route whatever is left once the client sent CopyDone.
    pub fn finish(&mut self) -> Result<Batches, ProxyError> {
        let mut out = Batches::new();
        if self.in_quotes {
            return Err(ProxyError::Backend(pgshard_core::BackendError::new(
                "22P04",
                "unterminated CSV quoted field",
            )));
        }
        let rest = std::mem::take(&mut self.partial);
        if !rest.is_empty() {
            let mut line = rest;
            line.push(b'\n');
            self.route_line(&line, &mut out)?;
        }
        Ok(out)
    }

    fn route_line(&mut self, line: &[u8], out: &mut Batches) -> Result<(), ProxyError> {
        let content = line
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(line);
        if self.format == CopyFormat::Text && content == b"\\." {
            return Ok(());
        }
        if self.header_pending {
            self.header_pending = false;
            for shard in &self.targets {
                out.entry(*shard).or_default().extend_from_slice(line);
            }
            return Ok(());
        }
        self.rows += 1;
        let shard = self.row_shard(content)?;
        out.entry(shard).or_default().extend_from_slice(line);
        Ok(())
    }

    fn row_shard(&self, content: &[u8]) -> Result<ShardId, ProxyError> {
        let Some((index, func)) = &self.key else {
            return Err(ProxyError::Protocol("COPY rows routed without a key".into()));
        };
        let field = match self.format {
            CopyFormat::Csv => csv_field(content, self.delimiter, *index)?,
            _ => content
                .split(|b| *b == self.delimiter)
                .nth(*index)
                .map(|f| String::from_utf8_lossy(f).into_owned()),
        };
        match field {
            Some(value) if value != self.null => func.shard_text(&value).ok_or_else(|| {
                ProxyError::NotSupported(format!(
                    "cannot determine the shard of COPY row {}: key {value:?} does not fit the key column",
                    self.rows
                ))
            }),
            _ => Err(ProxyError::NotSupported(format!(
                "COPY row {} has no shard key",
                self.rows
            ))),
        }
    }
}

fn csv_field(content: &[u8], delimiter: u8, index: usize) -> Result<Option<String>, ProxyError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(content);
    match reader.records().next() {
        Some(Ok(record)) => Ok(record.get(index).map(str::to_string)),
        Some(Err(err)) => Err(ProxyError::Backend(pgshard_core::BackendError::new(
            "22P04",
            format!("malformed CSV row: {err}"),
        ))),
        None => Ok(None),
    }
}
