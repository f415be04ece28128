//! `#@generate-series` record generation.

use grntest_core::command::quote_value;
use grntest_core::template::SeriesTemplate;
use grntest_core::{Command, CoreError};

use crate::context::ExecutionContext;
use crate::error::ExecutorError;
use crate::executor::{execute_command, Executor};

/// Upper bound for one generated `load` body.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Packs records greedily into JSON arrays of at most [`MAX_CHUNK_SIZE`]
/// bytes. A record that alone exceeds the limit gets a chunk of its own.
#[derive(Debug, Default)]
pub struct SeriesChunker {
    current: String,
    n_records: usize,
}

impl SeriesChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one serialized record. Returns a finished chunk when the record
    /// did not fit into the current one.
    pub fn push(&mut self, record: &str) -> Option<String> {
        let mut finished = None;
        if self.n_records > 0 && self.current.len() + 1 + record.len() + 1 > MAX_CHUNK_SIZE {
            finished = self.take();
        }
        if self.n_records == 0 {
            self.current.push('[');
        } else {
            self.current.push(',');
        }
        self.current.push_str(record);
        self.n_records += 1;
        finished
    }

    /// The last, partially filled chunk.
    pub fn finish(mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.n_records == 0 {
            return None;
        }
        self.current.push(']');
        self.n_records = 0;
        Some(std::mem::take(&mut self.current))
    }
}

/// Generate records `from..=to` from `template` and load them into `table`
/// in bounded chunks. Loads are not echoed; their responses are recorded.
pub async fn generate_series(
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    from: i64,
    to: i64,
    table: &str,
    template: &str,
) -> Result<Result<(), CoreError>, ExecutorError> {
    let template = match SeriesTemplate::compile(template) {
        Ok(template) => template,
        Err(e) => return Ok(Err(e)),
    };
    let mut chunker = SeriesChunker::new();
    let mut n_loads = 0usize;
    for i in from..=to {
        let record = match template.render_json(i) {
            Ok(record) => record,
            Err(e) => return Ok(Err(e)),
        };
        if let Some(chunk) = chunker.push(&record) {
            load_chunk(executor, ctx, table, &chunk).await?;
            n_loads += 1;
        }
    }
    if let Some(chunk) = chunker.finish() {
        load_chunk(executor, ctx, table, &chunk).await?;
        n_loads += 1;
    }
    tracing::debug!(table, from, to, n_loads, "generated series");
    Ok(Ok(()))
}

async fn load_chunk(
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    table: &str,
    chunk: &str,
) -> Result<(), ExecutorError> {
    let mut command = Command::parse(&format!("load --table {}\n", quote_value(table)))?;
    command.append_body_line(format!("{chunk}\n").as_bytes());
    execute_command(executor, ctx, &command, None).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks_of(records: &[String]) -> Vec<String> {
        let mut chunker = SeriesChunker::new();
        let mut chunks: Vec<String> = records.iter().filter_map(|r| chunker.push(r)).collect();
        chunks.extend(chunker.finish());
        chunks
    }

    #[test]
    fn small_series_is_one_chunk() {
        let records: Vec<String> = (1..=3).map(|i| format!("{{\"n\":{i}}}")).collect();
        assert_eq!(chunks_of(&records), vec![r#"[{"n":1},{"n":2},{"n":3}]"#]);
    }

    #[test]
    fn empty_series_has_no_chunk() {
        assert!(chunks_of(&[]).is_empty());
    }

    #[test]
    fn large_series_is_split_into_valid_bounded_arrays() {
        let template = SeriesTemplate::compile(r#"{"_key": "key#{i}", "value": #{i * 2}}"#).unwrap();
        let records: Vec<String> = (1..=100_000).map(|i| template.render_json(i).unwrap()).collect();
        let total: usize = records.iter().map(|r| r.len() + 1).sum::<usize>() + 1;
        let chunks = chunks_of(&records);

        assert_eq!(chunks.len(), total.div_ceil(MAX_CHUNK_SIZE));
        let mut n_rows = 0;
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_CHUNK_SIZE);
            let parsed: serde_json::Value = serde_json::from_str(chunk).unwrap();
            n_rows += parsed.as_array().unwrap().len();
        }
        assert_eq!(n_rows, 100_000);
    }

    #[test]
    fn oversized_record_stands_alone() {
        let big = format!("\"{}\"", "x".repeat(MAX_CHUNK_SIZE));
        let chunks = chunks_of(&["1".to_string(), big.clone(), "2".to_string()]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1], format!("[{big}]"));
    }
}
