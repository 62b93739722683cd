use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One line of an import file, kept as raw strings so a failing record can
/// be echoed into the error file byte for byte.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CsvTransactionRecord {
    pub portfolio_id: String,
    #[serde(default)]
    pub security_id: String,
    pub source_id: String,
    pub transaction_type: String,
    pub quantity: String,
    pub price: String,
    pub transaction_date: String,
    #[serde(default)]
    pub error_message: String,
}

impl CsvTransactionRecord {
    /// The pipeline's sort key. The compact date format sorts correctly as
    /// text.
    pub fn sort_key(&self) -> (String, String, String) {
        (
            self.portfolio_id.clone(),
            self.transaction_date.clone(),
            self.transaction_type.clone(),
        )
    }
}

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn run_path() -> PathBuf {
    let n = RUN_COUNTER.fetch_add(1, AtomicOrdering::SeqCst);
    std::env::temp_dir().join(format!("folio-sort-{}-{n}.csv", std::process::id()))
}

fn map_csv(err: csv::Error) -> Error {
    Error::Internal(format!("csv: {err}"))
}

/// Stable external sort over an import file. Files up to `run_size` records
/// sort in memory; larger inputs spill sorted runs to disk and merge them,
/// so the pipeline never needs the whole file in RAM.
pub struct ExternalSorter {
    run_size: usize,
}

impl ExternalSorter {
    pub fn new(run_size: usize) -> Self {
        Self {
            run_size: run_size.max(1),
        }
    }

    pub fn sort(&self, input: &Path) -> Result<SortedRecords> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(input)
            .map_err(map_csv)?;

        let mut run: Vec<CsvTransactionRecord> = Vec::new();
        let mut run_paths: Vec<PathBuf> = Vec::new();

        for record in reader.deserialize::<CsvTransactionRecord>() {
            run.push(record.map_err(map_csv)?);
            if run.len() >= self.run_size {
                run_paths.push(spill_run(&mut run)?);
            }
        }

        if run_paths.is_empty() {
            run.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            return Ok(SortedRecords::Memory(run.into_iter()));
        }
        if !run.is_empty() {
            run_paths.push(spill_run(&mut run)?);
        }
        Ok(SortedRecords::Merge(KWayMerge::open(run_paths)?))
    }
}

fn spill_run(run: &mut Vec<CsvTransactionRecord>) -> Result<PathBuf> {
    run.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let path = run_path();
    let mut writer = csv::Writer::from_path(&path).map_err(map_csv)?;
    for record in run.drain(..) {
        writer.serialize(record).map_err(map_csv)?;
    }
    writer.flush().map_err(|e| Error::Internal(format!("csv: {e}")))?;
    Ok(path)
}

pub enum SortedRecords {
    Memory(std::vec::IntoIter<CsvTransactionRecord>),
    Merge(KWayMerge),
}

impl Iterator for SortedRecords {
    type Item = Result<CsvTransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SortedRecords::Memory(iter) => iter.next().map(Ok),
            SortedRecords::Merge(merge) => merge.next(),
        }
    }
}

struct HeapEntry {
    key: (String, String, String),
    run: usize,
    record: CsvTransactionRecord,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run == other.run
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties break on run index: runs are consecutive input chunks, so
        // this keeps the merge stable.
        self.key.cmp(&other.key).then(self.run.cmp(&other.run))
    }
}

/// Merges sorted run files, yielding records in global sort order. Run
/// files are deleted when the merge is dropped.
pub struct KWayMerge {
    readers: Vec<csv::DeserializeRecordsIntoIter<File, CsvTransactionRecord>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    run_paths: Vec<PathBuf>,
}

impl KWayMerge {
    fn open(run_paths: Vec<PathBuf>) -> Result<Self> {
        let mut readers = Vec::with_capacity(run_paths.len());
        for path in &run_paths {
            let reader = csv::Reader::from_path(path).map_err(map_csv)?;
            readers.push(reader.into_deserialize::<CsvTransactionRecord>());
        }
        let mut merge = Self {
            readers,
            heap: BinaryHeap::new(),
            run_paths,
        };
        for run in 0..merge.readers.len() {
            merge.pull(run)?;
        }
        Ok(merge)
    }

    fn pull(&mut self, run: usize) -> Result<()> {
        if let Some(record) = self.readers[run].next() {
            let record = record.map_err(map_csv)?;
            self.heap.push(Reverse(HeapEntry {
                key: record.sort_key(),
                run,
                record,
            }));
        }
        Ok(())
    }
}

impl Iterator for KWayMerge {
    type Item = Result<CsvTransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(entry) = self.heap.pop()?;
        if let Err(err) = self.pull(entry.run) {
            return Some(Err(err));
        }
        Some(Ok(entry.record))
    }
}

impl Drop for KWayMerge {
    fn drop(&mut self) {
        for path in &self.run_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{CsvTransactionRecord, ExternalSorter};

    fn write_csv(rows: &[&str]) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static FILE_COUNTER: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "folio-sort-test-{}-{}.csv",
            std::process::id(),
            FILE_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "portfolio_id,security_id,source_id,transaction_type,quantity,price,transaction_date,error_message"
        )
        .unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        path
    }

    fn keys(path: &std::path::Path, run_size: usize) -> Vec<String> {
        let sorter = ExternalSorter::new(run_size);
        sorter
            .sort(path)
            .unwrap()
            .map(|r| r.unwrap())
            .map(|r: CsvTransactionRecord| {
                format!("{}/{}/{}", r.portfolio_id, r.transaction_date, r.source_id)
            })
            .collect()
    }

    #[test]
    fn test_that_records_sort_by_portfolio_then_date_then_type() {
        let path = write_csv(&[
            "P2,S1,s-3,BUY,1,10,20240201,",
            "P1,S1,s-2,BUY,1,10,20240202,",
            "P1,S1,s-1,BUY,1,10,20240101,",
        ]);
        let sorted = keys(&path, 100);
        assert_eq!(
            sorted,
            vec!["P1/20240101/s-1", "P1/20240202/s-2", "P2/20240201/s-3"]
        );
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_that_spilled_runs_merge_to_the_same_order() {
        let rows: Vec<String> = (0..25)
            .map(|i| {
                let portfolio = if i % 2 == 0 { "P1" } else { "P2" };
                format!("{portfolio},S1,s-{i:02},BUY,1,10,202401{:02},", 25 - i)
            })
            .collect();
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let path = write_csv(&row_refs);

        // A run size of four forces seven runs and a real merge.
        let merged = keys(&path, 4);
        let in_memory = keys(&path, 1000);
        assert_eq!(merged, in_memory);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_that_equal_keys_keep_input_order() {
        let path = write_csv(&[
            "P1,S1,s-1,BUY,1,10,20240101,",
            "P1,S1,s-2,BUY,2,10,20240101,",
            "P1,S1,s-3,BUY,3,10,20240101,",
        ]);
        let sorted = keys(&path, 2);
        assert_eq!(
            sorted,
            vec!["P1/20240101/s-1", "P1/20240101/s-2", "P1/20240101/s-3"]
        );
        std::fs::remove_file(path).unwrap();
    }
}
