//! Bulk file import: externally sort the input by portfolio, date and type,
//! submit portfolio-sized groups to the transaction service, and echo every
//! failing record into a `<base>-errors.csv` next to the input with the
//! failure message filled in. One bad record never drops the rest.

pub mod sort;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::service::{TransactionPost, TransactionService};
use sort::{CsvTransactionRecord, ExternalSorter};

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// In-memory accumulation cap per submitted group; a long portfolio is
    /// flushed mid-stream without reordering.
    pub max_batch_size: usize,
    /// Records per sorted on-disk run during the external sort.
    pub sort_run_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            sort_run_size: 50_000,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FileImportSummary {
    pub total_records: usize,
    pub submitted_batches: usize,
    pub successful: usize,
    pub failed: usize,
    pub error_file: Option<PathBuf>,
}

pub struct FilePipeline {
    service: Arc<TransactionService>,
    config: BatchConfig,
}

impl FilePipeline {
    pub fn new(service: Arc<TransactionService>, config: BatchConfig) -> Self {
        Self { service, config }
    }

    /// Runs the whole pipeline over one input file.
    pub async fn import(&self, input: &Path) -> Result<FileImportSummary> {
        let mut sorted = ExternalSorter::new(self.config.sort_run_size).sort(input)?;
        let mut errors = ErrorFileWriter::new(error_file_path(input));
        let mut summary = FileImportSummary::default();

        let mut group: Vec<CsvTransactionRecord> = Vec::new();
        let mut current_portfolio: Option<String> = None;

        for record in &mut sorted {
            let record = record?;
            summary.total_records += 1;

            let flush = match &current_portfolio {
                Some(portfolio) if *portfolio != record.portfolio_id => true,
                _ => group.len() >= self.config.max_batch_size,
            };
            if flush && !group.is_empty() {
                self.submit(&mut group, &mut errors, &mut summary).await?;
            }
            current_portfolio = Some(record.portfolio_id.clone());
            group.push(record);
        }
        if !group.is_empty() {
            self.submit(&mut group, &mut errors, &mut summary).await?;
        }

        summary.error_file = errors.finish()?;
        log::info!(
            "imported {}: {} records, {} ok, {} failed",
            input.display(),
            summary.total_records,
            summary.successful,
            summary.failed
        );
        Ok(summary)
    }

    async fn submit(
        &self,
        group: &mut Vec<CsvTransactionRecord>,
        errors: &mut ErrorFileWriter,
        summary: &mut FileImportSummary,
    ) -> Result<()> {
        let records = std::mem::take(group);
        summary.submitted_batches += 1;

        // Records whose numeric fields do not even parse fail here; the rest
        // go to the service as one batch.
        let mut posts = Vec::new();
        let mut parsed: Vec<(CsvTransactionRecord, bool)> = Vec::with_capacity(records.len());
        for record in records {
            match to_post(&record) {
                Ok(post) => {
                    posts.push(post);
                    parsed.push((record, true));
                }
                Err(message) => {
                    summary.failed += 1;
                    errors.write(&record, &message)?;
                    parsed.push((record, false));
                }
            }
        }

        let outcome = self.service.create_transactions(posts).await;
        let mut results = outcome.results.into_iter();
        for (record, submitted) in parsed {
            if !submitted {
                continue;
            }
            let result = results.next().ok_or_else(|| {
                Error::Internal("batch result count diverged from submission".to_string())
            })?;
            if result.succeeded() {
                summary.successful += 1;
            } else {
                summary.failed += 1;
                let message = result
                    .failure_message()
                    .unwrap_or_else(|| "processing failed".to_string());
                errors.write(&record, &message)?;
            }
        }
        Ok(())
    }
}

fn to_post(record: &CsvTransactionRecord) -> std::result::Result<TransactionPost, String> {
    let quantity = Decimal::from_str(record.quantity.trim())
        .map_err(|_| format!("quantity {} is not a decimal number", record.quantity))?;
    let price = match record.price.trim() {
        "" => None,
        raw => Some(
            Decimal::from_str(raw)
                .map_err(|_| format!("price {} is not a decimal number", record.price))?,
        ),
    };
    Ok(TransactionPost {
        portfolio_id: record.portfolio_id.clone(),
        security_id: if record.security_id.is_empty() {
            None
        } else {
            Some(record.security_id.clone())
        },
        source_id: record.source_id.clone(),
        transaction_type: record.transaction_type.clone(),
        quantity,
        price,
        transaction_date: record.transaction_date.clone(),
    })
}

/// `trades.csv` -> `trades-errors.csv`, in the same directory.
pub fn error_file_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "import".to_string());
    input.with_file_name(format!("{stem}-errors.csv"))
}

/// Error-file sink, created lazily so a clean import leaves no file behind.
/// Failing records are written in submission order with all input fields
/// preserved, which keeps the output byte-stable for a given input.
struct ErrorFileWriter {
    path: PathBuf,
    writer: Option<csv::Writer<std::fs::File>>,
}

impl ErrorFileWriter {
    fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    fn write(&mut self, record: &CsvTransactionRecord, message: &str) -> Result<()> {
        if self.writer.is_none() {
            let writer = csv::Writer::from_path(&self.path)
                .map_err(|e| Error::Internal(format!("csv: {e}")))?;
            self.writer = Some(writer);
        }
        let mut row = record.clone();
        row.error_message = message.to_string();
        self.writer
            .as_mut()
            .expect("error writer was just created")
            .serialize(row)
            .map_err(|e| Error::Internal(format!("csv: {e}")))
    }

    fn finish(mut self) -> Result<Option<PathBuf>> {
        match self.writer.as_mut() {
            Some(writer) => {
                writer
                    .flush()
                    .map_err(|e| Error::Internal(format!("csv: {e}")))?;
                Ok(Some(self.path))
            }
            None => Ok(None),
        }
    }
}
