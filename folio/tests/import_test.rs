mod common;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use rust_decimal::Decimal;

use common::{pid, setup, sid, TestContext};
use folio::batch::{error_file_path, BatchConfig, FilePipeline};
use folio::repository::{BalanceRepository, TransactionRepository};
use folio::types::TransactionStatus;

const HEADER: &str =
    "portfolio_id,security_id,source_id,transaction_type,quantity,price,transaction_date,error_message";

static FILE_COUNTER: AtomicU32 = AtomicU32::new(0);

fn write_input(rows: &[String]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "folio-import-test-{}-{}",
        std::process::id(),
        FILE_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("input.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "{HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    path
}

fn pipeline(ctx: &TestContext, max_batch_size: usize, sort_run_size: usize) -> FilePipeline {
    FilePipeline::new(
        ctx.services.transactions.clone(),
        BatchConfig {
            max_batch_size,
            sort_run_size,
        },
    )
}

fn row(portfolio: &str, security: &str, source: &str, typ: &str, qty: &str, price: &str, date: &str) -> String {
    format!("{portfolio},{security},{source},{typ},{qty},{price},{date},")
}

#[tokio::test]
async fn test_that_one_bad_row_lands_in_the_error_file_and_the_rest_process() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);
    let input = write_input(&[
        row(&portfolio, &security, "s-001", "BUY", "100", "50", "20240130"),
        row(&portfolio, &security, "s-002", "BUY", "10", "-1", "20240130"),
        row(&portfolio, &security, "s-003", "SELL", "40", "55", "20240130"),
    ]);

    let summary = pipeline(&ctx, 1000, 50_000).import(&input).await.unwrap();
    assert_eq!(summary.total_records, 3);
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.failed, 1);

    for source in ["s-001", "s-003"] {
        let tx = ctx
            .store
            .transaction_by_source_id(source)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Proc);
    }
    assert!(ctx
        .store
        .transaction_by_source_id("s-002")
        .await
        .unwrap()
        .is_none());

    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(60));
    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(-2800));

    let error_file = summary.error_file.unwrap();
    assert_eq!(error_file, error_file_path(&input));
    let contents = std::fs::read_to_string(&error_file).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some(HEADER));
    let error_row = lines.next().unwrap();
    assert!(error_row.starts_with(&format!("{portfolio},{security},s-002,BUY,10,-1,20240130,")));
    assert!(error_row.contains("price"));
    assert!(lines.next().is_none());
}

#[tokio::test]
async fn test_that_submission_is_grouped_and_sorted_by_portfolio_and_date() {
    let ctx = setup();
    let input = write_input(&[
        row(&pid(2), &sid(1), "s-201", "BUY", "10", "10", "20240115"),
        row(&pid(1), &sid(1), "s-102", "BUY", "10", "10", "20240120"),
        row(&pid(1), &sid(1), "s-101", "BUY", "10", "10", "20240110"),
        row(&pid(2), &sid(1), "s-202", "SELL", "5", "10", "20240116"),
    ]);

    let summary = pipeline(&ctx, 1000, 50_000).import(&input).await.unwrap();
    assert_eq!(summary.successful, 4);
    // One group per portfolio.
    assert_eq!(summary.submitted_batches, 2);

    // Within a portfolio the earlier date got the lower transaction id.
    let first = ctx
        .store
        .transaction_by_source_id("s-101")
        .await
        .unwrap()
        .unwrap();
    let second = ctx
        .store
        .transaction_by_source_id("s-102")
        .await
        .unwrap()
        .unwrap();
    assert!(first.id.unwrap() < second.id.unwrap());
}

#[tokio::test]
async fn test_that_the_batch_cap_flushes_mid_portfolio_without_reordering() {
    let ctx = setup();
    let portfolio = pid(1);
    let rows: Vec<String> = (0..5)
        .map(|n| {
            row(
                &portfolio,
                &sid(1),
                &format!("s-{n:03}"),
                "BUY",
                "1",
                "10",
                &format!("202401{:02}", n + 10),
            )
        })
        .collect();
    let input = write_input(&rows);

    let summary = pipeline(&ctx, 2, 50_000).import(&input).await.unwrap();
    assert_eq!(summary.successful, 5);
    assert_eq!(summary.submitted_batches, 3);

    let position = ctx
        .store
        .balance_for(&portfolio, Some(&sid(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(5));
}

#[tokio::test]
async fn test_that_a_tiny_sort_run_size_still_imports_correctly() {
    let ctx = setup();
    let rows: Vec<String> = (0..20)
        .rev()
        .map(|n| {
            let portfolio = if n % 2 == 0 { pid(1) } else { pid(2) };
            row(
                &portfolio,
                &sid(1),
                &format!("s-{n:03}"),
                "BUY",
                "1",
                "10",
                &format!("202401{:02}", n + 1),
            )
        })
        .collect();
    let input = write_input(&rows);

    // Forces on-disk runs and a k-way merge.
    let summary = pipeline(&ctx, 1000, 3).import(&input).await.unwrap();
    assert_eq!(summary.total_records, 20);
    assert_eq!(summary.successful, 20);
    assert_eq!(summary.submitted_batches, 2);
    assert!(summary.error_file.is_none());

    for portfolio in [pid(1), pid(2)] {
        let position = ctx
            .store
            .balance_for(&portfolio, Some(&sid(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.quantity_long, Decimal::from(10));
    }
}

#[tokio::test]
async fn test_that_error_files_are_byte_stable_across_runs() {
    let rows = vec![
        row(&pid(1), &sid(1), "s-001", "BUY", "ten", "50", "20240130"),
        row(&pid(1), &sid(1), "s-002", "BUY", "10", "-1", "20240130"),
        row(&pid(1), &sid(1), "s-003", "BUY", "10", "50", "20240130"),
    ];

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let ctx = setup();
        let input = write_input(&rows);
        let summary = pipeline(&ctx, 1000, 50_000).import(&input).await.unwrap();
        assert_eq!(summary.failed, 2);
        outputs.push(std::fs::read(summary.error_file.unwrap()).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn test_that_duplicate_source_ids_in_a_file_apply_once() {
    let ctx = setup();
    let portfolio = pid(1);
    let input = write_input(&[
        row(&portfolio, &sid(1), "s-001", "BUY", "100", "50", "20240110"),
        row(&portfolio, &sid(1), "s-001", "BUY", "100", "50", "20240120"),
    ]);

    let summary = pipeline(&ctx, 1000, 50_000).import(&input).await.unwrap();
    assert_eq!(summary.successful, 2);

    let position = ctx
        .store
        .balance_for(&portfolio, Some(&sid(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(100));
}
