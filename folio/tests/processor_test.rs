mod common;

use rust_decimal::Decimal;

use common::{cash_post, pid, security_post, setup, sid};
use folio::repository::{BalanceRepository, ProcessingCommit, TransactionRepository};
use folio::repository::AccountingStore;
use folio::types::TransactionStatus;

#[tokio::test]
async fn test_that_buy_then_sell_nets_position_and_cash() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);

    let outcome = ctx
        .services
        .transactions
        .create_transactions(vec![security_post(
            &portfolio, &security, "s-001", "BUY", 100, 50,
        )])
        .await;
    assert_eq!(outcome.summary.successful, 1);

    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(100));
    assert_eq!(position.quantity_short, Decimal::ZERO);
    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(-5000));

    let outcome = ctx
        .services
        .transactions
        .create_transactions(vec![security_post(
            &portfolio, &security, "s-002", "SELL", 40, 55,
        )])
        .await;
    assert_eq!(outcome.summary.successful, 1);

    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(60));
    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(-2800));

    for source in ["s-001", "s-002"] {
        let tx = ctx
            .store
            .transaction_by_source_id(source)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Proc);
    }
}

#[tokio::test]
async fn test_that_short_then_cover_flattens_the_position() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);

    ctx.services
        .transactions
        .create_transactions(vec![security_post(
            &portfolio, &security, "s-001", "SHORT", 10, 20,
        )])
        .await;
    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::ZERO);
    assert_eq!(position.quantity_short, Decimal::from(10));
    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(200));

    ctx.services
        .transactions
        .create_transactions(vec![security_post(
            &portfolio, &security, "s-002", "COVER", 10, 18,
        )])
        .await;
    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_short, Decimal::ZERO);
    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(20));
}

#[tokio::test]
async fn test_that_cash_lifecycle_touches_only_the_cash_row() {
    let ctx = setup();
    let portfolio = pid(1);

    ctx.services
        .transactions
        .create_transactions(vec![
            cash_post(&portfolio, "s-001", "DEP", 1000),
            cash_post(&portfolio, "s-002", "WD", 300),
        ])
        .await;

    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(700));
    assert_eq!(cash.quantity_short, Decimal::ZERO);
    let balances = ctx.store.balances_for_portfolio(&portfolio).await.unwrap();
    assert_eq!(balances.len(), 1);
}

#[tokio::test]
async fn test_that_transfers_move_positions_without_cash() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);

    ctx.services
        .transactions
        .create_transactions(vec![
            security_post(&portfolio, &security, "s-001", "IN", 25, 10),
            security_post(&portfolio, &security, "s-002", "OUT", 5, 10),
        ])
        .await;

    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(20));
    assert!(ctx.store.cash_balance(&portfolio).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_that_concurrent_writers_on_one_balance_both_land() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);

    let first = ctx
        .store
        .create_transaction(
            security_post(&portfolio, &security, "s-010", "BUY", 100, 50)
                .to_transaction()
                .unwrap(),
        )
        .await
        .unwrap();
    let second = ctx
        .store
        .create_transaction(
            security_post(&portfolio, &security, "s-011", "BUY", 50, 50)
                .to_transaction()
                .unwrap(),
        )
        .await
        .unwrap();

    let processor_a = ctx.services.processor.clone();
    let processor_b = ctx.services.processor.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { processor_a.process(first).await }),
        tokio::spawn(async move { processor_b.process(second).await }),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.status, TransactionStatus::Proc);
    assert_eq!(b.status, TransactionStatus::Proc);
    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(150));
    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(-7500));
}

#[tokio::test]
async fn test_that_transient_commit_failure_is_error_then_reprocessable() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);

    ctx.store.fail_commits(1);
    let outcome = ctx
        .services
        .transactions
        .create_transactions(vec![security_post(
            &portfolio, &security, "s-001", "BUY", 100, 50,
        )])
        .await;
    assert_eq!(outcome.summary.failed, 1);

    let tx = ctx
        .store
        .transaction_by_source_id("s-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Error);
    assert!(ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .is_none());

    let reprocessed = ctx.services.transactions.reprocess_failed(10).await.unwrap();
    assert_eq!(reprocessed.summary.successful, 1);

    let tx = ctx
        .store
        .transaction_by_source_id("s-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Proc);
    assert_eq!(tx.reprocessing_attempts, 1);

    // The recovered run applies the effect exactly once.
    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(100));
    let cash = ctx.store.cash_balance(&portfolio).await.unwrap().unwrap();
    assert_eq!(cash.quantity_long, Decimal::from(-5000));
}

#[tokio::test]
async fn test_that_exhausted_attempts_go_fatal() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);

    let tx = ctx
        .store
        .create_transaction(
            security_post(&portfolio, &security, "s-001", "BUY", 1, 1)
                .to_transaction()
                .unwrap(),
        )
        .await
        .unwrap();

    // Park the row in ERROR with its attempt budget spent.
    ctx.store
        .commit_processing(ProcessingCommit {
            transaction_id: tx.id.unwrap(),
            expected_transaction_version: tx.version,
            status: TransactionStatus::Error,
            error_message: Some("transient outage".to_string()),
            reprocessing_attempts: 3,
            balance_writes: Vec::new(),
        })
        .await
        .unwrap();

    let outcome = ctx.services.transactions.reprocess_failed(10).await.unwrap();
    assert_eq!(outcome.summary.failed, 1);

    let tx = ctx
        .store
        .transaction_by_source_id("s-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Fatal);
    assert!(tx
        .error_message
        .unwrap()
        .contains("MAX_RETRIES_EXCEEDED"));
}

#[tokio::test]
async fn test_that_terminal_transactions_are_left_untouched() {
    let ctx = setup();
    let portfolio = pid(1);
    let security = sid(1);

    ctx.services
        .transactions
        .create_transactions(vec![security_post(
            &portfolio, &security, "s-001", "BUY", 10, 10,
        )])
        .await;
    let processed = ctx
        .store
        .transaction_by_source_id("s-001")
        .await
        .unwrap()
        .unwrap();

    // Running a PROC transaction again must not double-apply.
    let outcome = ctx.services.processor.process(processed.clone()).await;
    assert_eq!(outcome.status, TransactionStatus::Proc);
    assert!(!outcome.succeeded());

    let position = ctx
        .store
        .balance_for(&portfolio, Some(&security))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_long, Decimal::from(10));
    let unchanged = ctx
        .store
        .transaction_by_source_id("s-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.version, processed.version);
}
