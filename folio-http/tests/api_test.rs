use actix_web::{test, web, App};
use rust_decimal::Decimal;

use folio::service::{CreateOutcome, PortfolioSummary, TransactionPost};
use folio_http::http::server::*;
use folio_http::http::{AppState, InfoResponse, ListResponse};

fn pid() -> String {
    "P".repeat(24)
}

fn sid() -> String {
    "S".repeat(24)
}

fn post(source_id: &str, transaction_type: &str, quantity: i64, price: i64) -> TransactionPost {
    TransactionPost {
        portfolio_id: pid(),
        security_id: Some(sid()),
        source_id: source_id.to_string(),
        transaction_type: transaction_type.to_string(),
        quantity: Decimal::from(quantity),
        price: Some(Decimal::from(price)),
        transaction_date: "20240130".to_string(),
    }
}

macro_rules! app {
    () => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::in_memory()))
                .service(health)
                .service(list_transactions)
                .service(get_transaction)
                .service(create_transactions)
                .service(transaction_stats)
                .service(reprocess_failed)
                .service(list_balances)
                .service(get_balance)
                .service(balance_stats)
                .service(portfolio_summary),
        )
        .await
    };
}

#[actix_web::test]
async fn test_that_health_reports_the_service() {
    let app = app!();
    let req = test::TestRequest::get().uri("/health").to_request();
    let info: InfoResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(info.service, "folio");
}

#[actix_web::test]
async fn test_that_posted_transactions_process_and_are_queryable() {
    let app = app!();

    let req = test::TestRequest::post()
        .uri("/api/v1/transactions")
        .set_json(vec![post("s-001", "BUY", 100, 50), post("s-002", "SELL", 40, 55)])
        .to_request();
    let outcome: CreateOutcome = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome.summary.successful, 2);
    let id = outcome.results[0].transaction.as_ref().unwrap().id.unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/transaction/{id}"))
        .to_request();
    let fetched: folio::domain::transaction::Transaction =
        test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched.source_id, "s-001");

    let req = test::TestRequest::get()
        .uri(&format!(
            "/api/v1/transactions?portfolio_id={}&sortby=transaction_date",
            pid()
        ))
        .to_request();
    let listed: ListResponse<folio::domain::transaction::Transaction> =
        test::call_and_read_body_json(&app, req).await;
    assert_eq!(listed.items.len(), 2);
    assert_eq!(listed.limit, 50);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/balances?portfolio_id={}", pid()))
        .to_request();
    let balances: ListResponse<folio::domain::balance::Balance> =
        test::call_and_read_body_json(&app, req).await;
    assert_eq!(balances.items.len(), 2);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/portfolios/{}/summary", pid()))
        .to_request();
    let summary: PortfolioSummary = test::call_and_read_body_json(&app, req).await;
    assert_eq!(summary.total_positions, 1);
    assert_eq!(summary.cash, Decimal::from(-2800));
}

#[actix_web::test]
async fn test_that_bad_query_values_are_rejected() {
    let app = app!();

    let req = test::TestRequest::get()
        .uri("/api/v1/transactions?transaction_type=TRANSFER")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri("/api/v1/transactions?sortby=quantity")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_that_missing_entities_are_404() {
    let app = app!();
    let req = test::TestRequest::get()
        .uri("/api/v1/transaction/999")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);

    let req = test::TestRequest::get().uri("/api/v1/balance/999").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_that_stats_and_reprocess_endpoints_answer() {
    let app = app!();

    let req = test::TestRequest::post()
        .uri("/api/v1/transactions")
        .set_json(vec![post("s-001", "BUY", 10, 10)])
        .to_request();
    let _: CreateOutcome = test::call_and_read_body_json(&app, req).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/transactions/stats")
        .to_request();
    let stats: folio::repository::TransactionStats =
        test::call_and_read_body_json(&app, req).await;
    assert_eq!(stats.total, 1);

    let req = test::TestRequest::post()
        .uri("/api/v1/transactions/reprocess?limit=5")
        .to_request();
    let outcome: folio::processor::BatchOutcome =
        test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome.summary.total_requested, 0);
}
