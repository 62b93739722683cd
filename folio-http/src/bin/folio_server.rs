use std::env;

use actix_web::{web, App, HttpServer};
use folio::config::AppConfig;
use folio_http::http::server::*;
use folio_http::http::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let address = env::var("FOLIO_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("FOLIO_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    let config = AppConfig::from_env()?;
    let app_state = AppState::assemble(&config).await?;
    let app_state = web::Data::new(app_state);

    log::info!("folio server listening on {address}:{port}");
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .service(health)
            .service(list_transactions)
            .service(get_transaction)
            .service(create_transactions)
            .service(transaction_stats)
            .service(reprocess_failed)
            .service(list_balances)
            .service(get_balance)
            .service(balance_stats)
            .service(portfolio_summary)
    })
    .bind((address, port))?
    .run()
    .await?;
    Ok(())
}
