use std::env;

use anyhow::Result;
use folio_client::client::{Client, HttpClient};

/// Smoke check against a running server: `folio_client_smoke http://host:port`.
#[tokio::main]
async fn main() -> Result<()> {
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let client = HttpClient::new(path);

    let info = client.info().await?;
    println!("{} {}", info.service, info.version);

    let transactions = client.list_transactions(None, None).await?;
    println!("{} transactions on first page", transactions.items.len());

    let stats = client.transaction_stats().await?;
    println!("{} transactions total", stats.total);
    Ok(())
}
