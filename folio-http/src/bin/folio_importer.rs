use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use folio::batch::FilePipeline;
use folio::cache::noop::NoopCache;
use folio::config::AppConfig;
use folio::external::http::{PortfolioServiceClient, SecurityServiceClient};
use folio::external::{PortfolioSource, SecuritySource, StaticSource};
use folio::service::Services;
use folio::store::postgres::PostgresStore;

/// Imports one CSV transaction file against the configured store:
/// `folio_importer <file.csv>`. Failing records land in `<file>-errors.csv`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(input) = args.get(1).map(PathBuf::from) else {
        anyhow::bail!("usage: folio_importer <file.csv>");
    };

    let config = AppConfig::from_env()?;
    let store = Arc::new(PostgresStore::from_config(&config.store)?);
    store.init_schema().await?;

    let portfolios: Arc<dyn PortfolioSource> = match &config.portfolio_service_url {
        Some(url) => Arc::new(PortfolioServiceClient::new(
            url.clone(),
            config.retry.clone(),
            config.breaker.clone(),
        )),
        None => Arc::new(StaticSource::permissive()),
    };
    let securities: Arc<dyn SecuritySource> = match &config.security_service_url {
        Some(url) => Arc::new(SecurityServiceClient::new(
            url.clone(),
            config.retry.clone(),
            config.breaker.clone(),
        )),
        None => Arc::new(StaticSource::permissive()),
    };

    let services = Services::build(
        store,
        portfolios,
        securities,
        Arc::new(NoopCache),
        config.processor.clone(),
        &config.cache,
    );

    let pipeline = FilePipeline::new(services.transactions.clone(), config.batch.clone());
    let summary = pipeline.import(&input).await?;

    println!(
        "{}: {} records, {} ok, {} failed",
        input.display(),
        summary.total_records,
        summary.successful,
        summary.failed
    );
    if let Some(error_file) = summary.error_file {
        println!("errors written to {}", error_file.display());
    }
    Ok(())
}
