//! HTTP bindings for the accounting services: request and response
//! envelopes, the error-to-status mapping, and the handler set the server
//! binary mounts. State assembly happens once in [`AppState`] and is shared
//! through `web::Data`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use folio::cache::memory::MemoryCache;
use folio::cache::noop::NoopCache;
use folio::cache::Cache;
use folio::config::AppConfig;
use folio::error::{Error, ErrorCode, ValidationError};
use folio::external::http::{PortfolioServiceClient, SecurityServiceClient};
use folio::external::{PortfolioSource, SecuritySource, StaticSource};
use folio::repository::{parse_sort, Page, TransactionFilter, TRANSACTION_SORT_FIELDS};
use folio::service::{BalanceService, Services, TransactionService};
use folio::store::postgres::PostgresStore;
use folio::types::parse_compact_date;

pub struct AppState {
    pub transactions: Arc<TransactionService>,
    pub balances: Arc<BalanceService>,
}

impl AppState {
    pub fn from_services(services: &Services) -> Self {
        Self {
            transactions: services.transactions.clone(),
            balances: services.balances.clone(),
        }
    }

    /// Full production assembly: postgres store, in-process cache with a
    /// background sweeper, and HTTP reference-data clients where URLs are
    /// configured. Without a configured reference service every well-formed
    /// id is accepted, which is the single-node development setup.
    pub async fn assemble(config: &AppConfig) -> anyhow::Result<Self> {
        let store = Arc::new(PostgresStore::from_config(&config.store)?);
        store.init_schema().await?;

        let cache = Arc::new(MemoryCache::new(config.cache.default_ttl));
        MemoryCache::spawn_sweeper(&cache, config.cache.sweep_interval);
        let cache: Arc<dyn Cache> = cache;

        let portfolios: Arc<dyn PortfolioSource> = match &config.portfolio_service_url {
            Some(url) => Arc::new(PortfolioServiceClient::new(
                url.clone(),
                config.retry.clone(),
                config.breaker.clone(),
            )),
            None => {
                log::warn!("no portfolio service configured, accepting all portfolio ids");
                Arc::new(StaticSource::permissive())
            }
        };
        let securities: Arc<dyn SecuritySource> = match &config.security_service_url {
            Some(url) => Arc::new(SecurityServiceClient::new(
                url.clone(),
                config.retry.clone(),
                config.breaker.clone(),
            )),
            None => {
                log::warn!("no security service configured, accepting all security ids");
                Arc::new(StaticSource::permissive())
            }
        };

        let services = Services::build(
            store,
            portfolios,
            securities,
            cache,
            config.processor.clone(),
            &config.cache,
        );
        Ok(Self::from_services(&services))
    }

    /// In-process assembly over the memory store, used by tests and
    /// embedded setups.
    pub fn in_memory() -> Self {
        let services = Services::build(
            Arc::new(folio::store::memory::MemoryStore::new()),
            Arc::new(StaticSource::permissive()),
            Arc::new(StaticSource::permissive()),
            Arc::new(NoopCache),
            folio::processor::ProcessorConfig::default(),
            &folio::config::CacheConfig::default(),
        );
        Self::from_services(&services)
    }
}

#[derive(Debug)]
pub struct ApiError(Error);

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    errors: Vec<ValidationError>,
}

impl actix_web::ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match &self.0 {
            Error::Validation(_) | Error::BusinessRule(_) | Error::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::DuplicateKey(_) | Error::OptimisticLock { .. } => StatusCode::CONFLICT,
            Error::TransientIo(_) | Error::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Constraint(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.0.to_string(),
            errors: self.0.validation_errors().to_vec(),
        })
    }
}

fn invalid_query(field: &str, value: &str, message: String) -> ApiError {
    ApiError(Error::Validation(vec![ValidationError::new(
        field,
        value,
        ErrorCode::InvalidValue,
        message,
    )]))
}

#[derive(Debug, Deserialize)]
pub struct TransactionListQuery {
    pub portfolio_id: Option<String>,
    pub security_id: Option<String>,
    pub transaction_type: Option<String>,
    pub status: Option<String>,
    pub transaction_date: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sortby: Option<String>,
}

impl TransactionListQuery {
    fn to_filter(&self) -> Result<TransactionFilter, ApiError> {
        let mut filter = TransactionFilter {
            portfolio_id: self.portfolio_id.clone(),
            security_id: self.security_id.clone(),
            ..TransactionFilter::default()
        };
        if let Some(raw) = &self.transaction_type {
            filter.transaction_type = Some(raw.parse().map_err(|_| {
                invalid_query(
                    "transaction_type",
                    raw,
                    format!("{raw} is not a transaction type"),
                )
            })?);
        }
        if let Some(raw) = &self.status {
            filter.status = Some(raw.parse().map_err(|_| {
                invalid_query("status", raw, format!("{raw} is not a transaction status"))
            })?);
        }
        if let Some(raw) = &self.transaction_date {
            filter.transaction_date = Some(parse_compact_date(raw).ok_or_else(|| {
                invalid_query(
                    "transaction_date",
                    raw,
                    format!("{raw} is not a YYYYMMDD date"),
                )
            })?);
        }
        Ok(filter)
    }
}

#[derive(Debug, Deserialize)]
pub struct BalanceListQuery {
    pub portfolio_id: Option<String>,
    pub security_id: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sortby: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReprocessQuery {
    pub limit: Option<u64>,
}

fn page_from(offset: Option<u64>, limit: Option<u64>) -> Page {
    let default = Page::default();
    Page::new(offset.unwrap_or(0), limit.unwrap_or(default.limit))
}

fn sort_from(sortby: &Option<String>, whitelist: &[&str]) -> Result<Vec<String>, ApiError> {
    match sortby {
        Some(spec) => Ok(parse_sort(spec, whitelist)?),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InfoResponse {
    pub service: String,
    pub version: String,
}

pub mod server {
    use actix_web::{get, post, web};
    use folio::domain::balance::Balance;
    use folio::domain::transaction::Transaction;
    use folio::processor::BatchOutcome;
    use folio::repository::{BalanceStats, TransactionStats, BALANCE_SORT_FIELDS};
    use folio::service::{CreateOutcome, PortfolioSummary, TransactionPost};

    use super::{
        page_from, sort_from, ApiError, AppState, BalanceListQuery, InfoResponse, ListResponse,
        ReprocessQuery, TransactionListQuery, TRANSACTION_SORT_FIELDS,
    };
    use folio::repository::BalanceFilter;

    #[get("/api/v1/transactions")]
    pub async fn list_transactions(
        app: web::Data<AppState>,
        query: web::Query<TransactionListQuery>,
    ) -> Result<web::Json<ListResponse<Transaction>>, ApiError> {
        let filter = query.to_filter()?;
        let sort = sort_from(&query.sortby, TRANSACTION_SORT_FIELDS)?;
        let page = page_from(query.offset, query.limit);
        let items = app.transactions.list_transactions(&filter, &sort, page).await?;
        Ok(web::Json(ListResponse {
            items,
            offset: page.offset,
            limit: page.limit,
        }))
    }

    #[get("/api/v1/transaction/{id}")]
    pub async fn get_transaction(
        app: web::Data<AppState>,
        path: web::Path<(i64,)>,
    ) -> Result<web::Json<Transaction>, ApiError> {
        let (id,) = path.into_inner();
        Ok(web::Json(app.transactions.get_transaction(id).await?))
    }

    #[post("/api/v1/transactions")]
    pub async fn create_transactions(
        app: web::Data<AppState>,
        posts: web::Json<Vec<TransactionPost>>,
    ) -> Result<web::Json<CreateOutcome>, ApiError> {
        let outcome = app
            .transactions
            .create_transactions(posts.into_inner())
            .await;
        Ok(web::Json(outcome))
    }

    #[get("/api/v1/transactions/stats")]
    pub async fn transaction_stats(
        app: web::Data<AppState>,
    ) -> Result<web::Json<TransactionStats>, ApiError> {
        Ok(web::Json(app.transactions.transaction_stats().await?))
    }

    #[post("/api/v1/transactions/reprocess")]
    pub async fn reprocess_failed(
        app: web::Data<AppState>,
        query: web::Query<ReprocessQuery>,
    ) -> Result<web::Json<BatchOutcome>, ApiError> {
        let limit = query.limit.unwrap_or(50);
        Ok(web::Json(app.transactions.reprocess_failed(limit).await?))
    }

    #[get("/api/v1/balances")]
    pub async fn list_balances(
        app: web::Data<AppState>,
        query: web::Query<BalanceListQuery>,
    ) -> Result<web::Json<ListResponse<Balance>>, ApiError> {
        let filter = BalanceFilter {
            portfolio_id: query.portfolio_id.clone(),
            security_id: query.security_id.clone(),
        };
        let sort = sort_from(&query.sortby, BALANCE_SORT_FIELDS)?;
        let page = page_from(query.offset, query.limit);
        let items = app.balances.list_balances(&filter, &sort, page).await?;
        Ok(web::Json(ListResponse {
            items,
            offset: page.offset,
            limit: page.limit,
        }))
    }

    #[get("/api/v1/balance/{id}")]
    pub async fn get_balance(
        app: web::Data<AppState>,
        path: web::Path<(i64,)>,
    ) -> Result<web::Json<Balance>, ApiError> {
        let (id,) = path.into_inner();
        Ok(web::Json(app.balances.get_balance(id).await?))
    }

    #[get("/api/v1/balances/stats")]
    pub async fn balance_stats(
        app: web::Data<AppState>,
    ) -> Result<web::Json<BalanceStats>, ApiError> {
        Ok(web::Json(app.balances.balance_stats().await?))
    }

    #[get("/api/v1/portfolios/{portfolio_id}/summary")]
    pub async fn portfolio_summary(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<PortfolioSummary>, ApiError> {
        let (portfolio_id,) = path.into_inner();
        Ok(web::Json(
            app.balances.portfolio_summary(&portfolio_id).await?,
        ))
    }

    #[get("/health")]
    pub async fn health() -> web::Json<InfoResponse> {
        web::Json(InfoResponse {
            service: "folio".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
