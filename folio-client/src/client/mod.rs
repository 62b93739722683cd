//! Clients for the accounting service surface: an HTTP client for a remote
//! server and a local client that drives the services in process, useful in
//! tests and embedded tooling. Both present the same [`Client`] interface.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use folio::domain::balance::Balance;
use folio::domain::transaction::Transaction;
use folio::processor::BatchOutcome;
use folio::repository::{
    BalanceFilter, Page, TransactionFilter, TransactionStats,
};
use folio::service::{CreateOutcome, PortfolioSummary, Services, TransactionPost};
use folio::types::{BalanceId, TransactionId};
use folio_http::http::{InfoResponse, ListResponse};

pub trait Client {
    fn create_transactions(
        &self,
        posts: Vec<TransactionPost>,
    ) -> impl Future<Output = Result<CreateOutcome>>;
    fn get_transaction(
        &self,
        id: TransactionId,
    ) -> impl Future<Output = Result<Transaction>>;
    fn list_transactions(
        &self,
        portfolio_id: Option<String>,
        offset: Option<u64>,
    ) -> impl Future<Output = Result<ListResponse<Transaction>>>;
    fn get_balance(&self, id: BalanceId) -> impl Future<Output = Result<Balance>>;
    fn list_balances(
        &self,
        portfolio_id: Option<String>,
        offset: Option<u64>,
    ) -> impl Future<Output = Result<ListResponse<Balance>>>;
    fn portfolio_summary(
        &self,
        portfolio_id: &str,
    ) -> impl Future<Output = Result<PortfolioSummary>>;
    fn transaction_stats(&self) -> impl Future<Output = Result<TransactionStats>>;
    fn reprocess_failed(&self, limit: u64) -> impl Future<Output = Result<BatchOutcome>>;
    fn info(&self) -> impl Future<Output = Result<InfoResponse>>;
}

#[derive(Debug)]
pub struct HttpClient {
    pub path: String,
    pub client: reqwest::Client,
}

impl HttpClient {
    pub fn new(path: String) -> Self {
        Self {
            path,
            client: reqwest::Client::new(),
        }
    }

    fn query_suffix(portfolio_id: Option<String>, offset: Option<u64>) -> String {
        let mut params = Vec::new();
        if let Some(portfolio_id) = portfolio_id {
            params.push(format!("portfolio_id={portfolio_id}"));
        }
        if let Some(offset) = offset {
            params.push(format!("offset={offset}"));
        }
        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }
}

impl Client for HttpClient {
    async fn create_transactions(&self, posts: Vec<TransactionPost>) -> Result<CreateOutcome> {
        Ok(self
            .client
            .post(self.path.clone() + "/api/v1/transactions")
            .json(&posts)
            .send()
            .await?
            .json::<CreateOutcome>()
            .await?)
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/api/v1/transaction/{id}").as_str())
            .send()
            .await?
            .json::<Transaction>()
            .await?)
    }

    async fn list_transactions(
        &self,
        portfolio_id: Option<String>,
        offset: Option<u64>,
    ) -> Result<ListResponse<Transaction>> {
        let suffix = Self::query_suffix(portfolio_id, offset);
        Ok(self
            .client
            .get(self.path.clone() + format!("/api/v1/transactions{suffix}").as_str())
            .send()
            .await?
            .json::<ListResponse<Transaction>>()
            .await?)
    }

    async fn get_balance(&self, id: BalanceId) -> Result<Balance> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/api/v1/balance/{id}").as_str())
            .send()
            .await?
            .json::<Balance>()
            .await?)
    }

    async fn list_balances(
        &self,
        portfolio_id: Option<String>,
        offset: Option<u64>,
    ) -> Result<ListResponse<Balance>> {
        let suffix = Self::query_suffix(portfolio_id, offset);
        Ok(self
            .client
            .get(self.path.clone() + format!("/api/v1/balances{suffix}").as_str())
            .send()
            .await?
            .json::<ListResponse<Balance>>()
            .await?)
    }

    async fn portfolio_summary(&self, portfolio_id: &str) -> Result<PortfolioSummary> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/api/v1/portfolios/{portfolio_id}/summary").as_str())
            .send()
            .await?
            .json::<PortfolioSummary>()
            .await?)
    }

    async fn transaction_stats(&self) -> Result<TransactionStats> {
        Ok(self
            .client
            .get(self.path.clone() + "/api/v1/transactions/stats")
            .send()
            .await?
            .json::<TransactionStats>()
            .await?)
    }

    async fn reprocess_failed(&self, limit: u64) -> Result<BatchOutcome> {
        Ok(self
            .client
            .post(self.path.clone() + format!("/api/v1/transactions/reprocess?limit={limit}").as_str())
            .send()
            .await?
            .json::<BatchOutcome>()
            .await?)
    }

    async fn info(&self) -> Result<InfoResponse> {
        Ok(self
            .client
            .get(self.path.clone() + "/health")
            .send()
            .await?
            .json::<InfoResponse>()
            .await?)
    }
}

/// Drives the services without a network hop.
pub struct LocalClient {
    services: Arc<Services>,
}

impl LocalClient {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

impl Client for LocalClient {
    async fn create_transactions(&self, posts: Vec<TransactionPost>) -> Result<CreateOutcome> {
        Ok(self.services.transactions.create_transactions(posts).await)
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        Ok(self.services.transactions.get_transaction(id).await?)
    }

    async fn list_transactions(
        &self,
        portfolio_id: Option<String>,
        offset: Option<u64>,
    ) -> Result<ListResponse<Transaction>> {
        let filter = TransactionFilter {
            portfolio_id,
            ..TransactionFilter::default()
        };
        let page = Page::new(offset.unwrap_or(0), Page::default().limit);
        let items = self
            .services
            .transactions
            .list_transactions(&filter, &[], page)
            .await?;
        Ok(ListResponse {
            items,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn get_balance(&self, id: BalanceId) -> Result<Balance> {
        Ok(self.services.balances.get_balance(id).await?)
    }

    async fn list_balances(
        &self,
        portfolio_id: Option<String>,
        offset: Option<u64>,
    ) -> Result<ListResponse<Balance>> {
        let filter = BalanceFilter {
            portfolio_id,
            security_id: None,
        };
        let page = Page::new(offset.unwrap_or(0), Page::default().limit);
        let items = self
            .services
            .balances
            .list_balances(&filter, &[], page)
            .await?;
        Ok(ListResponse {
            items,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn portfolio_summary(&self, portfolio_id: &str) -> Result<PortfolioSummary> {
        Ok(self.services.balances.portfolio_summary(portfolio_id).await?)
    }

    async fn transaction_stats(&self) -> Result<TransactionStats> {
        Ok(self.services.transactions.transaction_stats().await?)
    }

    async fn reprocess_failed(&self, limit: u64) -> Result<BatchOutcome> {
        Ok(self.services.transactions.reprocess_failed(limit).await?)
    }

    async fn info(&self) -> Result<InfoResponse> {
        Ok(InfoResponse {
            service: "folio".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
