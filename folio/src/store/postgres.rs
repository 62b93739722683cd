use async_trait::async_trait;
use deadpool_postgres::{Pool, Transaction as PgTransaction};
use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::config::StoreConfig;
use crate::domain::balance::Balance;
use crate::domain::transaction::Transaction;
use crate::error::{Error, Result};
use crate::repository::{
    AccountingStore, BalanceFilter, BalanceRepository, BalanceStats, BalanceWrite, Page,
    ProcessingCommit, TransactionFilter, TransactionRepository, TransactionStats,
};
use crate::types::{BalanceId, TransactionId, TransactionStatus, Version};

/// Schema for the two relations. `COALESCE(security_id, '')` in the balance
/// index makes NULL participate in equality so a portfolio gets exactly one
/// cash row.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    id BIGSERIAL PRIMARY KEY,
    portfolio_id VARCHAR(24) NOT NULL,
    security_id VARCHAR(24),
    source_id VARCHAR(50) NOT NULL,
    status VARCHAR(8) NOT NULL,
    transaction_type VARCHAR(8) NOT NULL,
    quantity NUMERIC NOT NULL,
    price NUMERIC NOT NULL,
    transaction_date DATE NOT NULL,
    reprocessing_attempts INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    error_message TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS transactions_source_id_key
    ON transactions (source_id);
CREATE INDEX IF NOT EXISTS transactions_portfolio_idx
    ON transactions (portfolio_id);
CREATE INDEX IF NOT EXISTS transactions_security_idx
    ON transactions (security_id);
CREATE INDEX IF NOT EXISTS transactions_date_idx
    ON transactions (transaction_date);
CREATE INDEX IF NOT EXISTS transactions_type_idx
    ON transactions (transaction_type);
CREATE INDEX IF NOT EXISTS transactions_status_idx
    ON transactions (status);

CREATE TABLE IF NOT EXISTS balances (
    id BIGSERIAL PRIMARY KEY,
    portfolio_id VARCHAR(24) NOT NULL,
    security_id VARCHAR(24),
    quantity_long NUMERIC NOT NULL DEFAULT 0,
    quantity_short NUMERIC NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_updated TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS balances_portfolio_security_key
    ON balances (portfolio_id, COALESCE(security_id, ''));
CREATE INDEX IF NOT EXISTS balances_portfolio_idx
    ON balances (portfolio_id);
CREATE INDEX IF NOT EXISTS balances_security_idx
    ON balances (security_id);
";

const TRANSACTION_COLUMNS: &str = "id, portfolio_id, security_id, source_id, status, \
     transaction_type, quantity, price, transaction_date, reprocessing_attempts, version, \
     error_message";

const BALANCE_COLUMNS: &str =
    "id, portfolio_id, security_id, quantity_long, quantity_short, version, created_at, \
     last_updated";

/// Durable store over postgres. Row-level optimistic locking comes from the
/// `version = $expected` predicate on every UPDATE; multi-row atomicity from
/// running the processor's commit inside one database transaction.
pub struct PostgresStore {
    pool: Pool,
}

fn map_pool_error(err: deadpool_postgres::PoolError) -> Error {
    Error::TransientIo(format!("connection pool: {err}"))
}

fn map_pg_error(err: tokio_postgres::Error) -> Error {
    if let Some(db) = err.as_db_error() {
        if db.code() == &SqlState::UNIQUE_VIOLATION {
            return Error::DuplicateKey(db.message().to_string());
        }
        if db.code() == &SqlState::QUERY_CANCELED {
            return Error::Cancelled(db.message().to_string());
        }
    }
    Error::TransientIo(err.to_string())
}

fn transaction_from_row(row: &Row) -> Result<Transaction> {
    let status: String = row.try_get("status").map_err(map_pg_error)?;
    let transaction_type: String = row.try_get("transaction_type").map_err(map_pg_error)?;
    Ok(Transaction {
        id: Some(row.try_get::<_, i64>("id").map_err(map_pg_error)?),
        portfolio_id: row.try_get("portfolio_id").map_err(map_pg_error)?,
        security_id: row.try_get("security_id").map_err(map_pg_error)?,
        source_id: row.try_get("source_id").map_err(map_pg_error)?,
        status: status
            .parse()
            .map_err(|_| Error::Internal(format!("unknown status {status} on file")))?,
        transaction_type: transaction_type.parse().map_err(|_| {
            Error::Internal(format!("unknown transaction type {transaction_type} on file"))
        })?,
        quantity: row.try_get::<_, Decimal>("quantity").map_err(map_pg_error)?,
        price: row.try_get::<_, Decimal>("price").map_err(map_pg_error)?,
        transaction_date: row
            .try_get::<_, Date>("transaction_date")
            .map_err(map_pg_error)?,
        reprocessing_attempts: row
            .try_get::<_, i32>("reprocessing_attempts")
            .map_err(map_pg_error)?,
        version: row.try_get::<_, i32>("version").map_err(map_pg_error)?,
        error_message: row.try_get("error_message").map_err(map_pg_error)?,
    })
}

fn balance_from_row(row: &Row) -> Result<Balance> {
    Ok(Balance {
        id: Some(row.try_get::<_, i64>("id").map_err(map_pg_error)?),
        portfolio_id: row.try_get("portfolio_id").map_err(map_pg_error)?,
        security_id: row.try_get("security_id").map_err(map_pg_error)?,
        quantity_long: row
            .try_get::<_, Decimal>("quantity_long")
            .map_err(map_pg_error)?,
        quantity_short: row
            .try_get::<_, Decimal>("quantity_short")
            .map_err(map_pg_error)?,
        version: row.try_get::<_, i32>("version").map_err(map_pg_error)?,
        created_at: row
            .try_get::<_, OffsetDateTime>("created_at")
            .map_err(map_pg_error)?,
        last_updated: row
            .try_get::<_, OffsetDateTime>("last_updated")
            .map_err(map_pg_error)?,
    })
}

fn normalize_security(security_id: Option<&str>) -> Option<String> {
    security_id.filter(|s| !s.is_empty()).map(str::to_string)
}

fn order_clause(sort: &[String]) -> String {
    if sort.is_empty() {
        "ORDER BY id".to_string()
    } else {
        // Fields were validated against the whitelist before they got here.
        format!("ORDER BY {}, id", sort.join(", "))
    }
}

impl PostgresStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Builds the connection pool the way the service binaries expect it.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.user(&config.user);
        pg_config.dbname(&config.dbname);
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.password(&config.password);
        pg_config.connect_timeout(config.connect_timeout);

        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr =
            deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| Error::Config(format!("could not build postgres pool: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Creates the two relations and their indexes if absent.
    pub async fn init_schema(&self) -> Result<()> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        client.batch_execute(SCHEMA).await.map_err(map_pg_error)
    }

    async fn apply_balance_write<'a>(
        db: &PgTransaction<'a>,
        write: &BalanceWrite,
    ) -> Result<()> {
        match write.expected_version {
            Some(expected) => {
                let id = write
                    .id
                    .ok_or_else(|| Error::Internal("balance update without an id".to_string()))?;
                let updated = db
                    .execute(
                        "UPDATE balances SET quantity_long = $1, quantity_short = $2, \
                         version = version + 1, last_updated = now() \
                         WHERE id = $3 AND version = $4",
                        &[&write.quantity_long, &write.quantity_short, &id, &expected],
                    )
                    .await
                    .map_err(map_pg_error)?;
                if updated == 0 {
                    return Err(Error::OptimisticLock {
                        entity: "balance",
                        id,
                    });
                }
            }
            None => {
                // Plain insert: a concurrent writer creating the same row
                // surfaces as DuplicateKey and the caller re-reads.
                db.execute(
                    "INSERT INTO balances \
                     (portfolio_id, security_id, quantity_long, quantity_short) \
                     VALUES ($1, $2, $3, $4)",
                    &[
                        &write.portfolio_id,
                        &normalize_security(write.security_id.as_deref()),
                        &write.quantity_long,
                        &write.quantity_short,
                    ],
                )
                .await
                .map_err(map_pg_error)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for PostgresStore {
    async fn create_transaction(&self, transaction: Transaction) -> Result<Transaction> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_one(
                format!(
                    "INSERT INTO transactions (portfolio_id, security_id, source_id, status, \
                     transaction_type, quantity, price, transaction_date, \
                     reprocessing_attempts, version, error_message) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                     RETURNING {TRANSACTION_COLUMNS}"
                ).as_str(),
                &[
                    &transaction.portfolio_id,
                    &normalize_security(transaction.security_id.as_deref()),
                    &transaction.source_id,
                    &transaction.status.to_string(),
                    &transaction.transaction_type.to_string(),
                    &transaction.quantity,
                    &transaction.price,
                    &transaction.transaction_date,
                    &transaction.reprocessing_attempts,
                    &transaction.version,
                    &transaction.error_message,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        transaction_from_row(&row)
    }

    async fn transaction_by_id(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_opt(
                format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1").as_str(),
                &[&id],
            )
            .await
            .map_err(map_pg_error)?;
        row.map(|r| transaction_from_row(&r)).transpose()
    }

    async fn transaction_by_source_id(&self, source_id: &str) -> Result<Option<Transaction>> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_opt(
                format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE source_id = $1").as_str(),
                &[&source_id],
            )
            .await
            .map_err(map_pg_error)?;
        row.map(|r| transaction_from_row(&r)).transpose()
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<Transaction>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

        if let Some(portfolio_id) = &filter.portfolio_id {
            params.push(Box::new(portfolio_id.clone()));
            clauses.push(format!("portfolio_id = ${}", params.len()));
        }
        if let Some(portfolio_ids) = &filter.portfolio_ids {
            params.push(Box::new(portfolio_ids.clone()));
            clauses.push(format!("portfolio_id = ANY(${})", params.len()));
        }
        if let Some(security_id) = &filter.security_id {
            params.push(Box::new(security_id.clone()));
            clauses.push(format!("security_id = ${}", params.len()));
        }
        if let Some(transaction_type) = filter.transaction_type {
            params.push(Box::new(transaction_type.to_string()));
            clauses.push(format!("transaction_type = ${}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(Box::new(status.to_string()));
            clauses.push(format!("status = ${}", params.len()));
        }
        if let Some(statuses) = &filter.statuses {
            let names: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
            params.push(Box::new(names));
            clauses.push(format!("status = ANY(${})", params.len()));
        }
        if let Some(date) = filter.transaction_date {
            params.push(Box::new(date));
            clauses.push(format!("transaction_date = ${}", params.len()));
        }
        if let Some(from) = filter.date_from {
            params.push(Box::new(from));
            clauses.push(format!("transaction_date >= ${}", params.len()));
        }
        if let Some(to) = filter.date_to {
            params.push(Box::new(to));
            clauses.push(format!("transaction_date <= ${}", params.len()));
        }
        if let Some(min) = filter.min_quantity {
            params.push(Box::new(min));
            clauses.push(format!("quantity >= ${}", params.len()));
        }
        if let Some(max) = filter.max_quantity {
            params.push(Box::new(max));
            clauses.push(format!("quantity <= ${}", params.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {} ", clauses.join(" AND "))
        };
        params.push(Box::new(page.limit as i64));
        let limit_param = params.len();
        params.push(Box::new(page.offset as i64));
        let offset_param = params.len();

        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions {where_clause}{} LIMIT ${limit_param} OFFSET ${offset_param}",
            order_clause(sort)
        );
        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let client = self.pool.get().await.map_err(map_pool_error)?;
        let rows = client
            .query(sql.as_str(), &param_refs)
            .await
            .map_err(map_pg_error)?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn update_transaction_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        error_message: Option<String>,
        expected_version: Version,
    ) -> Result<Transaction> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_opt(
                format!(
                    "UPDATE transactions SET status = $1, error_message = $2, \
                     version = version + 1 \
                     WHERE id = $3 AND version = $4 RETURNING {TRANSACTION_COLUMNS}"
                ).as_str(),
                &[&status.to_string(), &error_message, &id, &expected_version],
            )
            .await
            .map_err(map_pg_error)?;
        match row {
            Some(row) => transaction_from_row(&row),
            None => {
                let exists = client
                    .query_opt("SELECT 1 FROM transactions WHERE id = $1", &[&id])
                    .await
                    .map_err(map_pg_error)?;
                if exists.is_some() {
                    Err(Error::OptimisticLock {
                        entity: "transaction",
                        id,
                    })
                } else {
                    Err(Error::not_found("transaction", id.to_string()))
                }
            }
        }
    }

    async fn transaction_stats(&self) -> Result<TransactionStats> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let rows = client
            .query(
                "SELECT status, count(*) AS n FROM transactions GROUP BY status",
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        let mut stats = TransactionStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(map_pg_error)?;
            let count: i64 = row.try_get("n").map_err(map_pg_error)?;
            let status = status
                .parse()
                .map_err(|_| Error::Internal(format!("unknown status {status} on file")))?;
            stats.by_status.insert(status, count as u64);
            stats.total += count as u64;
        }
        Ok(stats)
    }
}

#[async_trait]
impl BalanceRepository for PostgresStore {
    async fn balance_by_id(&self, id: BalanceId) -> Result<Option<Balance>> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_opt(
                format!("SELECT {BALANCE_COLUMNS} FROM balances WHERE id = $1").as_str(),
                &[&id],
            )
            .await
            .map_err(map_pg_error)?;
        row.map(|r| balance_from_row(&r)).transpose()
    }

    async fn balance_for(
        &self,
        portfolio_id: &str,
        security_id: Option<&str>,
    ) -> Result<Option<Balance>> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_opt(
                format!(
                    "SELECT {BALANCE_COLUMNS} FROM balances \
                     WHERE portfolio_id = $1 AND COALESCE(security_id, '') = $2"
                ).as_str(),
                &[
                    &portfolio_id,
                    &normalize_security(security_id).unwrap_or_default(),
                ],
            )
            .await
            .map_err(map_pg_error)?;
        row.map(|r| balance_from_row(&r)).transpose()
    }

    async fn cash_balance(&self, portfolio_id: &str) -> Result<Option<Balance>> {
        self.balance_for(portfolio_id, None).await
    }

    async fn balances_for_portfolio(&self, portfolio_id: &str) -> Result<Vec<Balance>> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let rows = client
            .query(
                format!(
                    "SELECT {BALANCE_COLUMNS} FROM balances WHERE portfolio_id = $1 ORDER BY id"
                ).as_str(),
                &[&portfolio_id],
            )
            .await
            .map_err(map_pg_error)?;
        rows.iter().map(balance_from_row).collect()
    }

    async fn list_balances(
        &self,
        filter: &BalanceFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<Balance>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

        if let Some(portfolio_id) = &filter.portfolio_id {
            params.push(Box::new(portfolio_id.clone()));
            clauses.push(format!("portfolio_id = ${}", params.len()));
        }
        if let Some(security_id) = &filter.security_id {
            params.push(Box::new(security_id.clone()));
            clauses.push(format!("security_id = ${}", params.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {} ", clauses.join(" AND "))
        };
        params.push(Box::new(page.limit as i64));
        let limit_param = params.len();
        params.push(Box::new(page.offset as i64));
        let offset_param = params.len();

        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM balances {where_clause}{} LIMIT ${limit_param} OFFSET ${offset_param}",
            order_clause(sort)
        );
        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let client = self.pool.get().await.map_err(map_pool_error)?;
        let rows = client
            .query(sql.as_str(), &param_refs)
            .await
            .map_err(map_pg_error)?;
        rows.iter().map(balance_from_row).collect()
    }

    async fn upsert_balance(&self, balance: Balance) -> Result<Balance> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_one(
                format!(
                    "INSERT INTO balances \
                     (portfolio_id, security_id, quantity_long, quantity_short) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (portfolio_id, COALESCE(security_id, '')) DO UPDATE \
                     SET quantity_long = EXCLUDED.quantity_long, \
                         quantity_short = EXCLUDED.quantity_short, \
                         version = balances.version + 1, \
                         last_updated = now() \
                     RETURNING {BALANCE_COLUMNS}"
                ).as_str(),
                &[
                    &balance.portfolio_id,
                    &normalize_security(balance.security_id.as_deref()),
                    &balance.quantity_long,
                    &balance.quantity_short,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        balance_from_row(&row)
    }

    async fn update_balance_quantities(
        &self,
        id: BalanceId,
        quantity_long: Decimal,
        quantity_short: Decimal,
        expected_version: Version,
    ) -> Result<Balance> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_opt(
                format!(
                    "UPDATE balances SET quantity_long = $1, quantity_short = $2, \
                     version = version + 1, last_updated = now() \
                     WHERE id = $3 AND version = $4 RETURNING {BALANCE_COLUMNS}"
                ).as_str(),
                &[&quantity_long, &quantity_short, &id, &expected_version],
            )
            .await
            .map_err(map_pg_error)?;
        match row {
            Some(row) => balance_from_row(&row),
            None => {
                let exists = client
                    .query_opt("SELECT 1 FROM balances WHERE id = $1", &[&id])
                    .await
                    .map_err(map_pg_error)?;
                if exists.is_some() {
                    Err(Error::OptimisticLock {
                        entity: "balance",
                        id,
                    })
                } else {
                    Err(Error::not_found("balance", id.to_string()))
                }
            }
        }
    }

    async fn update_balances(&self, writes: Vec<BalanceWrite>) -> Result<()> {
        let mut client = self.pool.get().await.map_err(map_pool_error)?;
        let db = client.transaction().await.map_err(map_pg_error)?;
        for write in &writes {
            // Any failure drops the transaction guard, rolling everything
            // back.
            Self::apply_balance_write(&db, write).await?;
        }
        db.commit().await.map_err(map_pg_error)
    }

    async fn balance_stats(&self) -> Result<BalanceStats> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let row = client
            .query_one(
                "SELECT count(*) AS total, \
                        count(*) FILTER (WHERE security_id IS NULL) AS cash_rows, \
                        count(*) FILTER (WHERE security_id IS NOT NULL) AS security_rows, \
                        count(DISTINCT portfolio_id) AS portfolios \
                 FROM balances",
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(BalanceStats {
            total: row.try_get::<_, i64>("total").map_err(map_pg_error)? as u64,
            portfolios: row.try_get::<_, i64>("portfolios").map_err(map_pg_error)? as u64,
            security_rows: row
                .try_get::<_, i64>("security_rows")
                .map_err(map_pg_error)? as u64,
            cash_rows: row.try_get::<_, i64>("cash_rows").map_err(map_pg_error)? as u64,
        })
    }
}

#[async_trait]
impl AccountingStore for PostgresStore {
    async fn commit_processing(&self, commit: ProcessingCommit) -> Result<()> {
        let mut client = self.pool.get().await.map_err(map_pool_error)?;
        let db = client.transaction().await.map_err(map_pg_error)?;

        for write in &commit.balance_writes {
            Self::apply_balance_write(&db, write).await?;
        }

        let updated = db
            .execute(
                "UPDATE transactions SET status = $1, error_message = $2, \
                 reprocessing_attempts = $3, version = version + 1 \
                 WHERE id = $4 AND version = $5",
                &[
                    &commit.status.to_string(),
                    &commit.error_message,
                    &commit.reprocessing_attempts,
                    &commit.transaction_id,
                    &commit.expected_transaction_version,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        if updated == 0 {
            return Err(Error::OptimisticLock {
                entity: "transaction",
                id: commit.transaction_id,
            });
        }

        db.commit().await.map_err(map_pg_error)
    }
}
