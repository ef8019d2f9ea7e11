//! PostgreSQL store.
//!
//! Implements every repository trait and `Store::commit` on one SQL
//! transaction per unit of work. Debits are a single conditional update
//! (`WHERE balance >= $amount`), never a read-then-write.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::error::StoreError;
use crate::repository::{
    AccountRepository, CatalogRepository, ClaimOutcome, OrderRepository, Store,
};
use crate::unit_of_work::{CommitReceipt, LedgerPosting, OrderWrite, PostingDirection, UnitOfWork};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use smm_domain::{
    Account, EncryptedSecret, Link, Money, Order, OrderId, OrderStatus, Provider, ProviderId,
    RateChange, Service, ServiceId, Transaction, TransactionStatus, UserId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const ORDER_COLUMNS: &str = "id, user_id, service_id, provider_id, upstream_service_id, link, \
     quantity, charge, status, upstream_order_id, start_count, remains, refunded_amount, \
     dispatch_lease_until, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, account_id, amount, balance_before, balance_after, \
     kind, status, description, reference_id, created_at";

const SERVICE_COLUMNS: &str = "id, name, provider_id, upstream_service_id, provider_rate, \
     fixed_margin, percent_margin, custom_price, selling_price, min_order, max_order, status, \
     updated_at";

/// PostgreSQL implementation of [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn money(row: &PgRow, column: &str) -> Result<Money, StoreError> {
    let value: Decimal = row.try_get(column)?;
    Ok(Money::new(value)?)
}

fn unsigned(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value)
        .map_err(|_| StoreError::Deserialization(format!("{} is negative: {}", column, value)))
}

fn quantity(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| StoreError::Deserialization(format!("{} is negative: {}", column, value)))
}

fn parse_order(row: &PgRow) -> Result<Order, StoreError> {
    let link: String = row.try_get("link")?;
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        service_id: row.try_get("service_id")?,
        provider_id: row.try_get("provider_id")?,
        upstream_service_id: row.try_get("upstream_service_id")?,
        link: Link::parse(&link)?,
        quantity: quantity(row, "quantity")?,
        charge: money(row, "charge")?,
        status: status.parse()?,
        upstream_order_id: row.try_get("upstream_order_id")?,
        start_count: unsigned(row, "start_count")?,
        remains: unsigned(row, "remains")?,
        refunded_amount: money(row, "refunded_amount")?,
        dispatch_lease_until: row.try_get("dispatch_lease_until")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_transaction(row: &PgRow) -> Result<Transaction, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: money(row, "amount")?,
        balance_before: money(row, "balance_before")?,
        balance_after: money(row, "balance_after")?,
        kind: kind.parse()?,
        status: status.parse()?,
        description: row.try_get("description")?,
        reference_id: row.try_get("reference_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_service(row: &PgRow) -> Result<Service, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Service {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        provider_id: row.try_get("provider_id")?,
        upstream_service_id: row.try_get("upstream_service_id")?,
        provider_rate: row.try_get("provider_rate")?,
        fixed_margin: row.try_get("fixed_margin")?,
        percent_margin: row.try_get("percent_margin")?,
        custom_price: row.try_get("custom_price")?,
        selling_price: row.try_get("selling_price")?,
        min_order: quantity(row, "min_order")?,
        max_order: quantity(row, "max_order")?,
        status: status.parse()?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_provider(row: &PgRow) -> Result<Provider, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let api_key: String = row.try_get("api_key")?;
    Ok(Provider {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        api_url: row.try_get("api_url")?,
        kind: kind.parse()?,
        status: status.parse()?,
        api_key: EncryptedSecret::from_encoded(api_key),
    })
}

fn parse_rate_change(row: &PgRow) -> Result<RateChange, StoreError> {
    Ok(RateChange {
        service_id: row.try_get("service_id")?,
        provider_id: row.try_get("provider_id")?,
        old_rate: row.try_get("old_rate")?,
        new_rate: row.try_get("new_rate")?,
        change_percent: row.try_get("change_percent")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Serialization(format!("{} overflows BIGINT", value)))
}

// =============================================================================
// Unit of work steps (run on the transaction connection)
// =============================================================================

async fn insert_order(conn: &mut PgConnection, order: &Order) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO orders (
            id, user_id, service_id, provider_id, upstream_service_id, link, quantity,
            charge, status, upstream_order_id, start_count, remains, refunded_amount,
            dispatch_lease_until, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(order.id)
    .bind(order.user_id)
    .bind(order.service_id)
    .bind(order.provider_id)
    .bind(&order.upstream_service_id)
    .bind(order.link.as_str())
    .bind(order.quantity as i32)
    .bind(order.charge.as_decimal())
    .bind(order.status.as_str())
    .bind(&order.upstream_order_id)
    .bind(to_i64(order.start_count)?)
    .bind(to_i64(order.remains)?)
    .bind(order.refunded_amount.as_decimal())
    .bind(order.dispatch_lease_until)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(conn)
    .await
    .map_err(|e| match StoreError::from(e) {
        StoreError::Duplicate { .. } => StoreError::duplicate("order", order.id.to_string()),
        other => other,
    })?;
    Ok(())
}

async fn update_order(conn: &mut PgConnection, order: &Order) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE orders
        SET status = $2,
            upstream_order_id = $3,
            start_count = $4,
            remains = $5,
            refunded_amount = $6,
            dispatch_lease_until = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(order.id)
    .bind(order.status.as_str())
    .bind(&order.upstream_order_id)
    .bind(to_i64(order.start_count)?)
    .bind(to_i64(order.remains)?)
    .bind(order.refunded_amount.as_decimal())
    .bind(order.dispatch_lease_until)
    .bind(order.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn apply_posting(
    conn: &mut PgConnection,
    posting: &LedgerPosting,
    now: DateTime<Utc>,
) -> Result<Transaction, StoreError> {
    let amount = posting.amount.as_decimal();

    let after: Option<Decimal> = match posting.direction {
        PostingDirection::Debit => {
            sqlx::query_scalar(
                r#"
                UPDATE accounts
                SET balance = balance - $2, updated_at = $3
                WHERE user_id = $1 AND balance >= $2
                RETURNING balance
                "#,
            )
            .bind(posting.account_id)
            .bind(amount)
            .bind(now)
            .fetch_optional(&mut *conn)
            .await?
        },
        PostingDirection::Credit => Some(
            sqlx::query_scalar(
                r#"
                INSERT INTO accounts (user_id, balance, updated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id)
                DO UPDATE SET balance = accounts.balance + EXCLUDED.balance,
                              updated_at = EXCLUDED.updated_at
                RETURNING balance
                "#,
            )
            .bind(posting.account_id)
            .bind(amount)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?,
        ),
    };

    let after = match after {
        Some(after) => Money::new(after)?,
        None => {
            let available: Option<Decimal> =
                sqlx::query_scalar("SELECT balance FROM accounts WHERE user_id = $1")
                    .bind(posting.account_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            return Err(StoreError::InsufficientFunds {
                account_id: posting.account_id,
                required: posting.amount,
                available: Money::new(available.unwrap_or_default())?,
            });
        },
    };
    let before = match posting.direction {
        PostingDirection::Debit => after.plus(posting.amount),
        PostingDirection::Credit => after.saturating_minus(posting.amount),
    };

    let tx = Transaction {
        id: Uuid::now_v7(),
        account_id: posting.account_id,
        amount: posting.amount,
        balance_before: before,
        balance_after: after,
        kind: posting.kind,
        status: TransactionStatus::Completed,
        description: posting.description.clone(),
        reference_id: posting.reference_id,
        created_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO transactions (
            id, account_id, amount, balance_before, balance_after, kind, status,
            description, reference_id, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(tx.id)
    .bind(tx.account_id)
    .bind(tx.amount.as_decimal())
    .bind(tx.balance_before.as_decimal())
    .bind(tx.balance_after.as_decimal())
    .bind(tx.kind.as_str())
    .bind(tx.status.as_str())
    .bind(&tx.description)
    .bind(tx.reference_id)
    .bind(tx.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(tx)
}

// =============================================================================
// Account Repository Implementation
// =============================================================================

#[async_trait]
impl AccountRepository for PgStore {
    async fn find_account(&self, user_id: UserId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT user_id, balance, updated_at FROM accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| -> Result<Account, StoreError> {
            Ok(Account {
                user_id: row.try_get("user_id")?,
                balance: money(&row, "balance")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn list_transactions(&self, account_id: UserId) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE account_id = $1 ORDER BY created_at DESC, id DESC",
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_transaction).collect()
    }

    async fn find_by_reference(&self, order_id: OrderId) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE reference_id = $1 ORDER BY created_at ASC, id ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_transaction).collect()
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for PgStore {
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(parse_order).transpose()
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_order).collect()
    }

    async fn find_all(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders ORDER BY created_at DESC, id DESC",
            ORDER_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_order).collect()
    }

    async fn find_reconcilable(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM orders
            WHERE status IN ('pending', 'processing') AND upstream_order_id IS NOT NULL
            ORDER BY created_at ASC
            "#,
            ORDER_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_order).collect()
    }

    async fn find_undispatched(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM orders
            WHERE status = 'pending' AND upstream_order_id IS NULL
            ORDER BY created_at ASC
            "#,
            ORDER_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_order).collect()
    }

    async fn claim_dispatch(
        &self,
        id: OrderId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let claimed = sqlx::query(&format!(
            r#"
            UPDATE orders
            SET dispatch_lease_until = $2, updated_at = $3
            WHERE id = $1
              AND status = 'pending'
              AND upstream_order_id IS NULL
              AND (dispatch_lease_until IS NULL OR dispatch_lease_until <= $3)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(id)
        .bind(lease_until)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(parse_order(&row)?));
        }

        let order = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| StoreError::not_found("order", id.to_string()))?;
        match order.dispatch_lease_until {
            Some(until) if order.status == OrderStatus::Pending && order.upstream_order_id.is_none() => {
                Ok(ClaimOutcome::Leased { until })
            },
            _ => Ok(ClaimOutcome::NotPending(order.status)),
        }
    }

    async fn record_upstream_order(
        &self,
        id: OrderId,
        upstream_order_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET upstream_order_id = $2, dispatch_lease_until = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND upstream_order_id IS NULL
            "#,
        )
        .bind(id)
        .bind(upstream_order_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_dispatch(&self, id: OrderId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE orders SET dispatch_lease_until = NULL WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

// =============================================================================
// Catalog Repository Implementation
// =============================================================================

#[async_trait]
impl CatalogRepository for PgStore {
    async fn find_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM services WHERE id = $1", SERVICE_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(parse_service).transpose()
    }

    async fn find_services_by_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<Service>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM services WHERE provider_id = $1 ORDER BY name",
            SERVICE_COLUMNS
        ))
        .bind(provider_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_service).collect()
    }

    async fn save_service(&self, service: &Service) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO services (
                id, name, provider_id, upstream_service_id, provider_rate, fixed_margin,
                percent_margin, custom_price, selling_price, min_order, max_order, status,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                upstream_service_id = EXCLUDED.upstream_service_id,
                provider_rate = EXCLUDED.provider_rate,
                fixed_margin = EXCLUDED.fixed_margin,
                percent_margin = EXCLUDED.percent_margin,
                custom_price = EXCLUDED.custom_price,
                selling_price = EXCLUDED.selling_price,
                min_order = EXCLUDED.min_order,
                max_order = EXCLUDED.max_order,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(service.id)
        .bind(&service.name)
        .bind(service.provider_id)
        .bind(&service.upstream_service_id)
        .bind(service.provider_rate)
        .bind(service.fixed_margin)
        .bind(service.percent_margin)
        .bind(service.custom_price)
        .bind(service.selling_price)
        .bind(service.min_order as i32)
        .bind(service.max_order as i32)
        .bind(service.status.as_str())
        .bind(service.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn record_rate_change(&self, change: &RateChange) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rate_changes (
                service_id, provider_id, old_rate, new_rate, change_percent, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(change.service_id)
        .bind(change.provider_id)
        .bind(change.old_rate)
        .bind(change.new_rate)
        .bind(change.change_percent)
        .bind(change.recorded_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn find_rate_changes(
        &self,
        service_id: ServiceId,
    ) -> Result<Vec<RateChange>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT service_id, provider_id, old_rate, new_rate, change_percent, recorded_at
            FROM rate_changes
            WHERE service_id = $1
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(service_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_rate_change).collect()
    }

    async fn find_provider(&self, id: ProviderId) -> Result<Option<Provider>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, api_url, kind, status, api_key FROM providers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(parse_provider).transpose()
    }

    async fn find_active_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, api_url, kind, status, api_key FROM providers \
             WHERE status = 'active' ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parse_provider).collect()
    }

    async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO providers (id, name, api_url, kind, status, api_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                api_url = EXCLUDED.api_url,
                kind = EXCLUDED.kind,
                status = EXCLUDED.status,
                api_key = EXCLUDED.api_key
            "#,
        )
        .bind(provider.id)
        .bind(&provider.name)
        .bind(&provider.api_url)
        .bind(provider.kind.as_str())
        .bind(provider.status.as_str())
        .bind(provider.api_key.as_encoded())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

#[async_trait]
impl Store for PgStore {
    fn accounts(&self) -> &dyn AccountRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    fn catalog(&self) -> &dyn CatalogRepository {
        self
    }

    async fn commit(&self, uow: UnitOfWork) -> Result<CommitReceipt, StoreError> {
        uow.validate()?;
        let now = Utc::now();
        let (writes, postings) = uow.into_parts();

        let mut tx = self.pool.begin().await?;
        let mut receipt = CommitReceipt::default();

        for write in writes {
            match write {
                OrderWrite::Insert(order) => {
                    insert_order(&mut tx, &order).await?;
                    receipt.orders.push(order);
                },
                OrderWrite::Transition {
                    order_id,
                    expected,
                    to,
                    patch,
                } => {
                    let row = sqlx::query(&format!(
                        "SELECT {} FROM orders WHERE id = $1 FOR UPDATE",
                        ORDER_COLUMNS
                    ))
                    .bind(order_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| StoreError::not_found("order", order_id.to_string()))?;

                    let current = parse_order(&row)?;
                    let next = OrderWrite::apply_transition(&current, &expected, to, &patch, now)?;
                    update_order(&mut tx, &next).await?;
                    receipt.orders.push(next);
                },
            }
        }

        for posting in &postings {
            receipt.transactions.push(apply_posting(&mut tx, posting, now).await?);
        }

        // Dropping `tx` on any early return above rolls back.
        tx.commit().await?;
        debug!(
            orders = receipt.orders.len(),
            transactions = receipt.transactions.len(),
            "Unit of work committed"
        );
        Ok(receipt)
    }
}
