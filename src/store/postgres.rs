use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::{InventoryLedger, MarkPaid, OrderRepository, StoreError};
use crate::domain::order::{
    Confirmation, NewOrder, Order, OrderError, OrderLine, PaymentMerge, PaymentMethod,
    PriceBreakdown, ShippingAddress,
};
use crate::domain::product::{Product, Reservation};

// ============================================================================
// PostgreSQL Store
// ============================================================================
//
// Stock reservation is a single conditional UPDATE, so two checkouts racing
// for the last unit cannot both win. Payment and delivery merges lock the
// order row (SELECT ... FOR UPDATE) and apply the aggregate's rules inside
// the transaction. A payment attempt holds the order through the
// payment_attempt column until it releases it or its lease runs out.
//
// ============================================================================

const SCHEMA: &str = include_str!("schema.sql");

macro_rules! order_columns {
    () => {
        "id, user_id, payment_method, payment_currency, \
         items_price, shipping_price, tax_price, total_price, \
         shipping_address, is_paid, paid_at, payment_confirmation, \
         is_delivered, delivered_at, expired_at, created_at"
    };
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    payment_method: String,
    payment_currency: String,
    items_price: Decimal,
    shipping_price: Decimal,
    tax_price: Decimal,
    total_price: Decimal,
    shipping_address: Json<ShippingAddress>,
    is_paid: bool,
    paid_at: Option<DateTime<Utc>>,
    payment_confirmation: Option<Json<Confirmation>>,
    is_delivered: bool,
    delivered_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct LineRow {
    order_id: Uuid,
    product_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
}

impl OrderRow {
    fn into_order(self, lines: Vec<OrderLine>) -> Result<Order, StoreError> {
        let payment_method = PaymentMethod::parse(&self.payment_method).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "order {} has unknown payment method '{}'",
                self.id, self.payment_method
            ))
        })?;

        Ok(Order {
            id: self.id,
            user_id: self.user_id,
            payment_method,
            payment_currency: self.payment_currency,
            lines,
            prices: PriceBreakdown {
                items_price: self.items_price,
                shipping_price: self.shipping_price,
                tax_price: self.tax_price,
                total_price: self.total_price,
            },
            shipping_address: self.shipping_address.0,
            created_at: self.created_at,
            is_paid: self.is_paid,
            paid_at: self.paid_at,
            payment_confirmation: self.payment_confirmation.map(|c| c.0),
            is_delivered: self.is_delivered,
            delivered_at: self.delivered_at,
            expired_at: self.expired_at,
        })
    }
}

fn group_lines(rows: Vec<LineRow>) -> HashMap<Uuid, Vec<OrderLine>> {
    let mut grouped: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
    for row in rows {
        grouped.entry(row.order_id).or_default().push(OrderLine {
            product_id: row.product_id,
            quantity: row.quantity,
            unit_price: row.unit_price,
        });
    }
    grouped
}

fn assemble(rows: Vec<OrderRow>, lines: Vec<LineRow>) -> Result<Vec<Order>, StoreError> {
    let mut lines = group_lines(lines);
    rows.into_iter()
        .map(|row| {
            let order_lines = lines.remove(&row.id).unwrap_or_default();
            row.into_order(order_lines)
        })
        .collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Idempotent `CREATE ... IF NOT EXISTS` for every table the store uses.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert catalog entries that do not exist yet. Existing stock is kept.
    pub async fn seed_products(&self, products: &[Product]) -> Result<u64, StoreError> {
        if products.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = products.iter().map(|p| p.id).collect();
        let names: Vec<String> = products.iter().map(|p| p.name.clone()).collect();
        let prices: Vec<Decimal> = products.iter().map(|p| p.price).collect();
        let stock: Vec<i32> = products.iter().map(|p| p.count_in_stock).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO products (id, name, price, count_in_stock)
            SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::numeric[], $4::integer[])
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&names)
        .bind(&prices)
        .bind(&stock)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn load_lines<'e, E>(executor: E, order_ids: &[Uuid]) -> Result<Vec<LineRow>, StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let rows = sqlx::query_as::<_, LineRow>(
            r#"
            SELECT order_id, product_id, quantity, unit_price
            FROM order_lines
            WHERE order_id = ANY($1)
            ORDER BY order_id, line_no
            "#,
        )
        .bind(order_ids)
        .fetch_all(executor)
        .await?;

        Ok(rows)
    }

    async fn lock_order(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
    ) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::OrderNotFound(order_id))?;

        let lines = Self::load_lines(&mut **tx, &[order_id]).await?;
        let lines = group_lines(lines).remove(&order_id).unwrap_or_default();
        row.into_order(lines)
    }

    async fn available_stock(&self, product_id: Uuid) -> Result<Option<i32>, StoreError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT count_in_stock FROM products WHERE id = $1")
                .bind(product_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(count,)| count))
    }

    async fn fetch_orders(&self, rows: Vec<OrderRow>) -> Result<Vec<Order>, StoreError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let lines = Self::load_lines(&self.pool, &ids).await?;
        assemble(rows, lines)
    }
}

#[async_trait]
impl InventoryLedger for PgStore {
    async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<Reservation, StoreError> {
        let reserved: Option<(Decimal,)> = sqlx::query_as(
            r#"
            UPDATE products
            SET count_in_stock = count_in_stock - $2
            WHERE id = $1 AND count_in_stock >= $2
            RETURNING price
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((unit_price,)) = reserved {
            return Ok(Reservation {
                product_id,
                quantity,
                unit_price,
            });
        }

        // Nothing changed; work out why for the caller.
        match self.available_stock(product_id).await? {
            None => Err(StoreError::ProductNotFound(product_id)),
            Some(available) => Err(StoreError::InsufficientStock {
                product_id,
                requested: quantity,
                available,
            }),
        }
    }

    async fn release(&self, product_id: Uuid, quantity: i32) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE products SET count_in_stock = count_in_stock + $2 WHERE id = $1")
                .bind(product_id)
                .bind(quantity)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ProductNotFound(product_id));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let order_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        let (created_at,): (DateTime<Utc>,) = sqlx::query_as(
            r#"
            INSERT INTO orders (
                id, user_id, payment_method, payment_currency,
                items_price, shipping_price, tax_price, total_price,
                shipping_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING created_at
            "#,
        )
        .bind(order_id)
        .bind(order.user_id)
        .bind(order.payment_method.as_str())
        .bind(&order.payment_currency)
        .bind(order.prices.items_price)
        .bind(order.prices.shipping_price)
        .bind(order.prices.tax_price)
        .bind(order.prices.total_price)
        .bind(Json(&order.shipping_address))
        .fetch_one(&mut *tx)
        .await?;

        let order_ids: Vec<Uuid> = order.lines.iter().map(|_| order_id).collect();
        let line_nos: Vec<i32> = (1..=order.lines.len() as i32).collect();
        let product_ids: Vec<Uuid> = order.lines.iter().map(|l| l.product_id).collect();
        let quantities: Vec<i32> = order.lines.iter().map(|l| l.quantity).collect();
        let unit_prices: Vec<Decimal> = order.lines.iter().map(|l| l.unit_price).collect();

        sqlx::query(
            r#"
            INSERT INTO order_lines (order_id, line_no, product_id, quantity, unit_price)
            SELECT * FROM UNNEST($1::uuid[], $2::integer[], $3::uuid[], $4::integer[], $5::numeric[])
            "#,
        )
        .bind(&order_ids)
        .bind(&line_nos)
        .bind(&product_ids)
        .bind(&quantities)
        .bind(&unit_prices)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(order.into_order(order_id, created_at))
    }

    async fn find_by_id(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(self.fetch_orders(vec![row]).await?.pop()),
        }
    }

    async fn find_by_owner(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        self.fetch_orders(rows).await
    }

    async fn find_all(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        self.fetch_orders(rows).await
    }

    async fn claim_payment(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;
        let order = Self::lock_order(&mut tx, order_id).await?;
        order.ensure_payable()?;

        let claimed = sqlx::query(
            r#"
            UPDATE orders
            SET payment_attempt = $2, payment_attempt_at = $3
            WHERE id = $1
              AND (payment_attempt IS NULL OR payment_attempt_at < $4)
            "#,
        )
        .bind(order_id)
        .bind(attempt_id)
        .bind(claimed_at)
        .bind(stale_before)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(OrderError::PaymentInProgress(order_id).into());
        }

        tx.commit().await?;
        Ok(order)
    }

    async fn release_payment_claim(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE orders
            SET payment_attempt = NULL, payment_attempt_at = NULL
            WHERE id = $1 AND payment_attempt = $2
            "#,
        )
        .bind(order_id)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_paid(
        &self,
        order_id: Uuid,
        confirmation: Confirmation,
        paid_at: DateTime<Utc>,
    ) -> Result<MarkPaid, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut order = Self::lock_order(&mut tx, order_id).await?;

        match order.apply_payment(confirmation, paid_at)? {
            PaymentMerge::Duplicate => {
                tx.rollback().await?;
                Ok(MarkPaid::AlreadyPaid(order))
            }
            PaymentMerge::Applied => {
                sqlx::query(
                    r#"
                    UPDATE orders
                    SET is_paid = TRUE, paid_at = $2, payment_confirmation = $3
                    WHERE id = $1
                    "#,
                )
                .bind(order_id)
                .bind(order.paid_at)
                .bind(order.payment_confirmation.as_ref().map(Json))
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(MarkPaid::Applied(order))
            }
        }
    }

    async fn mark_delivered(
        &self,
        order_id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut order = Self::lock_order(&mut tx, order_id).await?;

        if order.apply_delivery(delivered_at)? {
            sqlx::query("UPDATE orders SET is_delivered = TRUE, delivered_at = $2 WHERE id = $1")
                .bind(order_id)
                .bind(order.delivered_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(order)
    }

    async fn expire_unpaid(
        &self,
        created_before: DateTime<Utc>,
        expired_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row locks taken by the UPDATE serialize this against mark_paid.
        let expired: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE orders
            SET expired_at = $2
            WHERE is_paid = FALSE AND expired_at IS NULL AND created_at < $1
            RETURNING id
            "#,
        )
        .bind(created_before)
        .bind(expired_at)
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = expired.into_iter().map(|(id,)| id).collect();

        if !ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE products p
                SET count_in_stock = p.count_in_stock + l.quantity
                FROM (
                    SELECT product_id, SUM(quantity)::INTEGER AS quantity
                    FROM order_lines
                    WHERE order_id = ANY($1)
                    GROUP BY product_id
                ) l
                WHERE p.id = l.product_id
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
