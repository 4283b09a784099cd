use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use super::PositionStore;
use crate::error::{ConflictError, StoreError};
use crate::models::{
    ClosedTrade, Direction, ExitReason, Order, OrderPurpose, OrderStatus, OrderType, Position,
    PositionState, Side,
};

const POSITION_SELECT: &str = r#"
    SELECT p.instrument, p.state, p.direction, p.quantity, p.avg_entry_price,
           p.stop_loss, p.take_profit, p.second_take_profit, p.trailing_stop, p.targets_hit,
           p.opened_at, p.reconcile_required,
           p.version, p.updated_at,
           o.id AS o_id, o.broker_order_id AS o_broker_order_id, o.instrument AS o_instrument,
           o.side AS o_side, o.order_type AS o_order_type, o.purpose AS o_purpose,
           o.quantity AS o_quantity, o.price AS o_price, o.status AS o_status,
           o.filled_quantity AS o_filled_quantity, o.avg_fill_price AS o_avg_fill_price,
           o.exit_reason AS o_exit_reason, o.reject_reason AS o_reject_reason,
           o.created_at AS o_created_at, o.updated_at AS o_updated_at
    FROM positions p
    LEFT JOIN orders o ON o.id = p.active_order_id
"#;

const ORDER_SELECT: &str = r#"
    SELECT o.id AS o_id, o.broker_order_id AS o_broker_order_id, o.instrument AS o_instrument,
           o.side AS o_side, o.order_type AS o_order_type, o.purpose AS o_purpose,
           o.quantity AS o_quantity, o.price AS o_price, o.status AS o_status,
           o.filled_quantity AS o_filled_quantity, o.avg_fill_price AS o_avg_fill_price,
           o.exit_reason AS o_exit_reason, o.reject_reason AS o_reject_reason,
           o.created_at AS o_created_at, o.updated_at AS o_updated_at
    FROM orders o
"#;

/// Postgres-backed position store
///
/// Each compare-and-swap is one transaction: order upsert, versioned position
/// write and optional trade insert commit together or not at all. The schema
/// (`migrations/`) is applied by external tooling.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        // Fail fast if the schema was never applied
        sqlx::query("SELECT 1 FROM positions LIMIT 1")
            .fetch_optional(&store.pool)
            .await?;

        tracing::info!("Connected to Postgres position store");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn corrupt(instrument: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        instrument: instrument.to_string(),
        reason: reason.to_string(),
    }
}

fn to_decimal(instrument: &str, value: f64) -> Result<Decimal, StoreError> {
    Decimal::try_from(value).map_err(|e| corrupt(instrument, format!("{} ({})", e, value)))
}

fn to_decimal_opt(instrument: &str, value: Option<f64>) -> Result<Option<Decimal>, StoreError> {
    value.map(|v| to_decimal(instrument, v)).transpose()
}

fn from_decimal(instrument: &str, value: Decimal) -> Result<f64, StoreError> {
    value
        .to_f64()
        .ok_or_else(|| corrupt(instrument, format!("numeric out of range: {}", value)))
}

fn from_decimal_opt(instrument: &str, value: Option<Decimal>) -> Result<Option<f64>, StoreError> {
    value.map(|v| from_decimal(instrument, v)).transpose()
}

fn get<'r, T>(row: &'r PgRow, instrument: &str, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| corrupt(instrument, format!("column {}: {}", column, e)))
}

fn parse_enum<T>(
    instrument: &str,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, StoreError> {
    parse(value).ok_or_else(|| corrupt(instrument, format!("unknown value '{}'", value)))
}

/// Order columns carry an `o_` prefix in both selects
fn order_from_row(row: &PgRow, instrument: &str) -> Result<Order, StoreError> {
    let side: String = get(row, instrument, "o_side")?;
    let order_type: String = get(row, instrument, "o_order_type")?;
    let purpose: String = get(row, instrument, "o_purpose")?;
    let status: String = get(row, instrument, "o_status")?;
    let exit_reason: Option<String> = get(row, instrument, "o_exit_reason")?;

    Ok(Order {
        id: get(row, instrument, "o_id")?,
        broker_order_id: get(row, instrument, "o_broker_order_id")?,
        instrument: get(row, instrument, "o_instrument")?,
        side: parse_enum(instrument, &side, Side::parse)?,
        order_type: parse_enum(instrument, &order_type, OrderType::parse)?,
        quantity: from_decimal(instrument, get(row, instrument, "o_quantity")?)?,
        price: from_decimal(instrument, get(row, instrument, "o_price")?)?,
        status: parse_enum(instrument, &status, OrderStatus::parse)?,
        filled_quantity: from_decimal(instrument, get(row, instrument, "o_filled_quantity")?)?,
        avg_fill_price: from_decimal_opt(instrument, get(row, instrument, "o_avg_fill_price")?)?,
        purpose: parse_enum(instrument, &purpose, OrderPurpose::parse)?,
        exit_reason: exit_reason
            .map(|r| parse_enum(instrument, &r, ExitReason::parse))
            .transpose()?,
        reject_reason: get(row, instrument, "o_reject_reason")?,
        created_at: get(row, instrument, "o_created_at")?,
        updated_at: get(row, instrument, "o_updated_at")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position, StoreError> {
    let instrument: String = row
        .try_get("instrument")
        .map_err(|e| corrupt("?", e))?;
    let inst = instrument.as_str();

    let state: String = get(row, inst, "state")?;
    let direction: Option<String> = get(row, inst, "direction")?;
    let order_id: Option<Uuid> = get(row, inst, "o_id")?;
    let targets_hit: i16 = get(row, inst, "targets_hit")?;
    let active_order = match order_id {
        Some(_) => Some(order_from_row(row, inst)?),
        None => None,
    };

    Ok(Position {
        state: parse_enum(inst, &state, PositionState::parse)?,
        direction: direction
            .map(|d| parse_enum(inst, &d, Direction::parse))
            .transpose()?,
        quantity: from_decimal(inst, get(row, inst, "quantity")?)?,
        avg_entry_price: from_decimal_opt(inst, get(row, inst, "avg_entry_price")?)?,
        active_order,
        stop_loss: from_decimal_opt(inst, get(row, inst, "stop_loss")?)?,
        take_profit: from_decimal_opt(inst, get(row, inst, "take_profit")?)?,
        second_take_profit: from_decimal_opt(inst, get(row, inst, "second_take_profit")?)?,
        trailing_stop: from_decimal_opt(inst, get(row, inst, "trailing_stop")?)?,
        targets_hit: u8::try_from(targets_hit).map_err(|e| corrupt(inst, e))?,
        opened_at: get(row, inst, "opened_at")?,
        reconcile_required: get(row, inst, "reconcile_required")?,
        version: get(row, inst, "version")?,
        updated_at: get(row, inst, "updated_at")?,
        instrument,
    })
}

fn trade_from_row(row: &PgRow, instrument: &str) -> Result<ClosedTrade, StoreError> {
    let direction: String = get(row, instrument, "direction")?;
    let exit_reason: String = get(row, instrument, "exit_reason")?;
    Ok(ClosedTrade {
        id: get(row, instrument, "id")?,
        instrument: instrument.to_string(),
        direction: parse_enum(instrument, &direction, Direction::parse)?,
        quantity: from_decimal(instrument, get(row, instrument, "quantity")?)?,
        entry_price: from_decimal(instrument, get(row, instrument, "entry_price")?)?,
        exit_price: from_decimal(instrument, get(row, instrument, "exit_price")?)?,
        realized_pnl: from_decimal(instrument, get(row, instrument, "realized_pnl")?)?,
        exit_reason: parse_enum(instrument, &exit_reason, ExitReason::parse)?,
        opened_at: get(row, instrument, "opened_at")?,
        closed_at: get(row, instrument, "closed_at")?,
    })
}

async fn upsert_order(conn: &mut PgConnection, order: &Order) -> Result<(), StoreError> {
    let inst = order.instrument.as_str();
    sqlx::query(
        r#"
        INSERT INTO orders (
            id, broker_order_id, instrument, side, order_type, purpose,
            quantity, price, status, filled_quantity, avg_fill_price,
            exit_reason, reject_reason, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO UPDATE SET
            broker_order_id = EXCLUDED.broker_order_id,
            status = EXCLUDED.status,
            filled_quantity = EXCLUDED.filled_quantity,
            avg_fill_price = EXCLUDED.avg_fill_price,
            reject_reason = EXCLUDED.reject_reason,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(order.id)
    .bind(&order.broker_order_id)
    .bind(&order.instrument)
    .bind(order.side.as_str())
    .bind(order.order_type.as_str())
    .bind(order.purpose.as_str())
    .bind(to_decimal(inst, order.quantity)?)
    .bind(to_decimal(inst, order.price)?)
    .bind(order.status.as_str())
    .bind(to_decimal(inst, order.filled_quantity)?)
    .bind(to_decimal_opt(inst, order.avg_fill_price)?)
    .bind(order.exit_reason.map(|r| r.as_str()))
    .bind(&order.reject_reason)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_trade(conn: &mut PgConnection, trade: &ClosedTrade) -> Result<(), StoreError> {
    let inst = trade.instrument.as_str();
    sqlx::query(
        r#"
        INSERT INTO trades (
            id, instrument, direction, quantity, entry_price, exit_price,
            realized_pnl, exit_reason, opened_at, closed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(trade.id)
    .bind(&trade.instrument)
    .bind(trade.direction.as_str())
    .bind(to_decimal(inst, trade.quantity)?)
    .bind(to_decimal(inst, trade.entry_price)?)
    .bind(to_decimal(inst, trade.exit_price)?)
    .bind(to_decimal(inst, trade.realized_pnl)?)
    .bind(trade.exit_reason.as_str())
    .bind(trade.opened_at)
    .bind(trade.closed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl PositionStore for PostgresStore {
    async fn get(&self, instrument: &str) -> Result<Position, StoreError> {
        let query = format!("{} WHERE p.instrument = $1", POSITION_SELECT);
        let row = sqlx::query(&query)
            .bind(instrument)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => position_from_row(&row),
            None => Ok(Position::flat(instrument)),
        }
    }

    async fn compare_and_swap(
        &self,
        instrument: &str,
        expected: &Position,
        mut new: Position,
        trade: Option<&ClosedTrade>,
    ) -> Result<Position, StoreError> {
        new.instrument = instrument.to_string();
        new.version = expected.version + 1;
        new.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;

        if let Some(order) = &new.active_order {
            upsert_order(&mut *tx, order).await?;
        }

        let sql = if expected.version == 0 {
            r#"
            INSERT INTO positions (
                instrument, state, direction, quantity, avg_entry_price, active_order_id,
                stop_loss, take_profit, opened_at, reconcile_required, version, updated_at,
                second_take_profit, trailing_stop, targets_hit
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (instrument) DO NOTHING
            "#
        } else {
            r#"
            UPDATE positions SET
                state = $2, direction = $3, quantity = $4, avg_entry_price = $5,
                active_order_id = $6, stop_loss = $7, take_profit = $8, opened_at = $9,
                reconcile_required = $10, version = $11, updated_at = $12,
                second_take_profit = $13, trailing_stop = $14, targets_hit = $15
            WHERE instrument = $1 AND version = $11 - 1
            "#
        };

        let result = sqlx::query(sql)
            .bind(instrument)
            .bind(new.state.as_str())
            .bind(new.direction.map(|d| d.as_str()))
            .bind(to_decimal(instrument, new.quantity)?)
            .bind(to_decimal_opt(instrument, new.avg_entry_price)?)
            .bind(new.active_order.as_ref().map(|o| o.id))
            .bind(to_decimal_opt(instrument, new.stop_loss)?)
            .bind(to_decimal_opt(instrument, new.take_profit)?)
            .bind(new.opened_at)
            .bind(new.reconcile_required)
            .bind(new.version)
            .bind(new.updated_at)
            .bind(to_decimal_opt(instrument, new.second_take_profit)?)
            .bind(to_decimal_opt(instrument, new.trailing_stop)?)
            .bind(i16::from(new.targets_hit))
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            let found: Option<i64> =
                sqlx::query_scalar("SELECT version FROM positions WHERE instrument = $1")
                    .bind(instrument)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Err(ConflictError {
                instrument: instrument.to_string(),
                expected: expected.version,
                found: found.unwrap_or(0),
            }
            .into());
        }

        if let Some(trade) = trade {
            insert_trade(&mut *tx, trade).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            instrument = %instrument,
            version = new.version,
            state = new.state.as_str(),
            "Persisted position"
        );
        Ok(new)
    }

    async fn load_active(&self) -> Result<Vec<Position>, StoreError> {
        let query = format!(
            "{} WHERE p.state <> 'flat' OR p.reconcile_required ORDER BY p.instrument",
            POSITION_SELECT
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let positions = rows
            .iter()
            .map(position_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!("Loaded {} active positions from Postgres", positions.len());
        Ok(positions)
    }

    async fn count_open(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM positions WHERE state <> 'flat'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn count_stop_losses_since(&self, since: DateTime<Utc>) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trades WHERE exit_reason = 'stop_loss' AND closed_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }

    async fn order_history(&self, instrument: &str) -> Result<Vec<Order>, StoreError> {
        let query = format!(
            "{} WHERE o.instrument = $1 ORDER BY o.created_at ASC",
            ORDER_SELECT
        );
        let rows = sqlx::query(&query)
            .bind(instrument)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| order_from_row(row, instrument)).collect()
    }

    async fn closed_trades(&self, instrument: &str) -> Result<Vec<ClosedTrade>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, direction, quantity, entry_price, exit_price, realized_pnl,
                   exit_reason, opened_at, closed_at
            FROM trades
            WHERE instrument = $1
            ORDER BY closed_at ASC
            "#,
        )
        .bind(instrument)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| trade_from_row(row, instrument)).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_test_db() -> PostgresStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/breakout_bot_test".to_string());

        PostgresStore::connect(&database_url, 2)
            .await
            .expect("Failed to connect to test database")
    }

    async fn clear(db: &PostgresStore, instrument: &str) {
        sqlx::query("DELETE FROM positions WHERE instrument = $1")
            .bind(instrument)
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM trades WHERE instrument = $1")
            .bind(instrument)
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM orders WHERE instrument = $1")
            .bind(instrument)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    fn entry_order(instrument: &str) -> Order {
        Order::new(
            instrument,
            Side::Buy,
            OrderType::Market,
            660.0,
            0.15,
            OrderPurpose::Entry,
            Utc::now(),
        )
    }

    #[test]
    fn test_decimal_conversion() {
        let d = to_decimal("X", 0.1234).unwrap();
        assert!((from_decimal("X", d).unwrap() - 0.1234).abs() < 1e-12);
        assert!(to_decimal("X", f64::NAN).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_cas_roundtrip_with_active_order() {
        let db = get_test_db().await;
        let inst = "PG_TEST_CAS";
        clear(&db, inst).await;

        let current = db.get(inst).await.unwrap();
        assert_eq!(current.version, 0);

        let mut next = current.clone();
        next.state = PositionState::EntryPending;
        next.direction = Some(Direction::Long);
        next.active_order = Some(entry_order(inst));
        let stored = db.compare_and_swap(inst, &current, next, None).await.unwrap();
        assert_eq!(stored.version, 1);

        let loaded = db.get(inst).await.unwrap();
        assert_eq!(loaded.state, PositionState::EntryPending);
        assert_eq!(
            loaded.active_order.as_ref().map(|o| o.id),
            stored.active_order.as_ref().map(|o| o.id)
        );

        // Stale writer loses
        let err = db
            .compare_and_swap(inst, &current, current.clone(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        clear(&db, inst).await;
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_trade_written_with_flat_transition() {
        let db = get_test_db().await;
        let inst = "PG_TEST_TRADE";
        clear(&db, inst).await;

        let current = db.get(inst).await.unwrap();
        let mut open = current.clone();
        open.state = PositionState::Open;
        open.direction = Some(Direction::Long);
        open.quantity = 10.0;
        open.avg_entry_price = Some(1.0);
        open.opened_at = Some(Utc::now());
        open.targets_hit = 2;
        open.trailing_stop = Some(1.05);
        let open = db.compare_and_swap(inst, &current, open, None).await.unwrap();
        assert!(db.count_open().await.unwrap() >= 1);

        let loaded = db.get(inst).await.unwrap();
        assert_eq!(loaded.targets_hit, 2);
        assert!((loaded.trailing_stop.unwrap() - 1.05).abs() < 1e-9);

        let mut flat = open.clone();
        flat.reset_to_flat();
        let trade = ClosedTrade {
            id: Uuid::new_v4(),
            instrument: inst.to_string(),
            direction: Direction::Long,
            quantity: 10.0,
            entry_price: 1.0,
            exit_price: 0.97,
            realized_pnl: ClosedTrade::pnl(Direction::Long, 10.0, 1.0, 0.97),
            exit_reason: ExitReason::StopLoss,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        };
        db.compare_and_swap(inst, &open, flat, Some(&trade))
            .await
            .unwrap();

        let trades = db.closed_trades(inst).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
        assert!(db.get(inst).await.unwrap().is_flat());

        clear(&db, inst).await;
    }
}
