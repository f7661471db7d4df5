use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};

use crate::state::AppState;

/// Authoritative product record in the durable catalog.
#[derive(Debug, Clone)]
pub(crate) struct CatalogProduct {
    pub(crate) sku: String,
    pub(crate) stock: i64,
    pub(crate) updated_at: DateTime<Utc>,
}

/// The service owns only the minimal products table it reconciles against.
pub(crate) async fn ensure_schema(db: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            sku TEXT PRIMARY KEY,
            stock BIGINT NOT NULL CHECK (stock >= 0),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(db)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_sku(
    state: &AppState,
    sku: &str,
) -> Result<Option<CatalogProduct>, sqlx::Error> {
    let row = sqlx::query("SELECT sku, stock, updated_at FROM products WHERE sku = $1")
        .bind(sku)
        .fetch_optional(&state.db)
        .await?;
    Ok(row.map(|r| CatalogProduct {
        sku: r.get("sku"),
        stock: r.get("stock"),
        updated_at: r.get("updated_at"),
    }))
}

/// Persist the settled stock level. Returns false when the product row has
/// vanished from the catalog since it was seeded.
pub(crate) async fn save_stock(
    state: &AppState,
    sku: &str,
    stock: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE products SET stock = $2, updated_at = NOW() WHERE sku = $1")
        .bind(sku)
        .bind(stock)
        .execute(&state.db)
        .await?;
    Ok(result.rows_affected() > 0)
}
