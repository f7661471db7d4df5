use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;

// Seeds the catalog with "SKU:STOCK" pairs, e.g. INITIAL_STOCK="A1:10,B2:25".
fn parse_seed(entry: &str) -> Result<(String, i64)> {
    let (sku, stock) = entry
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid seed entry: {entry}"))?;
    let sku = sku.trim();
    if sku.is_empty() {
        return Err(anyhow!("invalid seed entry: {entry}"));
    }
    let stock: i64 = stock
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid stock in seed entry: {entry}"))?;
    if stock < 0 {
        return Err(anyhow!("negative stock in seed entry: {entry}"));
    }
    Ok((sku.to_string(), stock))
}

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = env_required("DATABASE_URL")?;
    let acquire = env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30).max(5);
    let seeds = env_list("INITIAL_STOCK", &[]);

    let db = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(acquire))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            sku TEXT PRIMARY KEY,
            stock BIGINT NOT NULL CHECK (stock >= 0),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&db)
    .await
    .context("create products table")?;

    for entry in &seeds {
        let (sku, stock) = parse_seed(entry)?;
        sqlx::query(
            "INSERT INTO products (sku, stock) VALUES ($1, $2) \
             ON CONFLICT (sku) DO UPDATE SET stock = EXCLUDED.stock, updated_at = NOW()",
        )
        .bind(&sku)
        .bind(stock)
        .execute(&db)
        .await
        .with_context(|| format!("seed product {sku}"))?;
        println!("seeded {sku} stock={stock}");
    }

    println!("catalog schema ready ({} products seeded)", seeds.len());
    Ok(())
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => {
            let parts: Vec<String> = v
                .split(',')
                .map(|s| s.trim().trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                default.iter().map(|s| (*s).to_string()).collect()
            } else {
                parts
            }
        }
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
