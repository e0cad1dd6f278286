/*!
 * STORE DURABLE - Cible des flushs du BatchWriter
 *
 * RÔLE :
 * Le trait `WriteStore` reçoit un lot déjà groupé par (table, opération) et
 * doit l'appliquer de façon atomique : soit tout le lot est committé, soit
 * rien. `SqliteStore` est l'implémentation de production (sqlx + SQLite).
 *
 * SÉCURITÉ :
 * Les noms de tables et de colonnes viennent du code d'ingestion mais sont
 * tout de même validés comme identifiants SQL avant interpolation ; les
 * valeurs passent toujours par des paramètres liés.
 *
 * COMPTEURS 64 BITS :
 * SQLite ne stocke que des entiers signés. Un entier JSON au-delà de
 * `i64::MAX` est lié avec ses bits inchangés (`u as i64`, donc négatif en
 * base) ; relire la colonne en `i64` puis `as u64` restitue la valeur exacte.
 */

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use std::str::FromStr;
use tracing::info;

use super::WriteOp;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid payload for {table}: {reason}")]
    InvalidPayload { table: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Écritures d'une même (table, opération), dans l'ordre d'arrivée
#[derive(Debug, Clone)]
pub struct WriteGroup {
    pub table: String,
    pub op: WriteOp,
    pub rows: Vec<Value>,
}

#[async_trait]
pub trait WriteStore: Send + Sync {
    /// Applique tous les groupes dans une seule transaction
    async fn commit(&self, groups: &[WriteGroup]) -> Result<(), StoreError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ping_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        status TEXT NOT NULL,
        latency REAL,
        packet_loss REAL NOT NULL,
        timestamp TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ping_history_device ON ping_history (device_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS interface_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        if_index INTEGER NOT NULL,
        if_name TEXT NOT NULL,
        oper_status TEXT NOT NULL,
        admin_status TEXT,
        speed_mbps REAL,
        in_octets INTEGER,
        out_octets INTEGER,
        in_errors INTEGER,
        out_errors INTEGER,
        in_discards INTEGER,
        out_discards INTEGER,
        timestamp TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_interface_history_device ON interface_history (device_id, if_index, timestamp)",
    "CREATE TABLE IF NOT EXISTS interface_status (
        device_id TEXT NOT NULL,
        if_index INTEGER NOT NULL,
        if_name TEXT NOT NULL,
        oper_status TEXT NOT NULL,
        speed_mbps REAL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (device_id, if_index)
    )",
    "CREATE TABLE IF NOT EXISTS wireless_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        interface TEXT,
        signal REAL,
        noise_floor REAL,
        tx_rate REAL,
        rx_rate REAL,
        timestamp TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS flapping_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        if_index INTEGER NOT NULL,
        if_name TEXT NOT NULL,
        from_status TEXT NOT NULL,
        to_status TEXT NOT NULL,
        from_speed REAL,
        to_speed REAL,
        transitions INTEGER NOT NULL,
        timestamp TEXT NOT NULL
    )",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Ouvre (ou crée) la base puis applique le schéma
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // une base mémoire n'existe que sur sa connexion : pool d'une seule connexion, jamais recyclée
        let pool_options = if in_memory {
            SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("[store] sqlite ready at {url}");
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl WriteStore for SqliteStore {
    async fn commit(&self, groups: &[WriteGroup]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for group in groups {
            validate_identifier(&group.table)?;
            for row in &group.rows {
                let object = row.as_object().ok_or_else(|| StoreError::InvalidPayload {
                    table: group.table.clone(),
                    reason: "row is not a JSON object".into(),
                })?;
                let sql = build_statement(group.op, &group.table, object)?;
                let mut query = sqlx::query(&sql);
                for value in object.values() {
                    query = bind_value(query, value);
                }
                query.execute(&mut *tx).await?;
            }
        }
        // rollback implicite au drop si une erreur est remontée avant
        tx.commit().await?;
        Ok(())
    }
}

fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn build_statement(op: WriteOp, table: &str, row: &Map<String, Value>) -> Result<String, StoreError> {
    if row.is_empty() {
        return Err(StoreError::InvalidPayload { table: table.to_string(), reason: "empty row".into() });
    }
    for column in row.keys() {
        validate_identifier(column)?;
    }
    let verb = match op {
        WriteOp::Insert => "INSERT INTO",
        WriteOp::Upsert => "INSERT OR REPLACE INTO",
    };
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(format!("{verb} {table} ({}) VALUES ({placeholders})", columns.join(", ")))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => query.bind(i),
            (None, Some(u)) => query.bind(u as i64),
            (None, None) => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}
