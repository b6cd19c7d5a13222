use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

use super::types::{
    Credential, CredentialFilter, CredentialPatch, CredentialSummary, ExecutionRecord,
    NewCredential,
};
use super::vault::{Vault, VaultError};
use crate::exchange::{ApiKeys, Venue};
use crate::trading::executor::ExecutionReport;

/// Opens (or creates) the SQLite database and runs migrations.
/// Panics on failure. Called once at startup.
pub fn init_db(path: &str) -> Connection {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).expect("failed to create data directory");
    }
    let conn = Connection::open(path).expect("failed to open SQLite DB");
    migrate(&conn).expect("failed to create tables");
    tracing::info!("SQLite DB initialized at {path}");
    conn
}

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Enable foreign keys for CASCADE deletes on executions/snapshots
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credentials (
            id            TEXT PRIMARY KEY,
            label         TEXT NOT NULL UNIQUE,
            exchange      TEXT NOT NULL,
            api_key_hint  TEXT NOT NULL,
            sealed        TEXT NOT NULL,
            invested      TEXT,
            enabled       INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS executions (
            id             TEXT PRIMARY KEY,
            credential_id  TEXT NOT NULL,
            label          TEXT NOT NULL,
            venue          TEXT NOT NULL,
            source         TEXT NOT NULL,
            action         TEXT NOT NULL,
            status         TEXT NOT NULL,
            order_ids      TEXT NOT NULL,
            quantity       TEXT,
            quote_amount   TEXT,
            redeemed       TEXT,
            detail         TEXT,
            created_at     TEXT NOT NULL,
            FOREIGN KEY (credential_id) REFERENCES credentials(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS executions_by_credential
            ON executions (credential_id, created_at);

        CREATE TABLE IF NOT EXISTS snapshots (
            credential_id  TEXT NOT NULL,
            total_value    TEXT NOT NULL,
            created_at     TEXT NOT NULL,
            FOREIGN KEY (credential_id) REFERENCES credentials(id) ON DELETE CASCADE
        )",
    )
}

/// Typed error for credential operations that need specific HTTP status codes.
#[derive(Debug)]
pub enum StoreError {
    NotFound,
    DuplicateLabel,
    Vault(VaultError),
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        // Detect UNIQUE constraint violation for duplicate labels
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
                return StoreError::DuplicateLabel;
            }
        }
        StoreError::Db(e)
    }
}

impl From<VaultError> for StoreError {
    fn from(e: VaultError) -> Self {
        StoreError::Vault(e)
    }
}

fn parse_opt_decimal(raw: Option<String>) -> Option<Decimal> {
    raw.and_then(|s| Decimal::from_str(&s).ok())
}

const SUMMARY_COLUMNS: &str = "id, label, exchange, api_key_hint, invested, enabled, created_at";

fn summary_from_row(row: &rusqlite::Row<'_>) -> Result<CredentialSummary, rusqlite::Error> {
    let exchange: String = row.get(2)?;
    let exchange = Venue::from_str(&exchange).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(CredentialSummary {
        id: row.get(0)?,
        label: row.get(1)?,
        exchange,
        api_key_hint: row.get(3)?,
        invested: parse_opt_decimal(row.get(4)?),
        enabled: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn create_credential(
    conn: &Connection,
    vault: &Vault,
    new: &NewCredential,
) -> Result<CredentialSummary, StoreError> {
    let keys = ApiKeys {
        api_key: new.api_key.trim().to_string(),
        api_secret: new.api_secret.trim().to_string(),
    };
    let plaintext = serde_json::to_string(&keys).map_err(|_| VaultError::Corrupt)?;
    let sealed = vault.seal(&plaintext)?;

    let summary = CredentialSummary {
        id: uuid::Uuid::new_v4().to_string(),
        label: new.label.trim().to_string(),
        exchange: new.exchange,
        api_key_hint: keys.hint(),
        invested: new.invested,
        enabled: true,
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    conn.execute(
        "INSERT INTO credentials (id, label, exchange, api_key_hint, sealed, invested, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
        rusqlite::params![
            summary.id,
            summary.label,
            summary.exchange.as_str(),
            summary.api_key_hint,
            sealed,
            summary.invested.map(|d| d.to_string()),
            summary.created_at,
        ],
    )?;

    Ok(summary)
}

pub fn list_credentials(conn: &Connection) -> Result<Vec<CredentialSummary>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM credentials ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([], summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_credentials(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
    Ok(n as u64)
}

fn open_keys(vault: &Vault, sealed: &str) -> Result<ApiKeys, StoreError> {
    let plain = vault.open(sealed)?;
    serde_json::from_str(&plain).map_err(|_| StoreError::Vault(VaultError::Corrupt))
}

/// Returns the credential with decrypted keys. NotFound if the id is unknown.
pub fn load_credential(
    conn: &Connection,
    vault: &Vault,
    id: &str,
) -> Result<Credential, StoreError> {
    let (summary, sealed) = conn
        .query_row(
            &format!("SELECT {SUMMARY_COLUMNS}, sealed FROM credentials WHERE id = ?1"),
            rusqlite::params![id],
            |row| Ok((summary_from_row(row)?, row.get::<_, String>(7)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Db(other),
        })?;
    let keys = open_keys(vault, &sealed)?;
    Ok(Credential { summary, keys })
}

/// All enabled credential sets matching `filter`, keys decrypted. Sets whose
/// secrets no longer open are logged and left out.
pub fn load_enabled_credentials(
    conn: &Connection,
    vault: &Vault,
    filter: &CredentialFilter,
) -> Result<Vec<Credential>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS}, sealed FROM credentials
         WHERE enabled = 1
           AND (exchange = ?1 OR ?1 = '')
           AND (label = ?2 OR ?2 = '')
         ORDER BY created_at"
    ))?;
    let exchange = filter.exchange.map(|v| v.as_str()).unwrap_or("");
    let label = filter.label.as_deref().unwrap_or("");
    let rows = stmt
        .query_map(rusqlite::params![exchange, label], |row| {
            Ok((summary_from_row(row)?, row.get::<_, String>(7)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (summary, sealed) in rows {
        match open_keys(vault, &sealed) {
            Ok(keys) => out.push(Credential { summary, keys }),
            Err(_) => tracing::error!(
                "credential '{}' could not be decrypted (VAULT_KEY changed?), skipping",
                summary.label
            ),
        }
    }
    Ok(out)
}

pub fn update_credential(
    conn: &Connection,
    id: &str,
    patch: &CredentialPatch,
) -> Result<CredentialSummary, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let exists: bool = tx
        .query_row(
            "SELECT 1 FROM credentials WHERE id = ?1",
            rusqlite::params![id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !exists {
        return Err(StoreError::NotFound);
    }

    if let Some(label) = &patch.label {
        tx.execute(
            "UPDATE credentials SET label = ?1 WHERE id = ?2",
            rusqlite::params![label.trim(), id],
        )?;
    }
    if let Some(enabled) = patch.enabled {
        tx.execute(
            "UPDATE credentials SET enabled = ?1 WHERE id = ?2",
            rusqlite::params![enabled, id],
        )?;
    }
    if patch.clear_invested {
        tx.execute(
            "UPDATE credentials SET invested = NULL WHERE id = ?1",
            rusqlite::params![id],
        )?;
    } else if let Some(invested) = patch.invested {
        tx.execute(
            "UPDATE credentials SET invested = ?1 WHERE id = ?2",
            rusqlite::params![invested.to_string(), id],
        )?;
    }

    let summary = tx.query_row(
        &format!("SELECT {SUMMARY_COLUMNS} FROM credentials WHERE id = ?1"),
        rusqlite::params![id],
        summary_from_row,
    )?;
    tx.commit()?;
    Ok(summary)
}

pub fn delete_credential(conn: &Connection, id: &str) -> Result<(), StoreError> {
    let changed = conn.execute(
        "DELETE FROM credentials WHERE id = ?1",
        rusqlite::params![id],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

pub fn record_execution(
    conn: &Connection,
    report: &ExecutionReport,
    source: &str,
) -> Result<String, rusqlite::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let action = serde_json::to_string(&report.action).unwrap_or_else(|_| "{}".into());
    let order_ids = serde_json::to_string(&report.order_ids).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO executions (id, credential_id, label, venue, source, action, status, order_ids,
                                 quantity, quote_amount, redeemed, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            id,
            report.credential_id,
            report.label,
            report.venue.as_str(),
            source,
            action,
            report.status.as_str(),
            order_ids,
            report.quantity.map(|d| d.to_string()),
            report.quote_amount.map(|d| d.to_string()),
            report.redeemed.map(|d| d.to_string()),
            report.detail,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

/// Newest first. Returns the page and the total row count for the filter.
pub fn list_executions(
    conn: &Connection,
    credential_id: Option<&str>,
    limit: u32,
    offset: u32,
) -> Result<(Vec<ExecutionRecord>, u64), rusqlite::Error> {
    let filter = credential_id.unwrap_or("");
    let mut stmt = conn.prepare(
        "SELECT id, credential_id, label, venue, source, action, status, order_ids,
                quantity, quote_amount, redeemed, detail, created_at
         FROM executions
         WHERE (credential_id = ?1 OR ?1 = '')
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![filter, limit, offset], |row| {
            let action: String = row.get(5)?;
            let order_ids: String = row.get(7)?;
            Ok(ExecutionRecord {
                id: row.get(0)?,
                credential_id: row.get(1)?,
                label: row.get(2)?,
                venue: row.get(3)?,
                source: row.get(4)?,
                action: serde_json::from_str(&action).unwrap_or(serde_json::Value::Null),
                status: row.get(6)?,
                order_ids: serde_json::from_str(&order_ids).unwrap_or_default(),
                quantity: row.get(8)?,
                quote_amount: row.get(9)?,
                redeemed: row.get(10)?,
                detail: row.get(11)?,
                created_at: row.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM executions WHERE (credential_id = ?1 OR ?1 = '')",
        rusqlite::params![filter],
        |row| row.get(0),
    )?;

    Ok((rows, total as u64))
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

pub fn record_snapshot(
    conn: &Connection,
    credential_id: &str,
    total_value: Decimal,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO snapshots (credential_id, total_value, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            credential_id,
            total_value.to_string(),
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Most recent stored total for the credential, if any.
pub fn previous_snapshot(
    conn: &Connection,
    credential_id: &str,
) -> Result<Option<Decimal>, rusqlite::Error> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT total_value FROM snapshots WHERE credential_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            rusqlite::params![credential_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(parse_opt_decimal(raw))
}
