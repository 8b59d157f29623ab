// Copyright (c) 2024 The Botho Foundation

//! SQLite donation ledger.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result as SqliteResult};
use ton_donate_core::{DonationIntent, LedgerFacts, Streamer, Widget};

use crate::ledger::{check_new_intent, stored_value, DonationLedger, LedgerError, MAX_STORED_VALUE};

const INTENT_COLUMNS: &str = "signature, streamer_id, wallet_address, declared_amount, \
     nickname, message, verified, acknowledged, ledger_tx_hash, ledger_seq, amount, \
     created_at, updated_at";

const WIDGET_COLUMNS: &str =
    "widget_id, streamer_id, widget_type, amount_goal, is_active, created_at";

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                LedgerError::Duplicate(e.to_string())
            }
            _ => LedgerError::Storage(e.to_string()),
        }
    }
}

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database.
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)
            .map_err(|e| LedgerError::Storage(format!("Failed to open database: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            LedgerError::Storage(format!("Failed to open in-memory database: {}", e))
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations.
    pub fn migrate(&self) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS streamers (
                streamer_id TEXT PRIMARY KEY,
                wallet_address TEXT NOT NULL UNIQUE,
                cognito_id TEXT
            );

            CREATE TABLE IF NOT EXISTS donations (
                signature TEXT PRIMARY KEY,
                streamer_id TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                declared_amount INTEGER,
                nickname TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL DEFAULT '',
                verified INTEGER NOT NULL DEFAULT 0,
                acknowledged INTEGER NOT NULL DEFAULT 0,
                ledger_tx_hash TEXT,
                ledger_seq INTEGER,
                amount INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK (acknowledged = 0 OR verified = 1)
            );

            CREATE INDEX IF NOT EXISTS idx_donations_streamer ON donations(streamer_id);
            CREATE INDEX IF NOT EXISTS idx_donations_wallet ON donations(wallet_address);

            CREATE TABLE IF NOT EXISTS widgets (
                widget_id TEXT PRIMARY KEY,
                streamer_id TEXT NOT NULL,
                widget_type TEXT NOT NULL,
                amount_goal INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_widgets_streamer ON widgets(streamer_id);

            CREATE TABLE IF NOT EXISTS widget_totals (
                streamer_id TEXT PRIMARY KEY,
                amount_current INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| LedgerError::Storage(format!("Migration failed: {}", e)))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Storage(format!("Lock error: {}", e)))
    }

    /// Convert a database row to a DonationIntent.
    fn row_to_intent(row: &rusqlite::Row<'_>) -> SqliteResult<DonationIntent> {
        let declared_amount: Option<i64> = row.get(3)?;
        let ledger_seq: Option<i64> = row.get(9)?;
        let amount: Option<i64> = row.get(10)?;

        Ok(DonationIntent {
            signature: row.get(0)?,
            streamer_id: row.get(1)?,
            wallet_address: row.get(2)?,
            declared_amount: declared_amount.map(|a| a as u64),
            nickname: row.get(4)?,
            message: row.get(5)?,
            verified: row.get(6)?,
            acknowledged: row.get(7)?,
            ledger_tx_hash: row.get(8)?,
            ledger_seq: ledger_seq.map(|s| s as u64),
            amount: amount.map(|a| a as u64),
            created_at: from_timestamp(row.get(11)?),
            updated_at: from_timestamp(row.get(12)?),
        })
    }

    fn row_to_widget(row: &rusqlite::Row<'_>) -> SqliteResult<Widget> {
        let amount_goal: i64 = row.get(3)?;

        Ok(Widget {
            widget_id: row.get(0)?,
            streamer_id: row.get(1)?,
            widget_type: row.get(2)?,
            amount_goal: amount_goal as u64,
            is_active: row.get(4)?,
            created_at: from_timestamp(row.get(5)?),
        })
    }
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl DonationLedger for Database {
    fn find_by_signature(&self, signature: &str) -> Result<Option<DonationIntent>, LedgerError> {
        let conn = self.lock()?;

        let intent = conn
            .query_row(
                &format!("SELECT {} FROM donations WHERE signature = ?1", INTENT_COLUMNS),
                params![signature],
                Self::row_to_intent,
            )
            .optional()?;

        Ok(intent)
    }

    fn find_by_wallet(&self, wallet: &str) -> Result<Option<DonationIntent>, LedgerError> {
        let conn = self.lock()?;

        let intent = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM donations
                    WHERE wallet_address = ?1 AND streamer_id != ''
                    ORDER BY updated_at DESC, rowid DESC
                    LIMIT 1
                    "#,
                    INTENT_COLUMNS
                ),
                params![wallet],
                Self::row_to_intent,
            )
            .optional()?;

        Ok(intent)
    }

    fn find_streamer_by_wallet(&self, wallet: &str) -> Result<Option<String>, LedgerError> {
        let conn = self.lock()?;

        let streamer_id = conn
            .query_row(
                "SELECT streamer_id FROM streamers WHERE wallet_address = ?1",
                params![wallet],
                |row| row.get(0),
            )
            .optional()?;

        Ok(streamer_id)
    }

    fn upsert_merge(
        &self,
        signature: &str,
        facts: &LedgerFacts,
    ) -> Result<DonationIntent, LedgerError> {
        let amount = stored_value("amount", facts.amount)?;
        let ledger_seq = stored_value("ledger sequence", facts.ledger_seq)?;
        let conn = self.lock()?;

        // Single statement: the merge is atomic per signature and keeps the
        // same rules as DonationIntent::merge.
        let intent = conn.query_row(
            &format!(
                r#"
                INSERT INTO donations (
                    signature, streamer_id, wallet_address, declared_amount, nickname,
                    message, verified, acknowledged, ledger_tx_hash, ledger_seq, amount,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, NULL, '', ?4, 1, 0, ?5, ?6, ?7, ?8, ?8)
                ON CONFLICT(signature) DO UPDATE SET
                    streamer_id = excluded.streamer_id,
                    wallet_address = CASE
                        WHEN excluded.wallet_address = '' THEN donations.wallet_address
                        ELSE excluded.wallet_address
                    END,
                    message = CASE
                        WHEN donations.message = '' THEN excluded.message
                        ELSE donations.message
                    END,
                    verified = 1,
                    ledger_tx_hash = excluded.ledger_tx_hash,
                    ledger_seq = excluded.ledger_seq,
                    amount = excluded.amount,
                    updated_at = excluded.updated_at
                RETURNING {}
                "#,
                INTENT_COLUMNS
            ),
            params![
                signature,
                facts.streamer_id,
                facts.wallet_address,
                facts.message,
                facts.tx_hash,
                ledger_seq,
                amount,
                Utc::now().timestamp(),
            ],
            Self::row_to_intent,
        )?;

        Ok(intent)
    }

    fn set_acknowledged(&self, signature: &str) -> Result<bool, LedgerError> {
        let conn = self.lock()?;

        let changed = conn.execute(
            r#"
            UPDATE donations
            SET acknowledged = 1, updated_at = ?2
            WHERE signature = ?1 AND verified = 1 AND acknowledged = 0
            "#,
            params![signature, Utc::now().timestamp()],
        )?;

        Ok(changed == 1)
    }

    fn increment_widget_total(&self, streamer_id: &str, amount: u64) -> Result<u64, LedgerError> {
        let amount = stored_value("amount", amount)?;
        let conn = self.lock()?;

        let total: i64 = conn.query_row(
            r#"
            INSERT INTO widget_totals (streamer_id, amount_current, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(streamer_id) DO UPDATE SET
                amount_current = CASE
                    WHEN amount_current > ?4 - excluded.amount_current THEN ?4
                    ELSE amount_current + excluded.amount_current
                END,
                updated_at = excluded.updated_at
            RETURNING amount_current
            "#,
            params![
                streamer_id,
                amount,
                Utc::now().timestamp(),
                MAX_STORED_VALUE as i64
            ],
            |row| row.get(0),
        )?;

        Ok(total as u64)
    }

    fn widget_total(&self, streamer_id: &str) -> Result<u64, LedgerError> {
        let conn = self.lock()?;

        let total: Option<i64> = conn
            .query_row(
                "SELECT amount_current FROM widget_totals WHERE streamer_id = ?1",
                params![streamer_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(total.unwrap_or(0) as u64)
    }

    fn register_streamer(&self, streamer: &Streamer) -> Result<(), LedgerError> {
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO streamers (streamer_id, wallet_address, cognito_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(streamer_id) DO UPDATE SET
                wallet_address = excluded.wallet_address,
                cognito_id = excluded.cognito_id
            "#,
            params![
                streamer.streamer_id,
                streamer.wallet_address,
                streamer.cognito_id
            ],
        )?;

        Ok(())
    }

    fn create_intent(&self, intent: &DonationIntent) -> Result<(), LedgerError> {
        check_new_intent(intent)?;
        if self.find_by_signature(&intent.signature)?.is_some() {
            return Err(LedgerError::Duplicate(format!(
                "signature {}",
                intent.signature
            )));
        }

        let declared_amount = intent
            .declared_amount
            .map(|a| stored_value("declared amount", a))
            .transpose()?;
        let conn = self.lock()?;

        // The primary key still backs the lookup above against a concurrent
        // submission of the same signature.
        conn.execute(
            &format!(
                "INSERT INTO donations ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, NULL, NULL, NULL, ?7, ?7)",
                INTENT_COLUMNS
            ),
            params![
                intent.signature,
                intent.streamer_id,
                intent.wallet_address,
                declared_amount,
                intent.nickname,
                intent.message,
                intent.created_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    fn list_donations(&self, streamer_id: &str) -> Result<Vec<DonationIntent>, LedgerError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM donations WHERE streamer_id = ?1 ORDER BY created_at DESC, rowid DESC",
            INTENT_COLUMNS
        ))?;

        let donations = stmt
            .query_map(params![streamer_id], Self::row_to_intent)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(donations)
    }

    fn create_widget(&self, widget: &Widget) -> Result<(), LedgerError> {
        let amount_goal = stored_value("amount goal", widget.amount_goal)?;
        let conn = self.lock()?;

        conn.execute(
            &format!(
                "INSERT INTO widgets ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                WIDGET_COLUMNS
            ),
            params![
                widget.widget_id,
                widget.streamer_id,
                widget.widget_type,
                amount_goal,
                widget.is_active,
                widget.created_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    fn list_widgets(&self, streamer_id: &str) -> Result<Vec<Widget>, LedgerError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM widgets WHERE streamer_id = ?1 ORDER BY created_at, rowid",
            WIDGET_COLUMNS
        ))?;

        let widgets = stmt
            .query_map(params![streamer_id], Self::row_to_widget)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(widgets)
    }
}
