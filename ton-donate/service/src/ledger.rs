// Copyright (c) 2024 The Botho Foundation

//! Donation ledger storage interface.
//!
//! All reads and writes the watcher performs against persistent storage go
//! through [`DonationLedger`]. Every mutation is either an idempotent
//! upsert/set keyed by a unique column or an atomic increment, so repeating
//! a poll cycle never duplicates records or credits.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use ton_donate_core::{DonationIntent, LedgerFacts, Streamer, Widget};

/// Storage errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A record with the same unique key already exists
    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistent donation state.
pub trait DonationLedger: Send + Sync {
    /// Look up an intent by its correlation signature.
    fn find_by_signature(&self, signature: &str) -> Result<Option<DonationIntent>, LedgerError>;

    /// Most recently updated intent paying `wallet`.
    fn find_by_wallet(&self, wallet: &str) -> Result<Option<DonationIntent>, LedgerError>;

    /// Streamer registered for `wallet`.
    fn find_streamer_by_wallet(&self, wallet: &str) -> Result<Option<String>, LedgerError>;

    /// Merge ledger facts into the intent for `signature`, creating it if
    /// absent, and mark it verified. Atomic per signature.
    fn upsert_merge(
        &self,
        signature: &str,
        facts: &LedgerFacts,
    ) -> Result<DonationIntent, LedgerError>;

    /// Mark a verified intent acknowledged.
    ///
    /// Returns `true` only for the call that performed the transition.
    fn set_acknowledged(&self, signature: &str) -> Result<bool, LedgerError>;

    /// Atomically add `amount` to the streamer's widget total, returning the
    /// new total.
    fn increment_widget_total(&self, streamer_id: &str, amount: u64) -> Result<u64, LedgerError>;

    fn widget_total(&self, streamer_id: &str) -> Result<u64, LedgerError>;

    /// Register a streamer, or update the one with the same id.
    fn register_streamer(&self, streamer: &Streamer) -> Result<(), LedgerError>;

    /// Record a new intent. Fails with [`LedgerError::Duplicate`] if the
    /// signature was already used.
    fn create_intent(&self, intent: &DonationIntent) -> Result<(), LedgerError>;

    fn list_donations(&self, streamer_id: &str) -> Result<Vec<DonationIntent>, LedgerError>;

    fn create_widget(&self, widget: &Widget) -> Result<(), LedgerError>;

    fn list_widgets(&self, streamer_id: &str) -> Result<Vec<Widget>, LedgerError>;
}

/// Largest amount, total or ledger sequence a ledger stores. SQLite
/// integers are signed 64-bit.
pub const MAX_STORED_VALUE: u64 = i64::MAX as u64;

/// Convert a value to its stored form.
pub(crate) fn stored_value(what: &str, value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value)
        .map_err(|_| LedgerError::Invalid(format!("{} {} is out of range", what, value)))
}

/// Check an intent before it is recorded.
pub(crate) fn check_new_intent(intent: &DonationIntent) -> Result<(), LedgerError> {
    if intent.signature.trim().is_empty() {
        return Err(LedgerError::Invalid("signature is empty".to_string()));
    }
    if intent.streamer_id.is_empty() {
        return Err(LedgerError::Invalid("streamer id is empty".to_string()));
    }
    if intent.verified || intent.acknowledged {
        return Err(LedgerError::Invalid(
            "new intents must be unverified".to_string(),
        ));
    }
    if let Some(amount) = intent.declared_amount {
        stored_value("declared amount", amount)?;
    }
    Ok(())
}

#[derive(Default)]
struct MemoryState {
    intents: HashMap<String, DonationIntent>,
    streamers: HashMap<String, Streamer>,
    widgets: Vec<Widget>,
    totals: HashMap<String, u64>,
}

/// In-process ledger.
///
/// A single mutex guards all state, which makes every operation atomic.
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, LedgerError> {
        self.state
            .lock()
            .map_err(|e| LedgerError::Storage(format!("Lock error: {}", e)))
    }
}

impl DonationLedger for MemoryLedger {
    fn find_by_signature(&self, signature: &str) -> Result<Option<DonationIntent>, LedgerError> {
        Ok(self.lock()?.intents.get(signature).cloned())
    }

    fn find_by_wallet(&self, wallet: &str) -> Result<Option<DonationIntent>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .intents
            .values()
            .filter(|i| i.wallet_address == wallet && !i.streamer_id.is_empty())
            .max_by_key(|i| i.updated_at)
            .cloned())
    }

    fn find_streamer_by_wallet(&self, wallet: &str) -> Result<Option<String>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .streamers
            .values()
            .find(|s| s.wallet_address == wallet)
            .map(|s| s.streamer_id.clone()))
    }

    fn upsert_merge(
        &self,
        signature: &str,
        facts: &LedgerFacts,
    ) -> Result<DonationIntent, LedgerError> {
        stored_value("amount", facts.amount)?;
        stored_value("ledger sequence", facts.ledger_seq)?;
        let mut state = self.lock()?;
        let intent = state
            .intents
            .entry(signature.to_string())
            .and_modify(|i| i.merge(facts))
            .or_insert_with(|| DonationIntent::from_facts(signature, facts));
        Ok(intent.clone())
    }

    fn set_acknowledged(&self, signature: &str) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        match state.intents.get_mut(signature) {
            Some(intent) if intent.verified && !intent.acknowledged => {
                intent.acknowledged = true;
                intent.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn increment_widget_total(&self, streamer_id: &str, amount: u64) -> Result<u64, LedgerError> {
        stored_value("amount", amount)?;
        let mut state = self.lock()?;
        let total = state.totals.entry(streamer_id.to_string()).or_insert(0);
        *total = total.saturating_add(amount).min(MAX_STORED_VALUE);
        Ok(*total)
    }

    fn widget_total(&self, streamer_id: &str) -> Result<u64, LedgerError> {
        Ok(self.lock()?.totals.get(streamer_id).copied().unwrap_or(0))
    }

    fn register_streamer(&self, streamer: &Streamer) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let taken = state.streamers.values().any(|s| {
            s.wallet_address == streamer.wallet_address && s.streamer_id != streamer.streamer_id
        });
        if taken {
            return Err(LedgerError::Duplicate(format!(
                "wallet {}",
                streamer.wallet_address
            )));
        }
        state
            .streamers
            .insert(streamer.streamer_id.clone(), streamer.clone());
        Ok(())
    }

    fn create_intent(&self, intent: &DonationIntent) -> Result<(), LedgerError> {
        check_new_intent(intent)?;
        let mut state = self.lock()?;
        if state.intents.contains_key(&intent.signature) {
            return Err(LedgerError::Duplicate(format!(
                "signature {}",
                intent.signature
            )));
        }
        state
            .intents
            .insert(intent.signature.clone(), intent.clone());
        Ok(())
    }

    fn list_donations(&self, streamer_id: &str) -> Result<Vec<DonationIntent>, LedgerError> {
        let state = self.lock()?;
        let mut donations: Vec<_> = state
            .intents
            .values()
            .filter(|i| i.streamer_id == streamer_id)
            .cloned()
            .collect();
        donations.sort_by_key(|i| std::cmp::Reverse(i.created_at));
        Ok(donations)
    }

    fn create_widget(&self, widget: &Widget) -> Result<(), LedgerError> {
        stored_value("amount goal", widget.amount_goal)?;
        let mut state = self.lock()?;
        if state.widgets.iter().any(|w| w.widget_id == widget.widget_id) {
            return Err(LedgerError::Duplicate(format!("widget {}", widget.widget_id)));
        }
        state.widgets.push(widget.clone());
        Ok(())
    }

    fn list_widgets(&self, streamer_id: &str) -> Result<Vec<Widget>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .widgets
            .iter()
            .filter(|w| w.streamer_id == streamer_id)
            .cloned()
            .collect())
    }
}
