// Copyright (c) 2024 The Botho Foundation

//! Donation intents, streamers and widgets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::LedgerEvent;

/// A donation as declared by the donor before paying, later confirmed by
/// the ledger.
///
/// Created by the submission flow; after creation only the correlation
/// engine changes it, through [`DonationIntent::merge`] and the
/// acknowledged flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationIntent {
    /// Client-supplied correlation key, unique across all intents
    pub signature: String,

    pub streamer_id: String,

    /// Streamer wallet the payment targets
    pub wallet_address: String,

    /// Amount the donor declared, in nanotons. `None` when the intent was
    /// reconstructed from a ledger event alone.
    pub declared_amount: Option<u64>,

    pub nickname: String,

    pub message: String,

    /// A matching ledger event has been merged
    pub verified: bool,

    /// Notification delivery was confirmed. Terminal.
    pub acknowledged: bool,

    pub ledger_tx_hash: Option<String>,

    pub ledger_seq: Option<u64>,

    /// Ledger-confirmed amount in nanotons
    pub amount: Option<u64>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl DonationIntent {
    /// Create an unverified intent.
    pub fn new(
        signature: impl Into<String>,
        streamer_id: impl Into<String>,
        wallet_address: impl Into<String>,
        declared_amount: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            signature: signature.into(),
            streamer_id: streamer_id.into(),
            wallet_address: wallet_address.into(),
            declared_amount: Some(declared_amount),
            nickname: String::new(),
            message: String::new(),
            verified: false,
            acknowledged: false,
            ledger_tx_hash: None,
            ledger_seq: None,
            amount: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Build a verified intent for a payment that was never submitted.
    pub fn from_facts(signature: impl Into<String>, facts: &LedgerFacts) -> Self {
        let now = Utc::now();
        let mut intent = Self {
            signature: signature.into(),
            streamer_id: String::new(),
            wallet_address: String::new(),
            declared_amount: None,
            nickname: String::new(),
            message: String::new(),
            verified: false,
            acknowledged: false,
            ledger_tx_hash: None,
            ledger_seq: None,
            amount: None,
            created_at: now,
            updated_at: now,
        };
        intent.merge(facts);
        intent
    }

    /// Fold ledger facts into this intent and mark it verified.
    ///
    /// Repeating a merge with the same facts leaves the intent unchanged
    /// apart from `updated_at`. A non-empty stored message wins over the
    /// on-chain comment; the acknowledged flag is never touched.
    pub fn merge(&mut self, facts: &LedgerFacts) {
        self.ledger_tx_hash = Some(facts.tx_hash.clone());
        self.ledger_seq = Some(facts.ledger_seq);
        self.amount = Some(facts.amount);
        self.streamer_id = facts.streamer_id.clone();
        if !facts.wallet_address.is_empty() {
            self.wallet_address = facts.wallet_address.clone();
        }
        if self.message.is_empty() {
            self.message = facts.message.clone();
        }
        self.verified = true;
        self.updated_at = Utc::now();
    }

    /// True when the donor declared an amount that the ledger contradicts.
    pub fn amount_mismatch(&self) -> bool {
        match (self.declared_amount, self.amount) {
            (Some(declared), Some(confirmed)) => declared != confirmed,
            _ => false,
        }
    }
}

/// Ledger facts merged into an intent once its payment is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFacts {
    pub tx_hash: String,
    pub ledger_seq: u64,
    pub amount: u64,
    pub wallet_address: String,
    /// Streamer the payment was attributed to
    pub streamer_id: String,
    pub message: String,
}

impl LedgerFacts {
    pub fn from_event(event: &LedgerEvent, streamer_id: impl Into<String>) -> Self {
        Self {
            tx_hash: event.tx_hash.clone(),
            ledger_seq: event.ledger_seq,
            amount: event.amount,
            wallet_address: event.wallet_address.clone(),
            streamer_id: streamer_id.into(),
            message: event.message.clone(),
        }
    }
}

/// A registered streamer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streamer {
    pub streamer_id: String,
    /// Wallet donations are paid to; unique across streamers
    pub wallet_address: String,
    /// Identity reference from the external auth provider
    pub cognito_id: Option<String>,
}

impl Streamer {
    /// Register a streamer under a freshly generated id.
    pub fn new(wallet_address: impl Into<String>) -> Self {
        Self {
            streamer_id: Uuid::new_v4().to_string(),
            wallet_address: wallet_address.into(),
            cognito_id: None,
        }
    }
}

/// An overlay widget configured by a streamer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    pub widget_id: String,
    pub streamer_id: String,
    /// Widget kind, e.g. `goal`
    pub widget_type: String,
    /// Target amount in nanotons
    pub amount_goal: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Widget {
    pub fn new(
        streamer_id: impl Into<String>,
        widget_type: impl Into<String>,
        amount_goal: u64,
    ) -> Self {
        Self {
            widget_id: Uuid::new_v4().to_string(),
            streamer_id: streamer_id.into(),
            widget_type: widget_type.into(),
            amount_goal,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Progress towards the goal in basis points, capped at 100%.
    pub fn progress_bps(&self, amount_current: u64) -> u32 {
        if self.amount_goal == 0 {
            return 10_000;
        }
        let bps = amount_current as u128 * 10_000 / self.amount_goal as u128;
        bps.min(10_000) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(streamer_id: &str) -> LedgerFacts {
        LedgerFacts {
            tx_hash: "hash1".to_string(),
            ledger_seq: 42,
            amount: 500,
            wallet_address: "wallet-a".to_string(),
            streamer_id: streamer_id.to_string(),
            message: "on-chain hello".to_string(),
        }
    }

    #[test]
    fn test_merge_verifies_and_keeps_stored_message() {
        let mut intent = DonationIntent::new("sig", "streamer-1", "wallet-a", 500)
            .with_nickname("alice")
            .with_message("form hello");

        intent.merge(&facts("streamer-1"));

        assert!(intent.verified);
        assert!(!intent.acknowledged);
        assert_eq!(intent.amount, Some(500));
        assert_eq!(intent.ledger_seq, Some(42));
        assert_eq!(intent.ledger_tx_hash.as_deref(), Some("hash1"));
        assert_eq!(intent.message, "form hello");
        assert_eq!(intent.nickname, "alice");
        assert!(!intent.amount_mismatch());
    }

    #[test]
    fn test_merge_is_repeatable() {
        let mut intent = DonationIntent::new("sig", "streamer-1", "wallet-a", 500);
        intent.merge(&facts("streamer-1"));
        let first = intent.clone();
        intent.merge(&facts("streamer-1"));

        assert_eq!(intent.amount, first.amount);
        assert_eq!(intent.message, first.message);
        assert_eq!(intent.streamer_id, first.streamer_id);
        assert_eq!(intent.created_at, first.created_at);
    }

    #[test]
    fn test_from_facts() {
        let intent = DonationIntent::from_facts("sig", &facts("streamer-2"));
        assert!(intent.verified);
        assert_eq!(intent.streamer_id, "streamer-2");
        assert_eq!(intent.declared_amount, None);
        assert_eq!(intent.message, "on-chain hello");
        assert!(!intent.amount_mismatch());
    }

    #[test]
    fn test_amount_mismatch() {
        let mut intent = DonationIntent::new("sig", "streamer-1", "wallet-a", 700);
        assert!(!intent.amount_mismatch());
        intent.merge(&facts("streamer-1"));
        assert!(intent.amount_mismatch());
    }

    #[test]
    fn test_widget_progress() {
        let widget = Widget::new("streamer-1", "goal", 1_000);
        assert!(widget.is_active);
        assert_eq!(widget.progress_bps(250), 2_500);
        assert_eq!(widget.progress_bps(5_000), 10_000);
        assert_eq!(Widget::new("s", "goal", 0).progress_bps(0), 10_000);
    }

    #[test]
    fn test_streamer_ids_are_unique() {
        assert_ne!(Streamer::new("w").streamer_id, Streamer::new("w").streamer_id);
    }
}
