// Copyright (c) 2024 The Botho Foundation

//! Correlation of ledger payments with donation intents.
//!
//! Each decoded payment is matched to the intent carrying the same
//! signature. When no intent was ever recorded (the donor's submission
//! failed after the payment went through) the streamer is resolved from the
//! wallet named in the payment comment instead.
//!
//! Delivery is at-most-once per signature on the credit side: the widget
//! total is only incremented by the caller that flips `acknowledged` from
//! false to true. The acknowledgement is written first; a crash between the
//! two writes loses that donation's credit, and replay does not restore it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use ton_donate_core::{LedgerEvent, LedgerFacts};

use crate::ledger::{DonationLedger, LedgerError};
use crate::notify::{NotificationDispatcher, NotificationPayload};

/// Result of processing one ledger event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No signature in the comment; nothing to correlate.
    Discarded,

    /// Neither the signature nor the wallet resolved to a streamer.
    Unattributed,

    /// The donation was notified earlier.
    AlreadyAcknowledged,

    /// Notification delivered, donation acknowledged and credited.
    Notified {
        streamer_id: String,
        amount: u64,
        /// Widget total after the credit
        total: u64,
    },

    /// Delivery failed; the donation stays unacknowledged.
    NotificationFailed { retryable: bool, reason: String },
}

impl Outcome {
    /// Whether re-processing the event could change anything.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Outcome::NotificationFailed {
                retryable: true,
                ..
            }
        )
    }
}

/// Matches ledger events to donation intents and drives notification.
#[derive(Clone)]
pub struct CorrelationEngine {
    ledger: Arc<dyn DonationLedger>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl CorrelationEngine {
    pub fn new(ledger: Arc<dyn DonationLedger>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { ledger, dispatcher }
    }

    /// Process one event.
    ///
    /// Storage errors abort this event only; it will be seen again on the
    /// next scan of the same window.
    pub async fn process(&self, event: &LedgerEvent) -> Result<Outcome, LedgerError> {
        if event.signature.is_empty() {
            debug!("Discarding transaction {} without signature", event.tx_hash);
            return Ok(Outcome::Discarded);
        }

        let intent = self.ledger.find_by_signature(&event.signature)?;
        let known_streamer = intent
            .as_ref()
            .map(|i| i.streamer_id.clone())
            .filter(|id| !id.is_empty());

        let streamer_id = match known_streamer {
            Some(id) => id,
            None => match self.resolve_by_wallet(&event.wallet_address)? {
                Some(id) => {
                    info!(
                        "No intent for signature {}, attributed tx {} to streamer {} by wallet",
                        event.signature, event.tx_hash, id
                    );
                    id
                }
                None => {
                    warn!(
                        "Unattributed payment: tx={} lt={} signature={} wallet={:?} amount={}",
                        event.tx_hash,
                        event.ledger_seq,
                        event.signature,
                        event.wallet_address,
                        event.amount
                    );
                    return Ok(Outcome::Unattributed);
                }
            },
        };

        let facts = LedgerFacts::from_event(event, streamer_id);
        let merged = self.ledger.upsert_merge(&event.signature, &facts)?;

        if merged.acknowledged {
            debug!("Donation {} already acknowledged", event.signature);
            return Ok(Outcome::AlreadyAcknowledged);
        }

        if merged.amount_mismatch() {
            warn!(
                "Donation {} declared {:?} but ledger confirmed {}; notifying confirmed amount",
                event.signature, merged.declared_amount, event.amount
            );
        }

        let payload = NotificationPayload {
            amount: event.amount,
            nickname: merged.nickname.clone(),
            text: merged.message.clone(),
            client_id: merged.streamer_id.clone(),
        };

        if let Err(e) = self.dispatcher.send(&payload).await {
            if e.is_retryable() {
                warn!("Notification for {} failed, will retry: {}", event.signature, e);
            } else {
                error!("Notification for {} rejected: {}", event.signature, e);
            }
            return Ok(Outcome::NotificationFailed {
                retryable: e.is_retryable(),
                reason: e.to_string(),
            });
        }

        if !self.ledger.set_acknowledged(&event.signature)? {
            // A concurrent pass acknowledged it first and owns the credit.
            debug!("Donation {} acknowledged elsewhere", event.signature);
            return Ok(Outcome::AlreadyAcknowledged);
        }

        let total = match self
            .ledger
            .increment_widget_total(&merged.streamer_id, event.amount)
        {
            Ok(total) => total,
            Err(e) => {
                error!(
                    "Donation {} acknowledged but credit of {} to {} lost: {}",
                    event.signature, event.amount, merged.streamer_id, e
                );
                return Err(e);
            }
        };

        info!(
            "Donation {} notified: {} nanotons to streamer {} (total {})",
            event.signature, event.amount, merged.streamer_id, total
        );

        Ok(Outcome::Notified {
            streamer_id: merged.streamer_id,
            amount: event.amount,
            total,
        })
    }

    /// Resolve the owning streamer from a wallet address: the streamer
    /// registry first, then the latest attributed intent for that wallet.
    fn resolve_by_wallet(&self, wallet: &str) -> Result<Option<String>, LedgerError> {
        if wallet.is_empty() {
            return Ok(None);
        }
        if let Some(id) = self.ledger.find_streamer_by_wallet(wallet)? {
            return Ok(Some(id));
        }
        Ok(self
            .ledger
            .find_by_wallet(wallet)?
            .map(|intent| intent.streamer_id)
            .filter(|id| !id.is_empty()))
    }
}
