// Copyright (c) 2024 The Botho Foundation

//! TON Donation Watcher
//!
//! Watches TON addresses for incoming donation payments, reconciles each
//! payment with the donation intent that produced it and notifies the
//! streamer's overlay widget exactly once per donation.
//!
//! # Architecture
//!
//! A [`watch::WatchLoop`] per address polls a
//! [`source::LedgerTransactionSource`] on a fixed interval. Each transaction
//! is decoded into a ledger event and handed to the
//! [`correlation::CorrelationEngine`], which merges the ledger facts into the
//! [`ledger::DonationLedger`], calls the
//! [`notify::NotificationDispatcher`] and, once delivery is confirmed,
//! acknowledges the donation and credits the streamer's widget total.
//!
//! # Idempotence
//!
//! Re-scanning the same transactions is always safe. Records are merged by
//! signature, and only the call that flips a donation to acknowledged
//! credits the widget total.

pub mod correlation;
pub mod db;
pub mod engine;
pub mod ledger;
pub mod notify;
pub mod source;
pub mod sync;
pub mod watch;

pub use correlation::{CorrelationEngine, Outcome};
pub use db::Database;
pub use engine::DonationService;
pub use ledger::{DonationLedger, LedgerError, MemoryLedger};
pub use notify::{NotificationDispatcher, NotificationPayload, NotifyError, WebhookDispatcher};
pub use source::{LedgerTransactionSource, SourceError, TonCenterSource};
pub use sync::WatchState;
pub use watch::{CycleError, CycleReport, WatchLoop, WatchSettings};
