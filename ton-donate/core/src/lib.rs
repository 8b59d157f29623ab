// Copyright (c) 2024 The Botho Foundation

//! Core types and logic for the TON donation watcher.
//!
//! This crate provides the domain types shared by the watcher service,
//! including:
//!
//! - Donation intents, streamers and widgets
//! - Raw ledger transaction records and the comment decoder
//! - Configuration structures

pub mod config;
pub mod donation;
pub mod event;

pub use config::{
    ConfigError, DonateConfig, HighWaterMark, LedgerSourceConfig, StorageConfig, WatchConfig,
    WebhookConfig,
};
pub use donation::{DonationIntent, LedgerFacts, Streamer, Widget};
pub use event::{
    CommentConvention, Cursor, DecodeError, LedgerEvent, RawMessage, RawTransaction,
    TransactionDecoder, TransactionId,
};
