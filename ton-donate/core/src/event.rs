// Copyright (c) 2024 The Botho Foundation

//! Raw ledger records and the payment comment decoder.
//!
//! A donation payment carries a text comment written by the donor's wallet.
//! The comment embeds the signature that correlates the payment with a
//! donation intent, and optionally the wallet address of the streamer being
//! paid. The layout of that comment is a versioned protocol: see
//! [`CommentConvention`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between comment segments in [`CommentConvention::DelimitedV1`].
pub const COMMENT_SEPARATOR: char = '|';

/// Identifier of a transaction within an account's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId {
    /// Logical time, as a decimal string
    pub lt: String,
    /// Transaction hash as reported by the node
    pub hash: String,
}

/// Inbound message of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Sender address; empty for external messages
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    /// Attached value in nanotons, as a decimal string
    #[serde(default)]
    pub value: String,
    /// Decoded text comment, if any
    #[serde(default)]
    pub message: Option<String>,
}

/// An already-parsed transaction record as returned by the ledger source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub transaction_id: TransactionId,
    /// Unix time of the transaction
    #[serde(default)]
    pub utime: u64,
    #[serde(default)]
    pub in_msg: Option<RawMessage>,
}

impl RawTransaction {
    /// Parse the logical time, if well formed.
    pub fn lt(&self) -> Option<u64> {
        self.transaction_id.lt.parse().ok()
    }
}

/// Position in an account's transaction chain, used as a high-water mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub lt: u64,
    pub hash: String,
}

/// A payment observed on the ledger, decoded from one raw transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Correlation signature from the comment; may be empty
    pub signature: String,
    /// Free-form donor message from the comment
    pub message: String,
    /// Streamer wallet named in the comment; may be empty
    pub wallet_address: String,
    /// Ledger-confirmed amount in nanotons
    pub amount: u64,
    /// Logical time of the transaction
    pub ledger_seq: u64,
    pub tx_hash: String,
}

impl LedgerEvent {
    pub fn cursor(&self) -> Cursor {
        Cursor {
            lt: self.ledger_seq,
            hash: self.tx_hash.clone(),
        }
    }
}

/// Errors that make a single transaction undecodable.
///
/// These are never retried: the transaction is skipped and the batch goes on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("transaction {0} has no inbound payment")]
    NoInboundPayment(String),

    #[error("transaction hash is empty")]
    MissingHash,

    #[error("invalid logical time: {0:?}")]
    InvalidSequence(String),

    #[error("invalid amount: {0:?}")]
    InvalidAmount(String),

    #[error("malformed signature in comment: {0:?}")]
    MalformedSignature(String),

    #[error("comment names an invalid wallet address: {0:?}")]
    InvalidWallet(String),
}

/// Versioned layout of the payment comment.
///
/// Changing how a comment is split is a protocol change and gets a new
/// variant rather than an edit to an existing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentConvention {
    /// v0: the whole comment is the signature.
    Plain,
    /// v1: `<signature>|<streamer wallet>|<message>`, wallet and message optional.
    #[default]
    DelimitedV1,
}

impl std::fmt::Display for CommentConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommentConvention::Plain => write!(f, "plain"),
            CommentConvention::DelimitedV1 => write!(f, "delimited-v1"),
        }
    }
}

/// Comment segments after splitting.
#[derive(Debug, Default, PartialEq, Eq)]
struct CommentParts<'a> {
    signature: &'a str,
    wallet: &'a str,
    message: &'a str,
}

impl CommentConvention {
    fn split<'a>(&self, comment: &'a str) -> CommentParts<'a> {
        match self {
            CommentConvention::Plain => CommentParts {
                signature: comment.trim(),
                ..Default::default()
            },
            CommentConvention::DelimitedV1 => {
                let mut parts = comment.splitn(3, COMMENT_SEPARATOR);
                CommentParts {
                    signature: parts.next().unwrap_or_default().trim(),
                    wallet: parts.next().unwrap_or_default().trim(),
                    message: parts.next().unwrap_or_default().trim(),
                }
            }
        }
    }
}

/// Turns raw transactions into [`LedgerEvent`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionDecoder {
    convention: CommentConvention,
}

impl TransactionDecoder {
    pub fn new(convention: CommentConvention) -> Self {
        Self { convention }
    }

    pub fn convention(&self) -> CommentConvention {
        self.convention
    }

    /// Decode one transaction.
    pub fn decode(&self, raw: &RawTransaction) -> Result<LedgerEvent, DecodeError> {
        let tx_hash = raw.transaction_id.hash.trim();
        if tx_hash.is_empty() {
            return Err(DecodeError::MissingHash);
        }

        let ledger_seq = raw
            .lt()
            .ok_or_else(|| DecodeError::InvalidSequence(raw.transaction_id.lt.clone()))?;

        // External messages have no source; they are the account's own outgoing
        // transfers, not payments.
        let msg = match &raw.in_msg {
            Some(msg) if !msg.source.is_empty() => msg,
            _ => return Err(DecodeError::NoInboundPayment(tx_hash.to_string())),
        };

        let amount = msg
            .value
            .trim()
            .parse::<u64>()
            .map_err(|_| DecodeError::InvalidAmount(msg.value.clone()))?;

        let comment = msg.message.as_deref().unwrap_or_default();
        let parts = self.convention.split(comment);

        if parts.signature.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DecodeError::MalformedSignature(parts.signature.to_string()));
        }
        if !parts.wallet.is_empty() && !is_ton_address(parts.wallet) {
            return Err(DecodeError::InvalidWallet(parts.wallet.to_string()));
        }

        Ok(LedgerEvent {
            signature: parts.signature.to_string(),
            message: parts.message.to_string(),
            wallet_address: parts.wallet.to_string(),
            amount,
            ledger_seq,
            tx_hash: tx_hash.to_string(),
        })
    }
}

/// Check that a string looks like a TON address.
///
/// Accepts the raw form `<workchain>:<64 hex chars>` and the 48-character
/// user-friendly form in either base64 or base64url alphabet.
pub fn is_ton_address(s: &str) -> bool {
    if let Some((workchain, account)) = s.split_once(':') {
        return workchain.parse::<i8>().is_ok()
            && account.len() == 64
            && account.chars().all(|c| c.is_ascii_hexdigit());
    }

    s.len() == 48
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "EQDtFpEwcFAEcRe5mLVh2N6C0x-_hJEM7W61_JLnSF74p4q2";

    fn raw(lt: &str, hash: &str, value: &str, comment: Option<&str>) -> RawTransaction {
        RawTransaction {
            transaction_id: TransactionId {
                lt: lt.to_string(),
                hash: hash.to_string(),
            },
            utime: 1_700_000_000,
            in_msg: Some(RawMessage {
                source: "EQBvW8Z5huBkMJYdnfAEM5JqTNkuWX3diqYENkWsIL0XggGG".to_string(),
                destination: WALLET.to_string(),
                value: value.to_string(),
                message: comment.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_decode_delimited_comment() {
        let decoder = TransactionDecoder::default();
        let comment = format!("sig-123|{}|great stream | thanks", WALLET);
        let event = decoder
            .decode(&raw("4500", "abc=", "500", Some(&comment)))
            .unwrap();

        assert_eq!(event.signature, "sig-123");
        assert_eq!(event.wallet_address, WALLET);
        assert_eq!(event.message, "great stream | thanks");
        assert_eq!(event.amount, 500);
        assert_eq!(event.ledger_seq, 4500);
        assert_eq!(event.tx_hash, "abc=");
    }

    #[test]
    fn test_decode_signature_only() {
        let decoder = TransactionDecoder::default();
        let event = decoder.decode(&raw("1", "h", "10", Some("sig-1"))).unwrap();
        assert_eq!(event.signature, "sig-1");
        assert!(event.wallet_address.is_empty());
        assert!(event.message.is_empty());
    }

    #[test]
    fn test_decode_plain_keeps_separator() {
        let decoder = TransactionDecoder::new(CommentConvention::Plain);
        let event = decoder
            .decode(&raw("1", "h", "10", Some("  sig|not-a-wallet ")))
            .unwrap();
        assert_eq!(event.signature, "sig|not-a-wallet");
        assert!(event.wallet_address.is_empty());
    }

    #[test]
    fn test_missing_comment_yields_empty_signature() {
        let decoder = TransactionDecoder::default();
        let event = decoder.decode(&raw("7", "h", "10", None)).unwrap();
        assert!(event.signature.is_empty());
    }

    #[test]
    fn test_decode_errors() {
        let decoder = TransactionDecoder::default();

        assert_eq!(
            decoder.decode(&raw("1", "", "10", Some("s"))),
            Err(DecodeError::MissingHash)
        );
        assert_eq!(
            decoder.decode(&raw("x1", "h", "10", Some("s"))),
            Err(DecodeError::InvalidSequence("x1".to_string()))
        );
        assert_eq!(
            decoder.decode(&raw("1", "h", "-5", Some("s"))),
            Err(DecodeError::InvalidAmount("-5".to_string()))
        );
        assert_eq!(
            decoder.decode(&raw("1", "h", "10", Some("two words|"))),
            Err(DecodeError::MalformedSignature("two words".to_string()))
        );
        assert_eq!(
            decoder.decode(&raw("1", "h", "10", Some("sig|nope|hi"))),
            Err(DecodeError::InvalidWallet("nope".to_string()))
        );
    }

    #[test]
    fn test_external_message_is_not_a_payment() {
        let decoder = TransactionDecoder::default();
        let mut tx = raw("1", "h", "0", None);
        tx.in_msg.as_mut().unwrap().source.clear();
        assert_eq!(
            decoder.decode(&tx),
            Err(DecodeError::NoInboundPayment("h".to_string()))
        );

        tx.in_msg = None;
        assert!(decoder.decode(&tx).is_err());
    }

    #[test]
    fn test_is_ton_address() {
        assert!(is_ton_address(WALLET));
        assert!(is_ton_address(
            "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8"
        ));
        assert!(is_ton_address(
            "-1:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8"
        ));
        assert!(!is_ton_address("0:83df"));
        assert!(!is_ton_address("EQDtFpEwcFAEcRe5mLVh2N6C0x"));
        assert!(!is_ton_address(""));
    }

    #[test]
    fn test_deserialize_toncenter_record() {
        let json = r#"{
            "utime": 1700000000,
            "transaction_id": {"lt": "41234000003", "hash": "q1w2e3="},
            "in_msg": {"source": "EQBvW8Z5huBkMJYdnfAEM5JqTNkuWX3diqYENkWsIL0XggGG",
                       "destination": "", "value": "1500000000", "message": "sig-9"},
            "out_msgs": []
        }"#;
        let tx: RawTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.lt(), Some(41_234_000_003));

        let event = TransactionDecoder::default().decode(&tx).unwrap();
        assert_eq!(event.amount, 1_500_000_000);
        assert_eq!(event.signature, "sig-9");
    }
}
