// Copyright (c) 2024 The Botho Foundation

//! Periodic watch loop for one address.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use ton_donate_core::{Cursor, HighWaterMark, RawTransaction, TransactionDecoder};

use crate::correlation::{CorrelationEngine, Outcome};
use crate::source::{LedgerTransactionSource, SourceError};
use crate::sync::WatchState;

/// Shutdown signal type.
pub type ShutdownSignal = broadcast::Receiver<()>;

/// Pages fetched backwards in one cycle while looking for the high-water
/// mark.
pub const MAX_BACKFILL_PAGES: usize = 32;

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Transactions returned by the source, backfilled pages included
    pub fetched: usize,
    /// Transactions fetched by paging back towards the high-water mark
    pub backfilled: usize,
    /// The high-water mark was not reached within the backfill page limit,
    /// so older transactions may be missing and the mark was held
    pub gap: bool,
    /// Transactions at or below the high-water mark, not processed
    pub skipped: usize,
    pub notified: usize,
    pub amount_notified: u64,
    pub already_acknowledged: usize,
    pub discarded: usize,
    pub unattributed: usize,
    pub decode_errors: usize,
    pub notification_failures: usize,
    pub storage_errors: usize,
    /// New high-water mark: the last transaction of the longest prefix of
    /// the batch that reached a final outcome
    pub advanced_to: Option<Cursor>,
}

/// A cycle that did not complete.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("ledger source unavailable: {0}")]
    Source(#[from] SourceError),

    #[error("cycle panicked: {0}")]
    Panicked(String),

    #[error("cycle task failed: {0}")]
    Task(String),
}

/// Loop timing and high-water-mark policy.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    /// Transactions requested per cycle
    pub lookback: u32,
    pub high_water_mark: HighWaterMark,
    /// Where watch state is persisted; `None` keeps it in memory
    pub state_path: Option<PathBuf>,
}

/// Everything one cycle needs, cheap to clone into a task.
#[derive(Clone)]
struct Cycle {
    address: String,
    lookback: u32,
    source: Arc<dyn LedgerTransactionSource>,
    decoder: TransactionDecoder,
    engine: CorrelationEngine,
}

impl Cycle {
    async fn run(self, since: Option<Cursor>) -> Result<CycleReport, SourceError> {
        let mut transactions = self
            .source
            .list(&self.address, self.lookback, since.as_ref())
            .await?;

        let mut report = CycleReport::default();
        if let Some(mark) = &since {
            let first_page = transactions.len();
            report.gap = !self.backfill(&mut transactions, mark).await?;
            report.backfilled = transactions.len() - first_page;
            if report.gap {
                warn!(
                    "More than {} pages of transactions on {} after lt {}; holding the high-water mark",
                    MAX_BACKFILL_PAGES, self.address, mark.lt
                );
            }
        }
        report.fetched = transactions.len();

        // Cleared by the first event that may still change on a later scan.
        let mut advancing = !report.gap;

        for raw in &transactions {
            if let (Some(mark), Some(lt)) = (&since, raw.lt()) {
                if lt <= mark.lt {
                    report.skipped += 1;
                    continue;
                }
            }

            let event = match self.decoder.decode(raw) {
                Ok(event) => event,
                Err(e) => {
                    debug!("Skipping undecodable transaction on {}: {}", self.address, e);
                    report.decode_errors += 1;
                    if let (true, Some(lt)) = (advancing, raw.lt()) {
                        report.advanced_to = Some(Cursor {
                            lt,
                            hash: raw.transaction_id.hash.clone(),
                        });
                    }
                    continue;
                }
            };

            match self.engine.process(&event).await {
                Ok(outcome) => {
                    let terminal = outcome.is_terminal();
                    match outcome {
                        Outcome::Discarded => report.discarded += 1,
                        Outcome::Unattributed => report.unattributed += 1,
                        Outcome::AlreadyAcknowledged => report.already_acknowledged += 1,
                        Outcome::Notified { amount, .. } => {
                            report.notified += 1;
                            report.amount_notified = report.amount_notified.saturating_add(amount);
                        }
                        Outcome::NotificationFailed { .. } => report.notification_failures += 1,
                    }
                    if !terminal {
                        advancing = false;
                    }
                }
                Err(e) => {
                    error!(
                        "Storage error processing {} on {}: {}",
                        event.tx_hash, self.address, e
                    );
                    report.storage_errors += 1;
                    advancing = false;
                }
            }

            if advancing {
                report.advanced_to = Some(event.cursor());
            }
        }

        Ok(report)
    }

    /// Page back from the oldest fetched transaction until the high-water
    /// mark is reached. Returns `false` if the page limit ran out first.
    async fn backfill(
        &self,
        transactions: &mut Vec<RawTransaction>,
        mark: &Cursor,
    ) -> Result<bool, SourceError> {
        let limit = self.lookback as usize;
        let mut page_len = transactions.len();

        for _ in 0..MAX_BACKFILL_PAGES {
            // A short page holds everything after the mark.
            if page_len < limit {
                return Ok(true);
            }

            let before = match transactions.first() {
                None => return Ok(true),
                Some(oldest) => match oldest.lt() {
                    Some(lt) if lt <= mark.lt => return Ok(true),
                    Some(lt) => Cursor {
                        lt,
                        hash: oldest.transaction_id.hash.clone(),
                    },
                    None => return Ok(false),
                },
            };

            let page = self
                .source
                .list_before(&self.address, self.lookback, &before)
                .await?;
            page_len = page.len();
            let reached = page
                .iter()
                .any(|tx| tx.lt().map_or(false, |lt| lt <= mark.lt));

            let mut older: Vec<_> = page
                .into_iter()
                .filter(|tx| tx.lt().map_or(true, |lt| lt > mark.lt))
                .collect();
            debug!(
                "Backfilled {} transactions on {} before lt {}",
                older.len(),
                self.address,
                before.lt
            );
            older.append(transactions);
            *transactions = older;

            if reached {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Polls one watched address on a fixed period.
///
/// Cycles never overlap: the next tick waits for the previous cycle to
/// return. Each cycle runs as its own task, so an error or panic inside it
/// is logged and the loop carries on.
pub struct WatchLoop {
    cycle: Cycle,
    settings: WatchSettings,
    state: WatchState,
}

impl WatchLoop {
    pub fn new(
        address: &str,
        source: Arc<dyn LedgerTransactionSource>,
        decoder: TransactionDecoder,
        engine: CorrelationEngine,
        settings: WatchSettings,
    ) -> anyhow::Result<Self> {
        let state = match &settings.state_path {
            Some(path) => WatchState::load(path, address)?,
            None => WatchState::new(address),
        };

        Ok(Self {
            cycle: Cycle {
                address: address.to_string(),
                lookback: settings.lookback,
                source,
                decoder,
                engine,
            },
            settings,
            state,
        })
    }

    pub fn address(&self) -> &str {
        &self.cycle.address
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Run until a shutdown signal arrives.
    ///
    /// A cycle in progress when the signal arrives completes first.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> WatchState {
        info!(
            "Watching {} every {:?} (lookback {}, high-water mark {:?}, comments {})",
            self.address(),
            self.settings.poll_interval,
            self.settings.lookback,
            self.settings.high_water_mark,
            self.cycle.decoder.convention()
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Watch loop for {} shutting down", self.address());
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        debug!("Cycle on {} ended early: {}", self.address(), e);
                    }
                }
            }
        }

        self.state
    }

    /// Execute exactly one cycle and update the watch state.
    pub async fn run_once(&mut self) -> Result<CycleReport, CycleError> {
        let since = match self.settings.high_water_mark {
            HighWaterMark::Tracked => self.state.high_water_mark.clone(),
            HighWaterMark::None => None,
        };

        let cycle = self.cycle.clone();
        let result = match tokio::spawn(cycle.run(since)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(CycleError::Source(e)),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(CycleError::Panicked(msg))
            }
            Err(e) => Err(CycleError::Task(e.to_string())),
        };

        match &result {
            Ok(report) => {
                self.state.record_cycle(report);
                if report.fetched > 0 {
                    debug!("Cycle on {}: {:?}", self.address(), report);
                }
            }
            Err(e) => {
                warn!("Skipping cycle on {}: {}", self.address(), e);
                self.state.record_failed_cycle();
            }
        }

        if let Some(path) = &self.settings.state_path {
            if let Err(e) = self.state.save(path) {
                error!("Failed to save watch state for {}: {}", self.address(), e);
            }
        }

        result
    }
}
