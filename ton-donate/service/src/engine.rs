// Copyright (c) 2024 The Botho Foundation

//! Donation service - owns the watch loops and their shared dependencies.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};
use ton_donate_core::{DonateConfig, TransactionDecoder};

use crate::correlation::CorrelationEngine;
use crate::ledger::DonationLedger;
use crate::notify::{NotificationDispatcher, WebhookDispatcher};
use crate::source::{LedgerTransactionSource, TonCenterSource};
use crate::sync::{state_path, WatchState};
use crate::watch::{CycleError, CycleReport, WatchLoop, WatchSettings};

/// The main service that runs one watch loop per configured address.
pub struct DonationService {
    config: DonateConfig,
    source: Arc<dyn LedgerTransactionSource>,
    engine: CorrelationEngine,
    shutdown_tx: broadcast::Sender<()>,
}

impl DonationService {
    /// Create a service from explicit dependencies.
    pub fn new(
        config: DonateConfig,
        ledger: Arc<dyn DonationLedger>,
        source: Arc<dyn LedgerTransactionSource>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            source,
            engine: CorrelationEngine::new(ledger, dispatcher),
            shutdown_tx,
        }
    }

    /// Create a service talking to the configured ledger API and webhook.
    pub fn from_config(config: DonateConfig, ledger: Arc<dyn DonationLedger>) -> anyhow::Result<Self> {
        let source = TonCenterSource::from_config(&config.ledger)?;
        let dispatcher = WebhookDispatcher::from_config(&config.webhook)?;
        info!("Notifications are posted to {}", dispatcher.url());

        Ok(Self::new(config, ledger, Arc::new(source), Arc::new(dispatcher)))
    }

    /// Handle that stops all loops when sent to.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    fn settings_for(&self, address: &str) -> WatchSettings {
        let watch = &self.config.watch;
        WatchSettings {
            poll_interval: Duration::from_secs(watch.poll_interval_secs),
            lookback: watch.lookback,
            high_water_mark: watch.high_water_mark,
            state_path: Some(state_path(&watch.state_dir, address)),
        }
    }

    /// Build the watch loop for every configured address.
    pub fn watch_loops(&self) -> anyhow::Result<Vec<WatchLoop>> {
        let decoder = TransactionDecoder::new(self.config.ledger.comment_convention);

        self.config
            .ledger
            .addresses
            .iter()
            .map(|address| {
                WatchLoop::new(
                    address,
                    self.source.clone(),
                    decoder,
                    self.engine.clone(),
                    self.settings_for(address),
                )
            })
            .collect()
    }

    /// Run one cycle per address, in order.
    pub async fn run_once(&self) -> anyhow::Result<Vec<(String, Result<CycleReport, CycleError>)>> {
        let mut results = Vec::new();
        for mut watch_loop in self.watch_loops()? {
            let result = watch_loop.run_once().await;
            results.push((watch_loop.address().to_string(), result));
        }
        Ok(results)
    }

    /// Run until Ctrl-C.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Run until `stop` resolves or a shutdown is sent through the handle.
    pub async fn run_until(&self, stop: impl Future<Output = ()>) -> anyhow::Result<()> {
        info!(
            "Starting donation service for {} address(es)",
            self.config.ledger.addresses.len()
        );

        let mut handles = Vec::new();
        for watch_loop in self.watch_loops()? {
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(watch_loop.run(shutdown)));
        }

        let mut external = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = stop => {
                info!("Received shutdown signal");
            }
            _ = external.recv() => {}
        }

        // Send shutdown signal to all loops
        let _ = self.shutdown_tx.send(());

        for handle in handles {
            match handle.await {
                Ok(state) => info!("{}", state.summary()),
                Err(e) => error!("Watch loop task failed: {}", e),
            }
        }

        info!("Donation service stopped");
        Ok(())
    }
}

/// Load the persisted watch state of every configured address.
pub fn load_states(config: &DonateConfig) -> anyhow::Result<Vec<WatchState>> {
    config
        .ledger
        .addresses
        .iter()
        .map(|address| {
            WatchState::load(
                &state_path(Path::new(&config.watch.state_dir), address),
                address,
            )
        })
        .collect()
}
