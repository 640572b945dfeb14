//! Account-worker lifecycle and request routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::worker::{Worker, WorkerConfig};
use crate::market::{MarketApi, MarketClient, MarketError};
use crate::telegram::Notify;

/// Supervises the worker set: one live worker per account, reconciled against
/// the control plane's reload requests.
pub struct Manager {
    base_url: String,
    notifier: Arc<dyn Notify>,
    poll_interval: Option<Duration>,
    workers: Mutex<HashMap<i64, Arc<Worker>>>,
}

impl Manager {
    pub fn new(
        base_url: String,
        notifier: Arc<dyn Notify>,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            base_url,
            notifier,
            poll_interval,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile one account against its fresh configuration: stop-and-evict
    /// when the account left auto mode, otherwise replace and restart.
    pub async fn reload_account(&self, cfg: WorkerConfig) -> Result<(), MarketError> {
        let mut workers = self.workers.lock().await;

        if !cfg.should_run() {
            if let Some(worker) = workers.remove(&cfg.account_id) {
                tracing::info!(
                    account = cfg.account_id,
                    active = cfg.active,
                    auto = cfg.auto_mode,
                    "stopping worker"
                );
                worker.stop().await;
            }
            return Ok(());
        }

        if let Some(existing) = workers.remove(&cfg.account_id) {
            existing.stop().await;
        }

        let client = Arc::new(MarketClient::new(&self.base_url, &cfg.access_token)?);
        // Prime the connection pool off the reload path; the first race
        // should not pay for DNS/TLS.
        let warm = Arc::clone(&client);
        tokio::spawn(async move { warm.warmup().await });

        tracing::info!(
            account = cfg.account_id,
            min = cfg.min_amount.unwrap_or(0.0),
            max = cfg.max_amount.unwrap_or(0.0),
            chat = cfg.chat_id,
            "account reloaded"
        );
        let worker = Arc::new(Worker::new(
            cfg.clone(),
            client as Arc<dyn MarketApi>,
            Arc::clone(&self.notifier),
            self.base_url.clone(),
            self.poll_interval,
        ));
        worker.start();
        workers.insert(cfg.account_id, worker);
        Ok(())
    }

    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        for (account, worker) in workers.drain() {
            tracing::info!(account, "stopping worker");
            worker.stop().await;
        }
    }

    pub async fn take_order(&self, account_id: i64, external_id: &str) -> Result<(), MarketError> {
        let worker = self.ensure_worker(account_id).await?;
        worker.take_order(external_id).await
    }

    pub async fn complete_payment(
        &self,
        account_id: i64,
        payment_id: &str,
    ) -> Result<(), MarketError> {
        let worker = self.ensure_worker(account_id).await?;
        worker.complete_payment(payment_id).await
    }

    pub async fn cancel_payment(
        &self,
        account_id: i64,
        payment_id: &str,
    ) -> Result<(), MarketError> {
        let worker = self.ensure_worker(account_id).await?;
        worker.cancel_payment(payment_id).await
    }

    /// Fetch the account's worker, parking an unstarted empty-config one when
    /// none exists: operator buttons may arrive before any reload after a
    /// cold start and must route somewhere.
    async fn ensure_worker(&self, account_id: i64) -> Result<Arc<Worker>, MarketError> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(&account_id) {
            return Ok(Arc::clone(worker));
        }

        let cfg = WorkerConfig {
            account_id,
            ..Default::default()
        };
        let client = Arc::new(MarketClient::new(&self.base_url, "")?);
        let worker = Arc::new(Worker::new(
            cfg,
            client as Arc<dyn MarketApi>,
            Arc::clone(&self.notifier),
            self.base_url.clone(),
            None,
        ));
        workers.insert(account_id, Arc::clone(&worker));
        Ok(worker)
    }

    #[cfg(test)]
    pub(crate) async fn has_worker(&self, account_id: i64) -> bool {
        self.workers.lock().await.contains_key(&account_id)
    }
}
