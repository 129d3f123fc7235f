//! Batched, rate-limited dispatch of classification candidates
//!
//! Candidates arrive through a bounded channel and accumulate until the
//! batch is full or the flush deadline passes. One batch is in flight at a
//! time; the pacer guard enforces the inter-batch delay between provider
//! calls. Throttled batches are requeued after a fixed delay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, ClassifierError};
use crate::enrichment::WhoisService;
use crate::models::{
    Analysis, Anomaly, AnomalyStatus, Classification, QueryRecord, Verdict, WhoisRecord,
};
use crate::store::Store;

/// Tunables for batching and pacing.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Inbound channel capacity; submissions beyond it are dropped
    pub queue_capacity: usize,
    /// Dispatch immediately once this many candidates accumulate
    pub batch_size: usize,
    /// Dispatch whatever is present this long after the first candidate
    pub flush_interval: Duration,
    /// Minimum gap between the end of one provider call and the next
    pub inter_batch_delay: Duration,
    /// How long throttled candidates wait before resubmission
    pub requeue_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            batch_size: 20,
            flush_interval: Duration::from_secs(60),
            inter_batch_delay: Duration::from_secs(60),
            requeue_delay: Duration::from_secs(30),
        }
    }
}

/// Counter snapshot for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub submitted: u64,
    /// Submissions rejected because the queue was full
    pub dropped: u64,
    /// Submissions rejected because the dispatcher had already stopped
    pub discarded: u64,
    pub batches_run: u64,
    pub analyses_ok: u64,
    pub analyses_failed: u64,
    pub throttled: u64,
    pub queue_depth: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    batches_run: AtomicU64,
    analyses_ok: AtomicU64,
    analyses_failed: AtomicU64,
    throttled: AtomicU64,
}

/// Everything a dispatch needs, shared between the worker and the batch
/// tasks it spawns.
struct DispatchCtx {
    classifier: Arc<dyn Classifier>,
    whois: Arc<WhoisService>,
    store: Arc<Store>,
    config: DispatcherConfig,
    counters: Arc<Counters>,
    tx: mpsc::Sender<QueryRecord>,
    shutdown_rx: watch::Receiver<bool>,
    /// End time of the last provider call; the guard is the inter-batch
    /// token, so holding it also keeps one batch in flight
    pacer: tokio::sync::Mutex<Option<Instant>>,
}

/// Accepts candidates and runs the batching worker.
pub struct Dispatcher {
    tx: mpsc::Sender<QueryRecord>,
    counters: Arc<Counters>,
    config: DispatcherConfig,
    shutdown_tx: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        whois: Arc<WhoisService>,
        store: Arc<Store>,
        config: DispatcherConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let ctx = Arc::new(DispatchCtx {
            classifier,
            whois,
            store,
            config: config.clone(),
            counters: Arc::clone(&counters),
            tx: tx.clone(),
            shutdown_rx,
            pacer: tokio::sync::Mutex::new(None),
        });

        let worker = tokio::spawn(worker_loop(rx, ctx));
        info!(
            batch_size = config.batch_size,
            flush_secs = config.flush_interval.as_secs(),
            delay_secs = config.inter_batch_delay.as_secs(),
            "Dispatcher started"
        );

        Self {
            tx,
            counters,
            config,
            shutdown_tx,
            worker: parking_lot::Mutex::new(Some(worker)),
        }
    }

    /// Queue a candidate for classification. Non-blocking; a full queue
    /// drops the submission and records the event.
    pub fn submit(&self, record: QueryRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(domain = %record.domain, "Dispatch queue full, dropping candidate");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(domain = %record.domain, "Dispatcher stopped, discarding candidate");
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            batches_run: self.counters.batches_run.load(Ordering::Relaxed),
            analyses_ok: self.counters.analyses_ok.load(Ordering::Relaxed),
            analyses_failed: self.counters.analyses_failed.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
            queue_depth: self.config.queue_capacity.saturating_sub(self.tx.capacity()),
        }
    }

    /// Drain the accumulator into one final batch, then stop the worker.
    /// Candidates still in the queue or requeued later are discarded.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher worker panicked");
            }
        }
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<QueryRecord>, ctx: Arc<DispatchCtx>) {
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let mut batch: Vec<QueryRecord> = Vec::with_capacity(ctx.config.batch_size);
    let mut deadline: Option<Instant> = None;
    let mut inflight = JoinSet::new();

    loop {
        let flush_deadline = deadline;
        let flush_timer = async move {
            match flush_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown_rx.wait_for(|stopped| *stopped) => break,

            received = rx.recv() => {
                let Some(record) = received else { break };
                if batch.is_empty() {
                    deadline = Some(Instant::now() + ctx.config.flush_interval);
                }
                batch.push(record);
                if batch.len() >= ctx.config.batch_size {
                    let full = std::mem::take(&mut batch);
                    deadline = None;
                    debug!(count = full.len(), "Batch full, dispatching");
                    let ctx = Arc::clone(&ctx);
                    inflight.spawn(async move { dispatch_batch(ctx, full).await });
                }
            }

            _ = flush_timer => {
                deadline = None;
                if !batch.is_empty() {
                    let due = std::mem::take(&mut batch);
                    debug!(count = due.len(), "Flush deadline reached, dispatching");
                    let ctx = Arc::clone(&ctx);
                    inflight.spawn(async move { dispatch_batch(ctx, due).await });
                }
            }
        }
    }

    if !batch.is_empty() {
        info!(count = batch.len(), "Dispatching final batch on shutdown");
        dispatch_batch(Arc::clone(&ctx), std::mem::take(&mut batch)).await;
    }
    while inflight.join_next().await.is_some() {}
    info!("Dispatcher worker stopped");
}

/// Run one batch through enrichment, pacing, classification, persistence.
async fn dispatch_batch(ctx: Arc<DispatchCtx>, batch: Vec<QueryRecord>) {
    ctx.counters.batches_run.fetch_add(1, Ordering::Relaxed);
    info!(count = batch.len(), "Processing batch");

    // One WHOIS lookup per distinct domain; the cache absorbs repeats
    let mut whois: HashMap<String, WhoisRecord> = HashMap::new();
    for query in &batch {
        if !whois.contains_key(&query.domain) {
            let record = ctx.whois.lookup(&query.domain).await;
            whois.insert(query.domain.clone(), record);
        }
    }

    // Acquire the inter-batch token. The guard is held through the provider
    // call, so at most one batch is in flight.
    let mut last_end = ctx.pacer.lock().await;
    if let Some(prev) = *last_end {
        let resume_at = prev + ctx.config.inter_batch_delay;
        if resume_at > Instant::now() {
            tokio::time::sleep_until(resume_at).await;
        }
    }

    let analyzed_at = Utc::now();
    if ctx.classifier.supports_batch() {
        match ctx.classifier.classify_many(&batch, &whois).await {
            Ok(verdicts) => {
                for (query, verdict) in batch.iter().zip(verdicts.iter()) {
                    persist_verdict(&ctx, query, verdict, analyzed_at);
                }
            }
            Err(ClassifierError::Throttled) => {
                ctx.counters.throttled.fetch_add(1, Ordering::Relaxed);
                ctx.counters
                    .analyses_failed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                warn!(count = batch.len(), "Batch throttled, requeueing");
                requeue_later(&ctx, batch);
            }
            Err(e) => {
                ctx.counters
                    .analyses_failed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                error!(count = batch.len(), error = %e, "Batch classification failed");
            }
        }
    } else {
        for (i, query) in batch.iter().enumerate() {
            match ctx
                .classifier
                .classify_one(query, whois.get(&query.domain))
                .await
            {
                Ok(verdict) => persist_verdict(&ctx, query, &verdict, analyzed_at),
                Err(ClassifierError::Throttled) => {
                    ctx.counters.throttled.fetch_add(1, Ordering::Relaxed);
                    ctx.counters
                        .analyses_failed
                        .fetch_add((batch.len() - i) as u64, Ordering::Relaxed);
                    warn!(
                        remaining = batch.len() - i,
                        "Throttled mid-batch, requeueing remainder"
                    );
                    requeue_later(&ctx, batch[i..].to_vec());
                    break;
                }
                Err(e) => {
                    ctx.counters.analyses_failed.fetch_add(1, Ordering::Relaxed);
                    error!(domain = %query.domain, error = %e, "Classification failed");
                }
            }
        }
    }

    // Release the token; this instant is the delay base for the next batch
    *last_end = Some(Instant::now());
}

/// Persist one verdict: always an analysis, and an anomaly when non-Safe.
/// `analyzed_at` is shared across the batch so duplicate (client, domain)
/// pairs upsert the same anomaly id.
fn persist_verdict(
    ctx: &DispatchCtx,
    query: &QueryRecord,
    verdict: &Verdict,
    analyzed_at: chrono::DateTime<Utc>,
) {
    let analysis = Analysis {
        domain: query.domain.clone(),
        client_id: query.client_id.clone(),
        client_name: query.client_name.clone(),
        classification: verdict.classification,
        explanation: verdict.explanation.clone(),
        risk_score: verdict.risk_score,
        suggested_action: verdict.suggested_action,
        analyzed_at,
        provider: ctx.classifier.name().to_string(),
        query_type: query.query_type.clone(),
    };

    if let Err(e) = ctx.store.analysis_append(&analysis) {
        warn!(domain = %query.domain, error = %e, "Failed to save analysis");
        ctx.counters.analyses_failed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    if matches!(
        verdict.classification,
        Classification::Suspicious | Classification::Malicious
    ) {
        let anomaly = Anomaly {
            id: Anomaly::make_id(&query.client_id, &query.domain, analyzed_at),
            domain: query.domain.clone(),
            client_id: query.client_id.clone(),
            client_name: query.client_name.clone(),
            query_type: query.query_type.clone(),
            classification: verdict.classification,
            risk_score: verdict.risk_score,
            explanation: verdict.explanation.clone(),
            suggested_action: verdict.suggested_action,
            detected_at: analyzed_at,
            status: AnomalyStatus::Pending,
        };
        match ctx.store.anomaly_put(&anomaly) {
            Ok(()) => info!(
                domain = %query.domain,
                classification = ?verdict.classification,
                risk_score = verdict.risk_score,
                "Anomaly recorded"
            ),
            Err(e) => warn!(domain = %query.domain, error = %e, "Failed to save anomaly"),
        }
    }

    ctx.counters.analyses_ok.fetch_add(1, Ordering::Relaxed);
}

/// Resubmit candidates after the requeue delay. The timer races shutdown,
/// so stopping never waits on a sleeping requeue; late items are discarded.
fn requeue_later(ctx: &DispatchCtx, items: Vec<QueryRecord>) {
    let tx = ctx.tx.clone();
    let delay = ctx.config.requeue_delay;
    let counters = Arc::clone(&ctx.counters);
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                for record in items {
                    match tx.try_send(record) {
                        Ok(()) => {
                            counters.submitted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Full(record)) => {
                            counters.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(domain = %record.domain, "Dispatch queue full, dropping requeued candidate");
                        }
                        Err(mpsc::error::TrySendError::Closed(record)) => {
                            counters.discarded.fetch_add(1, Ordering::Relaxed);
                            debug!(domain = %record.domain, "Dispatcher stopped, discarding requeued candidate");
                        }
                    }
                }
            }
            _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
        }
    });
}
