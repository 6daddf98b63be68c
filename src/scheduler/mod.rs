use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::descriptor::EndpointDescriptor;
use crate::probe::{ProbeOutcome, Prober};

type WorkQueue = Arc<Mutex<VecDeque<(usize, Arc<EndpointDescriptor>)>>>;

/// Probe every endpoint with at most `concurrency_limit` probes in flight.
///
/// Outcomes come back in completion order, one per endpoint. With a
/// `batch_deadline`, probes still running when it passes are dropped and,
/// like endpoints never started, reported as `NotAttempted`.
pub async fn run_all(
    prober: Arc<dyn Prober>,
    endpoints: Vec<Arc<EndpointDescriptor>>,
    concurrency_limit: usize,
    batch_deadline: Option<Duration>,
) -> Vec<ProbeOutcome> {
    let total = endpoints.len();
    if total == 0 {
        return Vec::new();
    }

    let deadline = batch_deadline.map(|d| Instant::now() + d);
    let queue: WorkQueue = Arc::new(Mutex::new(
        endpoints.iter().cloned().enumerate().collect(),
    ));
    let (tx, mut rx) = mpsc::channel(total);

    let workers = concurrency_limit.clamp(1, total);
    log::debug!("probing {total} endpoints with {workers} workers");

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let prober = prober.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            worker(queue, prober, tx, deadline).await;
        }));
    }
    drop(tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }

    for handle in handles {
        if let Err(e) = handle.await {
            log::warn!("probe worker stopped abnormally: {e}");
        }
    }

    if outcomes.len() < total {
        let mut seen = vec![false; total];
        for outcome in &outcomes {
            seen[outcome.index] = true;
        }
        for (index, endpoint) in endpoints.into_iter().enumerate() {
            if !seen[index] {
                log::warn!("no outcome for {}, marking not attempted", endpoint.authority());
                outcomes.push(ProbeOutcome::not_attempted(index, endpoint));
            }
        }
    }

    outcomes
}

async fn worker(
    queue: WorkQueue,
    prober: Arc<dyn Prober>,
    tx: mpsc::Sender<ProbeOutcome>,
    deadline: Option<Instant>,
) {
    loop {
        let next = queue.lock().await.pop_front();
        let Some((index, endpoint)) = next else {
            break;
        };

        let outcome = match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                ProbeOutcome::not_attempted(index, endpoint)
            }
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, prober.probe(index, endpoint.clone())).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::not_attempted(index, endpoint),
                }
            }
            None => prober.probe(index, endpoint).await,
        };

        if tx.send(outcome).await.is_err() {
            break;
        }
    }
}
