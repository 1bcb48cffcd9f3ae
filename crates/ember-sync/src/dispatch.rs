//! Skeleton construction and multiplexed block download.
//!
//! A round covers one contiguous block range. The range is partitioned by a
//! sparse hash skeleton into chunk tasks with proven boundary hashes; tasks
//! are spread over the worker pool, failures are retried on other workers,
//! and completed chunks are inserted strictly in ascending order.

use crate::client::RequestClient;
use crate::status::PeerStatus;
use crate::{SyncConfig, SyncError, SyncResult};
use ember_chain::ChainStore;
use ember_types::{Block, Hash};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One contiguous download assignment: blocks `start_number ..= end_number`
/// with proven boundary hashes, plus its failure count.
#[derive(Debug, Clone)]
struct DownloadTask {
    start_number: u64,
    start_hash: Hash,
    end_number: u64,
    end_hash: Hash,
    errors: u32,
}

/// What a finished task sends back. An empty block list means the attempt
/// failed.
struct TaskOutcome {
    task: DownloadTask,
    worker: Arc<PeerStatus>,
    blocks: Vec<Block>,
}

/// Outcome of a full round.
pub(crate) struct RoundResult {
    /// Highest height up to which blocks are now contiguously inserted; the
    /// peer's new proven ancestor.
    pub ancestor: u64,
    /// Insert failure that cut the round short, if any.
    pub error: Option<SyncError>,
}

/// Skeleton sample heights for `start..=end` at the given stride.
fn skeleton_points(start: u64, end: u64, stride: u64) -> Vec<u64> {
    let mut points = Vec::new();
    let mut number = start;
    while number <= end {
        points.push(number);
        number += stride + 1;
    }
    points
}

/// Executes download rounds against the chain store.
pub(crate) struct TaskDispatcher {
    chain: Arc<dyn ChainStore>,
    client: RequestClient,
    config: SyncConfig,
}

impl TaskDispatcher {
    pub(crate) fn new(chain: Arc<dyn ChainStore>, client: RequestClient, config: SyncConfig) -> Self {
        Self {
            chain,
            client,
            config,
        }
    }

    /// Download `start..=end` from `peer`'s chain, spreading chunk tasks over
    /// `workers`.
    pub(crate) async fn run_round(
        &self,
        peer: &Arc<PeerStatus>,
        start: u64,
        end: u64,
        workers: Vec<Arc<PeerStatus>>,
    ) -> SyncResult<RoundResult> {
        let (numbers, hashes) = self.fetch_skeleton(peer, start, end).await?;
        debug!(
            peer = peer.station(),
            start,
            end,
            points = numbers.len(),
            "skeleton fetched"
        );
        self.execute(numbers, hashes, workers).await
    }

    /// Fetch the sparse skeleton of boundary hashes for the round.
    async fn fetch_skeleton(
        &self,
        peer: &Arc<PeerStatus>,
        start: u64,
        end: u64,
    ) -> SyncResult<(Vec<u64>, Vec<Hash>)> {
        let stride = self.config.skeleton_stride;
        let cancel = peer.disconnect_token();
        let mut numbers = skeleton_points(start, end, stride);
        let mut hashes = self
            .client
            .get_hashes(
                peer.station(),
                &cancel,
                start,
                numbers.len() as u64,
                stride,
                false,
            )
            .await?;
        if hashes.len() != numbers.len() {
            return Err(SyncError::MalformedReply(format!(
                "skeleton for {start}..={end} returned {} hashes, expected {}",
                hashes.len(),
                numbers.len()
            )));
        }
        if numbers.last() != Some(&end) {
            let tail = self
                .client
                .get_hashes(peer.station(), &cancel, end, 1, 0, false)
                .await?;
            if tail.len() != 1 {
                return Err(SyncError::MalformedReply(format!(
                    "tail hash at {end} returned {} hashes",
                    tail.len()
                )));
            }
            numbers.push(end);
            hashes.extend(tail);
        }
        // A single sample still yields one task.
        if numbers.len() == 1 {
            numbers.push(numbers[0]);
            hashes.push(hashes[0]);
        }
        Ok((numbers, hashes))
    }

    /// Run chunk tasks over the worker pool and insert the results in order.
    async fn execute(
        &self,
        numbers: Vec<u64>,
        hashes: Vec<Hash>,
        workers: Vec<Arc<PeerStatus>>,
    ) -> SyncResult<RoundResult> {
        // Both stacks are LIFO; tasks are pushed tip-first so the lowest
        // range is popped first.
        let mut tasks: Vec<DownloadTask> = Vec::with_capacity(numbers.len() - 1);
        for i in (1..numbers.len()).rev() {
            tasks.push(DownloadTask {
                start_number: numbers[i - 1],
                start_hash: hashes[i - 1],
                end_number: numbers[i],
                end_hash: hashes[i],
                errors: 0,
            });
        }
        let mut workers = workers;
        let (result_tx, mut result_rx) = mpsc::channel::<TaskOutcome>(self.config.max_parallel_tasks);
        let mut in_flight = 0usize;
        let mut completed: HashMap<u64, Vec<Block>> = HashMap::new();

        loop {
            while in_flight < self.config.max_parallel_tasks {
                let Some(worker) = workers.pop() else { break };
                let Some(task) = tasks.pop() else {
                    // A popped worker without a task goes straight back.
                    workers.push(worker);
                    break;
                };
                let client = self.client.clone();
                let tx = result_tx.clone();
                in_flight += 1;
                tokio::spawn(async move {
                    let outcome = run_task(task, worker, client).await;
                    let _ = tx.send(outcome).await;
                });
            }
            if in_flight == 0 {
                break;
            }
            let Some(outcome) = result_rx.recv().await else {
                break;
            };
            in_flight -= 1;
            if outcome.blocks.is_empty() {
                if outcome.task.errors > self.config.task_error_budget {
                    warn!(
                        start = outcome.task.start_number,
                        end = outcome.task.end_number,
                        errors = outcome.task.errors,
                        "task exhausted its error budget, aborting round"
                    );
                    tasks.clear();
                    continue;
                }
                // Retry on whichever worker frees up next; the failing worker
                // sits out the rest of the round.
                tasks.push(outcome.task);
            } else {
                completed.insert(outcome.task.start_number, outcome.blocks);
                workers.push(outcome.worker);
            }
        }

        self.insert_completed(&numbers, completed).await
    }

    /// Insert completed chunks strictly in ascending start order, stopping at
    /// the first gap.
    async fn insert_completed(
        &self,
        numbers: &[u64],
        mut completed: HashMap<u64, Vec<Block>>,
    ) -> SyncResult<RoundResult> {
        for &start in &numbers[..numbers.len() - 1] {
            let Some(blocks) = completed.remove(&start) else {
                return Ok(RoundResult {
                    ancestor: start.saturating_sub(1),
                    error: None,
                });
            };
            if let Err(first) = self.chain.insert_chain(&blocks) {
                warn!(start, %first, "insert failed, retrying once");
                tokio::time::sleep(self.config.insert_retry_delay).await;
                if let Err(err) = self.chain.insert_chain(&blocks) {
                    let resume = err.height().saturating_sub(1);
                    return Ok(RoundResult {
                        ancestor: resume,
                        error: Some(SyncError::ChainRejected {
                            height: err.height(),
                            reason: err.to_string(),
                        }),
                    });
                }
            }
        }
        Ok(RoundResult {
            ancestor: numbers.last().copied().unwrap_or_default(),
            error: None,
        })
    }
}

/// Fetch and assemble the blocks for one task. Failure leaves the outcome's
/// block list empty and bumps the task's error count.
async fn run_task(
    mut task: DownloadTask,
    worker: Arc<PeerStatus>,
    client: RequestClient,
) -> TaskOutcome {
    task.errors += 1;
    if worker.head().number < task.end_number {
        debug!(
            peer = worker.station(),
            end = task.end_number,
            peer_height = worker.head().number,
            "worker is behind the task range"
        );
        return TaskOutcome {
            task,
            worker,
            blocks: Vec::new(),
        };
    }
    let blocks = match fetch_blocks(&task, &worker, &client).await {
        Ok(blocks) => blocks,
        Err(err) => {
            debug!(
                peer = worker.station(),
                start = task.start_number,
                end = task.end_number,
                %err,
                "download task failed"
            );
            Vec::new()
        }
    };
    TaskOutcome {
        task,
        worker,
        blocks,
    }
}

async fn fetch_blocks(
    task: &DownloadTask,
    worker: &Arc<PeerStatus>,
    client: &RequestClient,
) -> SyncResult<Vec<Block>> {
    let peer = worker.station();
    let cancel = worker.disconnect_token();

    // Probe just the two boundary hashes before committing to the full fetch.
    let (amount, skip) = if task.end_number == task.start_number {
        (1, 0)
    } else {
        (2, task.end_number - task.start_number - 1)
    };
    let bounds = client
        .get_hashes(peer, &cancel, task.start_number, amount, skip, false)
        .await?;
    if bounds.len() as u64 != amount
        || bounds.first() != Some(&task.start_hash)
        || bounds.last() != Some(&task.end_hash)
    {
        return Err(SyncError::MalformedReply(format!(
            "boundary probe for {}..={} returned {} hashes, wanted {} bounded by {} / {}",
            task.start_number,
            task.end_number,
            bounds.len(),
            amount,
            task.start_hash,
            task.end_hash
        )));
    }

    let amount = task.end_number - task.start_number + 1;
    let headers = client
        .get_headers(peer, &cancel, task.start_number, amount, 0, false)
        .await?;
    if headers.len() as u64 != amount {
        return Err(SyncError::MalformedReply(format!(
            "header run for {}..={} returned {} headers, expected {}",
            task.start_number,
            task.end_number,
            headers.len(),
            amount
        )));
    }
    let first = &headers[0];
    let last = &headers[headers.len() - 1];
    if first.number != task.start_number
        || first.hash() != task.start_hash
        || last.number != task.end_number
        || last.hash() != task.end_hash
    {
        return Err(SyncError::MalformedReply(format!(
            "header run {}..{} ({} / {}) does not match task bounds {}..{} ({} / {})",
            first.number,
            last.number,
            first.hash(),
            last.hash(),
            task.start_number,
            task.end_number,
            task.start_hash,
            task.end_hash
        )));
    }
    for pair in headers.windows(2) {
        if pair[1].parent_hash != pair[0].hash() || pair[1].number != pair[0].number + 1 {
            return Err(SyncError::MalformedReply(format!(
                "header chain break at {}: parent {} does not link {}",
                pair[1].number,
                pair[1].parent_hash,
                pair[0].hash()
            )));
        }
    }

    // Headers hashing to zero stand for bodies that need no request.
    let wanted: Vec<Hash> = headers
        .iter()
        .map(|header| header.hash())
        .filter(|hash| !hash.is_zero())
        .collect();
    let bodies = if wanted.is_empty() {
        Vec::new()
    } else {
        client.get_bodies(peer, &cancel, wanted.clone()).await?
    };
    if bodies.len() != wanted.len() {
        return Err(SyncError::MalformedReply(format!(
            "asked for {} bodies, received {}",
            wanted.len(),
            bodies.len()
        )));
    }

    let mut bodies = bodies.into_iter();
    let mut blocks = Vec::with_capacity(headers.len());
    for header in headers {
        if header.hash().is_zero() {
            blocks.push(Block::from_header(header));
        } else {
            let body = bodies
                .next()
                .ok_or_else(|| SyncError::MalformedReply("body run exhausted early".into()))?;
            blocks.push(Block::with_body(header, body.transactions));
        }
    }
    Ok(blocks)
}
