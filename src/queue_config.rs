//! Queue families and sizing for the ingestion pipeline.
//!
//! Every producer funnels into one of four fixed Redis-backed queues. Within
//! a queue, items pop in (priority, enqueue-time) order; across queues there
//! is no ordering guarantee.

use serde::{Deserialize, Serialize};

/// The four queue families. Each owns a sorted set `queue:{name}` and a DLQ
/// list `dlq:{name}` in Redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    LivePoints,
    UploadPoints,
    FlymasterPoints,
    ScoringPoints,
}

pub const ALL_QUEUES: [QueueKind; 4] = [
    QueueKind::LivePoints,
    QueueKind::UploadPoints,
    QueueKind::FlymasterPoints,
    QueueKind::ScoringPoints,
];

impl QueueKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::LivePoints => "live_points",
            QueueKind::UploadPoints => "upload_points",
            QueueKind::FlymasterPoints => "flymaster_points",
            QueueKind::ScoringPoints => "scoring_points",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live_points" => Some(QueueKind::LivePoints),
            "upload_points" => Some(QueueKind::UploadPoints),
            "flymaster_points" => Some(QueueKind::FlymasterPoints),
            "scoring_points" => Some(QueueKind::ScoringPoints),
            _ => None,
        }
    }

    /// Lower pops sooner. Live positions beat uploads and scoring; bulk
    /// device dumps drain last.
    pub fn priority(&self) -> i64 {
        match self {
            QueueKind::LivePoints => 1,
            QueueKind::UploadPoints => 2,
            QueueKind::ScoringPoints => 2,
            QueueKind::FlymasterPoints => 3,
        }
    }

    pub fn key(&self) -> String {
        format!("queue:{}", self.name())
    }

    pub fn dlq_key(&self) -> String {
        format!("dlq:{}", self.name())
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Sizing constants
// ============================================================================

/// Items pulled per writer loop iteration.
pub const DEQUEUE_BATCH_SIZE: usize = 500;

/// Hard cap on points per insert transaction.
pub const MAX_POINTS_PER_INSERT: usize = 1_000;

/// Transient failures are retried this many times before an item lands in
/// the DLQ with reason `max_retries`.
pub const MAX_RETRIES: u32 = 3;

/// Ceiling on the exponential retry backoff.
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Sustained-load target: the live queue's pending count should stay below
/// this; the monitoring surface reports it.
pub const LIVE_PENDING_TARGET: u64 = 1_000;

/// Redis operation timeout.
pub const KV_OP_TIMEOUT_SECS: u64 = 2;

/// Writer batch timeout (dequeue through commit).
pub const WRITER_BATCH_TIMEOUT_SECS: u64 = 30;

/// Sleep for `min(MAX_BACKOFF_SECS, 2^retry_count)` seconds before
/// re-enqueueing a transiently failed item.
pub const fn retry_backoff_secs(retry_count: u32) -> u64 {
    let exp = if retry_count >= 6 {
        MAX_BACKOFF_SECS
    } else {
        1u64 << retry_count
    };
    if exp > MAX_BACKOFF_SECS { MAX_BACKOFF_SECS } else { exp }
}
