use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dnsdrop::{AckUpload, ChunkUpload, EndpointId, MessageKey};

#[derive(Debug, Clone)]
pub(crate) struct RelayCfg {
    pub(crate) message_ttl_ms: u128,
    pub(crate) ack_ttl_ms: u128,
    pub(crate) backoff_start: u32,
    pub(crate) backoff_min_ms: u64,
    pub(crate) backoff_max_ms: u64,
}

/// One stored chunk. Envelopes are created on upload and never mutated.
#[derive(Debug)]
struct Envelope {
    payload: String,
    received_at: u128,
}

/// Everything the relay tracks for one `(rid, MessageKey)`: the chunk set
/// plus the send-side cursor and backoff state.
#[derive(Debug)]
struct MessageState {
    chunks: BTreeMap<u16, Envelope>,
    first_seen_at: u128,
    send_first_at: Option<u128>,
    send_cursor: u16,
    send_count: u32,
    last_sent_at: u128,
    next_eligible_at: u128,
}

impl MessageState {
    fn new(now: u128) -> Self {
        Self {
            chunks: BTreeMap::new(),
            first_seen_at: now,
            send_first_at: None,
            send_cursor: 1,
            send_count: 0,
            last_sent_at: 0,
            next_eligible_at: 0,
        }
    }
}

struct RelayInner {
    mailboxes: HashMap<EndpointId, BTreeMap<MessageKey, MessageState>>,
    delivery_acks: HashMap<EndpointId, VecDeque<String>>,
    ack_seen: HashMap<MessageKey, u128>,
    rng: fastrand::Rng,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) queries: AtomicU64,
    pub(crate) polls: AtomicU64,
    pub(crate) polls_nop: AtomicU64,
    pub(crate) chunks: AtomicU64,
    pub(crate) chunk_dup: AtomicU64,
    pub(crate) chunk_late: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) acks: AtomicU64,
    pub(crate) ack_dup: AtomicU64,
    pub(crate) parse_fail: AtomicU64,
    pub(crate) ignored: AtomicU64,
    pub(crate) queue_drop: AtomicU64,
    pub(crate) send_fail: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CounterSnapshot {
    pub(crate) queries: u64,
    pub(crate) polls: u64,
    pub(crate) polls_nop: u64,
    pub(crate) chunks: u64,
    pub(crate) chunk_dup: u64,
    pub(crate) chunk_late: u64,
    pub(crate) completed: u64,
    pub(crate) acks: u64,
    pub(crate) ack_dup: u64,
    pub(crate) parse_fail: u64,
    pub(crate) ignored: u64,
    pub(crate) queue_drop: u64,
    pub(crate) send_fail: u64,
}

impl Counters {
    pub(crate) fn bump(field: &AtomicU64) {
        field.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            polls_nop: self.polls_nop.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            chunk_dup: self.chunk_dup.load(Ordering::Relaxed),
            chunk_late: self.chunk_late.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            ack_dup: self.ack_dup.load(Ordering::Relaxed),
            parse_fail: self.parse_fail.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            queue_drop: self.queue_drop.load(Ordering::Relaxed),
            send_fail: self.send_fail.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one chunk upload.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    Stored { have: usize },
    Completed { latency_ms: u128 },
    Duplicate,
    /// The message was already acknowledged; the mailbox was not touched.
    Suppressed,
}

/// Outcome of one delivery-ack upload. `purged` counts envelopes removed
/// across every receiver still holding the message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    Queued { purged: usize },
    Duplicate { purged: usize },
}

/// What a poll gets back: a pending delivery ack, the next chunk, or `NOP`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollReply {
    Ack(String),
    Chunk { text: String },
    Nop,
}

impl PollReply {
    pub(crate) fn text(&self) -> &str {
        match self {
            PollReply::Ack(t) => t,
            PollReply::Chunk { text } => text,
            PollReply::Nop => dnsdrop::POLL_NOP,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            PollReply::Ack(_) => "ack",
            PollReply::Chunk { .. } => "chunk",
            PollReply::Nop => "nop",
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SweepStats {
    pub(crate) expired_chunks: usize,
    pub(crate) removed_keys: usize,
    pub(crate) removed_receivers: usize,
    pub(crate) expired_acks: usize,
}

impl SweepStats {
    pub(crate) fn is_noop(&self) -> bool {
        *self == SweepStats::default()
    }
}

/// Current store sizes, reported alongside the counter snapshot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Gauges {
    pub(crate) receivers: usize,
    pub(crate) messages: usize,
    pub(crate) chunks: usize,
    pub(crate) acks_queued: usize,
    pub(crate) ack_seen: usize,
}

/// The whole relay state: one lock over the mailbox maps, plus lock-free
/// counters. All methods take `now` in epoch milliseconds so the state
/// machine stays deterministic under test.
pub(crate) struct Relay {
    cfg: RelayCfg,
    inner: Mutex<RelayInner>,
    pub(crate) counters: Counters,
}

impl Relay {
    pub(crate) fn new(cfg: RelayCfg) -> Self {
        Self::with_rng(cfg, fastrand::Rng::new())
    }

    /// Deterministic jitter for tests.
    pub(crate) fn with_seed(cfg: RelayCfg, seed: u64) -> Self {
        Self::with_rng(cfg, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(cfg: RelayCfg, rng: fastrand::Rng) -> Self {
        Self {
            cfg,
            inner: Mutex::new(RelayInner {
                mailboxes: HashMap::new(),
                delivery_acks: HashMap::new(),
                ack_seen: HashMap::new(),
                rng,
            }),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ack_is_fresh(ack_seen: &HashMap<MessageKey, u128>, key: &MessageKey, now: u128, ttl: u128) -> bool {
        matches!(ack_seen.get(key), Some(&t) if now.saturating_sub(t) <= ttl)
    }

    /// Stores one uploaded chunk under `(rid, key)`.
    pub(crate) fn ingest_chunk(&self, up: ChunkUpload, now: u128) -> ChunkOutcome {
        let mut inner = self.lock();
        if Self::ack_is_fresh(&inner.ack_seen, &up.key, now, self.cfg.ack_ttl_ms) {
            Counters::bump(&self.counters.chunk_late);
            return ChunkOutcome::Suppressed;
        }
        let key = up.key;
        let msg = inner
            .mailboxes
            .entry(up.rid)
            .or_default()
            .entry(key)
            .or_insert_with(|| MessageState::new(now));
        if msg.chunks.contains_key(&up.idx) {
            Counters::bump(&self.counters.chunk_dup);
            return ChunkOutcome::Duplicate;
        }
        msg.chunks.insert(
            up.idx,
            Envelope {
                payload: up.payload,
                received_at: now,
            },
        );
        Counters::bump(&self.counters.chunks);
        let have = msg.chunks.len();
        if have == key.tot as usize {
            let latency_ms = now.saturating_sub(msg.first_seen_at);
            Counters::bump(&self.counters.completed);
            ChunkOutcome::Completed { latency_ms }
        } else {
            ChunkOutcome::Stored { have }
        }
    }

    /// Handles an end-to-end delivery ack: queues the token for the
    /// original sender (deduped within the ack TTL), marks the key as
    /// delivered, and purges the message from every mailbox holding it.
    pub(crate) fn ingest_ack(&self, ack: AckUpload, now: u128) -> AckOutcome {
        let mut inner = self.lock();
        let fresh = Self::ack_is_fresh(&inner.ack_seen, &ack.key, now, self.cfg.ack_ttl_ms);
        inner.ack_seen.insert(ack.key, now);
        let purged = purge_key(&mut inner.mailboxes, &ack.key);
        if fresh {
            Counters::bump(&self.counters.ack_dup);
            AckOutcome::Duplicate { purged }
        } else {
            inner
                .delivery_acks
                .entry(ack.key.sid)
                .or_default()
                .push_back(ack.key.ack_token());
            Counters::bump(&self.counters.acks);
            AckOutcome::Queued { purged }
        }
    }

    /// Answers one poll from `rid`: a pending delivery ack wins, then the
    /// next eligible chunk (round-robin cursor per key, backoff-gated),
    /// else `NOP`.
    pub(crate) fn poll(&self, rid: EndpointId, now: u128) -> PollReply {
        Counters::bump(&self.counters.polls);
        let cfg = &self.cfg;
        let mut inner = self.lock();
        let RelayInner {
            mailboxes,
            delivery_acks,
            ack_seen,
            rng,
        } = &mut *inner;

        if let Some(q) = delivery_acks.get_mut(&rid) {
            let tok = q.pop_front();
            if q.is_empty() {
                delivery_acks.remove(&rid);
            }
            if let Some(tok) = tok {
                return PollReply::Ack(tok);
            }
        }

        let mut reply = PollReply::Nop;
        if let Some(boxes) = mailboxes.get_mut(&rid) {
            let mut acked: Vec<MessageKey> = Vec::new();
            let mut pick: Option<MessageKey> = None;
            for (key, msg) in boxes.iter() {
                // A late ack may have landed since this key was stored.
                if Self::ack_is_fresh(ack_seen, key, now, cfg.ack_ttl_ms) {
                    acked.push(*key);
                    continue;
                }
                if now < msg.next_eligible_at {
                    continue;
                }
                pick = Some(*key);
                break;
            }
            for key in &acked {
                boxes.remove(key);
            }
            if let Some(key) = pick
                && let Some(msg) = boxes.get_mut(&key)
            {
                let idx = if msg.chunks.contains_key(&msg.send_cursor) {
                    msg.send_cursor
                } else {
                    // Cursor points at an index that never arrived; restart
                    // from the lowest stored one.
                    msg.chunks.keys().next().copied().unwrap_or(msg.send_cursor)
                };
                if let Some(env) = msg.chunks.get(&idx) {
                    let text = ChunkUpload {
                        rid,
                        key,
                        idx,
                        payload: env.payload.clone(),
                    }
                    .to_label();
                    msg.send_first_at.get_or_insert(now);
                    msg.send_count += 1;
                    msg.last_sent_at = now;
                    msg.next_eligible_at = now + backoff_window(cfg, msg.send_count, rng);
                    msg.send_cursor = if idx >= key.tot { 1 } else { idx + 1 };
                    reply = PollReply::Chunk { text };
                }
            }
            if boxes.is_empty() {
                mailboxes.remove(&rid);
            }
        }

        if reply == PollReply::Nop {
            Counters::bump(&self.counters.polls_nop);
        }
        reply
    }

    /// TTL sweep: drops envelopes past the message TTL, then empty keys and
    /// receivers, then stale ack-seen entries.
    pub(crate) fn sweep(&self, now: u128) -> SweepStats {
        let mut st = SweepStats::default();
        let mut inner = self.lock();
        let message_ttl = self.cfg.message_ttl_ms;
        inner.mailboxes.retain(|_, boxes| {
            boxes.retain(|_, msg| {
                let before = msg.chunks.len();
                msg.chunks
                    .retain(|_, env| now.saturating_sub(env.received_at) <= message_ttl);
                st.expired_chunks += before - msg.chunks.len();
                if msg.chunks.is_empty() {
                    st.removed_keys += 1;
                    false
                } else {
                    true
                }
            });
            if boxes.is_empty() {
                st.removed_receivers += 1;
                false
            } else {
                true
            }
        });
        let ack_ttl = self.cfg.ack_ttl_ms;
        let before = inner.ack_seen.len();
        inner
            .ack_seen
            .retain(|_, &mut t| now.saturating_sub(t) <= ack_ttl);
        st.expired_acks = before - inner.ack_seen.len();
        st
    }

    pub(crate) fn gauges(&self) -> Gauges {
        let inner = self.lock();
        Gauges {
            receivers: inner.mailboxes.len(),
            messages: inner.mailboxes.values().map(|b| b.len()).sum(),
            chunks: inner
                .mailboxes
                .values()
                .flat_map(|b| b.values())
                .map(|m| m.chunks.len())
                .sum(),
            acks_queued: inner.delivery_acks.values().map(|q| q.len()).sum(),
            ack_seen: inner.ack_seen.len(),
        }
    }
}

fn purge_key(
    mailboxes: &mut HashMap<EndpointId, BTreeMap<MessageKey, MessageState>>,
    key: &MessageKey,
) -> usize {
    let mut purged = 0;
    mailboxes.retain(|_, boxes| {
        if let Some(msg) = boxes.remove(key) {
            purged += msg.chunks.len();
        }
        !boxes.is_empty()
    });
    purged
}

/// Backoff window after the `count`-th emission of a key. Below the start
/// threshold there is no delay; past it the delay doubles per step, clamped
/// to the configured range, plus uniform jitter in `[min, delay]`.
fn backoff_window(cfg: &RelayCfg, count: u32, rng: &mut fastrand::Rng) -> u128 {
    if count < cfg.backoff_start {
        return 0;
    }
    let step = count - cfg.backoff_start;
    let base = 1000u64.checked_shl(step).unwrap_or(u64::MAX);
    let delay = base.clamp(cfg.backoff_min_ms, cfg.backoff_max_ms.max(cfg.backoff_min_ms));
    let jitter = rng.u64(cfg.backoff_min_ms..=delay);
    (delay + jitter) as u128
}
