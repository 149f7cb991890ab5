//! Semantic response cache keyed by a normalized prompt fingerprint.
//!
//! The key is stable under whitespace and case changes and under reordering
//! of retrieved docs. Writes happen only from the post-call pipeline on
//! clean terminal outcomes; concurrent misses for the same fingerprint
//! coalesce onto a single in-flight fill.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::util::{fnv1a_64, push_u64_hex_16, unix_now_secs};

const MAX_CACHED_TEXT_BYTES: usize = 16 * 1024;

/// Hash of text normalized for fingerprinting: lowercased, whitespace runs
/// collapsed to single spaces, leading/trailing whitespace dropped.
#[must_use]
pub fn normalized_hash(text: &str) -> u64 {
    let mut normalized = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !normalized.is_empty() {
            normalized.push(' ');
        }
        pending_space = false;
        for lowered in ch.to_lowercase() {
            normalized.push(lowered);
        }
    }
    fnv1a_64(normalized.as_bytes())
}

/// Compose the versioned cache id: `v1|model|prompt_hash|sorted doc hashes`.
#[must_use]
pub fn compose_cache_id(model: &str, prompt: &str, retrieved_docs: &[String]) -> String {
    let mut doc_hashes: Vec<String> = retrieved_docs
        .iter()
        .map(|doc| {
            let mut hex = String::with_capacity(16);
            push_u64_hex_16(&mut hex, normalized_hash(doc));
            hex
        })
        .collect();
    doc_hashes.sort_unstable();

    let mut prompt_hex = String::with_capacity(16);
    push_u64_hex_16(&mut prompt_hex, normalized_hash(prompt));
    format!("v1|{model}|{prompt_hex}|{}", doc_hashes.join(","))
}

#[derive(Debug, Clone)]
struct CacheSlot {
    text: String,
    stored_ts: u64,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub text: String,
    pub age_secs: u64,
}

/// Outcome of a single-flight registration for one cache id.
pub enum FillTicket {
    /// This caller builds the response; completing or dropping the guard
    /// releases any followers.
    Leader(FillGuard),
    /// Another fill for the same id is in flight; await the receiver, then
    /// re-lookup.
    Follower(watch::Receiver<bool>),
}

pub struct FillGuard {
    cache: Arc<SingleFlightTable>,
    cache_id: String,
    done_tx: watch::Sender<bool>,
}

impl Drop for FillGuard {
    fn drop(&mut self) {
        self.cache.inflight.lock().remove(&self.cache_id);
        let _ = self.done_tx.send(true);
    }
}

#[derive(Debug, Default)]
struct SingleFlightTable {
    inflight: Mutex<FxHashMap<String, watch::Receiver<bool>>>,
}

#[derive(Default)]
pub struct SemanticCache {
    entries: Mutex<FxHashMap<String, CacheSlot>>,
    single_flight: Arc<SingleFlightTable>,
}

impl SemanticCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fingerprint. Expired entries read as misses; the slot is
    /// reclaimed by the next write sweep. Never mutates, so replay can share
    /// this path.
    #[must_use]
    pub fn lookup(&self, cache_id: &str, ttl_secs: u64) -> Option<CacheHit> {
        let entries = self.entries.lock();
        let slot = entries.get(cache_id)?;
        let age = unix_now_secs().saturating_sub(slot.stored_ts);
        if age >= ttl_secs {
            return None;
        }
        Some(CacheHit {
            text: slot.text.clone(),
            age_secs: age,
        })
    }

    /// Store a terminal response. Oversized texts are skipped; when the map
    /// exceeds `max_entries` the oldest slots are evicted.
    pub fn write_through(&self, cache_id: &str, text: &str, max_entries: usize) {
        if text.is_empty() || text.len() > MAX_CACHED_TEXT_BYTES {
            return;
        }
        let mut entries = self.entries.lock();
        entries.insert(
            cache_id.to_string(),
            CacheSlot {
                text: text.to_string(),
                stored_ts: unix_now_secs(),
            },
        );
        if entries.len() > max_entries {
            evict_oldest(&mut entries, max_entries);
        }
    }

    /// Register interest in filling `cache_id`. The first caller becomes the
    /// leader; everyone else becomes a follower of that fill.
    #[must_use]
    pub fn begin_fill(&self, cache_id: &str) -> FillTicket {
        let mut inflight = self.single_flight.inflight.lock();
        if let Some(receiver) = inflight.get(cache_id) {
            return FillTicket::Follower(receiver.clone());
        }
        let (done_tx, done_rx) = watch::channel(false);
        inflight.insert(cache_id.to_string(), done_rx);
        FillTicket::Leader(FillGuard {
            cache: Arc::clone(&self.single_flight),
            cache_id: cache_id.to_string(),
            done_tx,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_oldest(entries: &mut FxHashMap<String, CacheSlot>, max_entries: usize) {
    while entries.len() > max_entries {
        let Some(oldest_key) = entries
            .iter()
            .min_by_key(|(_, slot)| slot.stored_ts)
            .map(|(key, _)| key.clone())
        else {
            return;
        };
        entries.remove(&oldest_key);
    }
}

/// Await the completion of another caller's in-flight fill.
pub async fn wait_for_fill(mut receiver: watch::Receiver<bool>) {
    if *receiver.borrow() {
        return;
    }
    // The sender side always flips to true on guard drop.
    let _ = receiver.changed().await;
}
