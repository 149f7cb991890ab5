//! Bounded extraction of durable user facts and factual claims.
//!
//! Extraction is a deterministic pattern scan over a capped slice of the
//! conversation. Persistent backends are external collaborators; these
//! stores hold what the post-call pipeline hands them.

use std::collections::VecDeque;
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex_lite::Regex;

/// Work budget: extraction never scans past this many bytes.
const EXTRACTION_SCAN_BYTES: usize = 4096;
const MAX_ITEMS_PER_REQUEST: usize = 5;
const STORE_MAX_ENTRIES: usize = 512;
const MIN_CLAIM_WORDS: usize = 5;

static FACT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bmy name is ([a-z][a-z '\-]{1,40})",
        r"(?i)\bcall me ([a-z][a-z '\-]{1,40})",
        r"(?i)\bi live in ([a-z][a-z ,'\-]{1,60})",
        r"(?i)\bi work (?:at|for) ([a-z0-9][a-z0-9 ,'\-]{1,60})",
        r"(?i)\bremember that (.{3,120})",
        r"(?i)\bmy favorite [a-z]+ is (.{2,60})",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("fact pattern compiles"))
    .collect()
});

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredItem {
    pub user_id: String,
    pub text: String,
    pub ts: u64,
}

/// FIFO-bounded store shared by memory facts and claims.
#[derive(Debug, Default)]
pub struct FactStore {
    items: Mutex<VecDeque<StoredItem>>,
}

impl FactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, user_id: &str, texts: &[String]) {
        if texts.is_empty() {
            return;
        }
        let ts = crate::util::unix_now_secs();
        let mut items = self.items.lock();
        for text in texts {
            items.push_back(StoredItem {
                user_id: user_id.to_string(),
                text: text.clone(),
                ts,
            });
        }
        while items.len() > STORE_MAX_ENTRIES {
            items.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn for_user(&self, user_id: &str) -> Vec<StoredItem> {
        self.items
            .lock()
            .iter()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect()
    }
}

fn capped(text: &str) -> &str {
    if text.len() <= EXTRACTION_SCAN_BYTES {
        return text;
    }
    // Cut on a char boundary at or below the cap.
    let mut end = EXTRACTION_SCAN_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Pull durable user facts out of the prompt.
#[must_use]
pub fn extract_memory_facts(prompt: &str) -> Vec<String> {
    let scan = capped(prompt);
    let mut facts = Vec::new();
    for pattern in FACT_PATTERNS.iter() {
        for captures in pattern.captures_iter(scan) {
            if let Some(value) = captures.get(1) {
                let fact = value.as_str().trim().trim_end_matches('.').to_string();
                if !fact.is_empty() && !facts.contains(&fact) {
                    facts.push(fact);
                }
            }
            if facts.len() >= MAX_ITEMS_PER_REQUEST {
                return facts;
            }
        }
    }
    facts
}

/// Pull declarative claim sentences out of the response for later recall.
///
/// A claim is a sentence of at least [`MIN_CLAIM_WORDS`] words containing a
/// copular verb; questions and hedges are skipped.
#[must_use]
pub fn extract_claims(response: &str) -> Vec<String> {
    let scan = capped(response);
    let mut claims = Vec::new();
    for raw_sentence in scan.split(['.', '\n']) {
        let sentence = raw_sentence.trim();
        if sentence.is_empty() || sentence.ends_with('?') {
            continue;
        }
        let lowered = sentence.to_lowercase();
        if lowered.contains("might") || lowered.contains("maybe") || lowered.contains("not sure") {
            continue;
        }
        let words = sentence.split_whitespace().count();
        if words < MIN_CLAIM_WORDS {
            continue;
        }
        let has_copula = [" is ", " are ", " was ", " were ", " has ", " have "]
            .iter()
            .any(|verb| lowered.contains(verb));
        if has_copula {
            claims.push(sentence.to_string());
        }
        if claims.len() >= MAX_ITEMS_PER_REQUEST {
            break;
        }
    }
    claims
}
