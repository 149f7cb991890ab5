//! Router rules: thresholds, allow-lists, budgets, and keyword tables.
//!
//! Precedence is built-in constants ← environment ← rules file. The file is
//! re-read when its mtime changes between calls; a malformed file keeps the
//! last good snapshot. Readers get a cheap `Arc` clone of the current
//! snapshot, writes go through a single-writer lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::Deserialize;

use crate::error::RouterError;
use crate::intent::Intent;
use crate::routing::Vendor;

const DEFAULT_BUDGET_MS: u64 = 7_000;
const DEFAULT_PRIMARY_TIMEOUT_MS: u64 = 6_000;
const DEFAULT_SECONDARY_TIMEOUT_MS: u64 = 4_500;
const DEFAULT_HEAVY_WORD_COUNT: usize = 30;
const DEFAULT_HEAVY_TOKENS: usize = 1_000;
const DEFAULT_MAX_SHORT_PROMPT_TOKENS: usize = 240;
const DEFAULT_RAG_LONG_CONTEXT_THRESHOLD: usize = 6_000;
const DEFAULT_DOC_LONG_REPLY_TARGET: usize = 900;
const DEFAULT_OPS_MAX_FILES_SIMPLE: usize = 2;
const DEFAULT_SELF_CHECK_FAIL_THRESHOLD: f64 = 0.60;
const DEFAULT_MAX_RETRIES_PER_REQUEST: u32 = 1;
const DEFAULT_USER_CB_THRESHOLD: u32 = 3;
const DEFAULT_USER_CB_COOLDOWN_SECS: u64 = 120;
const DEFAULT_SIM_THRESHOLD: f64 = 0.24;
const DEFAULT_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 256;
const DEFAULT_BUDGET_REPLY_LEN_TARGET: usize = 180;

const DEFAULT_PRIMARY_ALLOWED: &str = "gpt-4o,gpt-4,gpt-3.5-turbo,gpt-4o-mini";
const DEFAULT_SECONDARY_ALLOWED: &str = "llama3:latest,llama3";
const DEFAULT_KEYWORDS: &[&str] = &["code", "research", "analyze", "explain", "diagram", "summarize"];
const DEFAULT_BLOCKED_PHRASES: &[&str] = &[
    "rm -rf /",
    "drop table",
    "format c:",
    "delete all my files",
    "wipe the disk",
];

/// Immutable rules snapshot handed to the hot path.
#[derive(Debug, Clone)]
pub struct RouterRules {
    pub budget_ms: u64,
    pub primary_timeout_ms: u64,
    pub secondary_timeout_ms: u64,
    pub allowed_primary_models: FxHashSet<String>,
    pub allowed_secondary_models: FxHashSet<String>,
    pub heavy_word_count: usize,
    pub heavy_tokens: usize,
    pub keywords: Vec<String>,
    pub heavy_intents: Vec<String>,
    pub max_short_prompt_tokens: usize,
    pub rag_long_context_threshold: usize,
    pub doc_long_reply_target: usize,
    pub ops_max_files_simple: usize,
    pub self_check_fail_threshold: f64,
    pub max_retries_per_request: u32,
    pub user_cb_threshold: u32,
    pub user_cb_cooldown_secs: u64,
    pub sim_threshold: f64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub budget_reply_len_target: usize,
    pub blocked_phrases: Vec<String>,
}

impl RouterRules {
    /// Built-in constants layered with environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            budget_ms: env_u64("ROUTER_BUDGET_MS", DEFAULT_BUDGET_MS),
            primary_timeout_ms: env_u64("PRIMARY_TIMEOUT_MS", DEFAULT_PRIMARY_TIMEOUT_MS),
            secondary_timeout_ms: env_u64("SECONDARY_TIMEOUT_MS", DEFAULT_SECONDARY_TIMEOUT_MS),
            allowed_primary_models: env_model_set("ALLOWED_PRIMARY_MODELS", DEFAULT_PRIMARY_ALLOWED),
            allowed_secondary_models: env_model_set(
                "ALLOWED_SECONDARY_MODELS",
                DEFAULT_SECONDARY_ALLOWED,
            ),
            heavy_word_count: env_usize("MODEL_ROUTER_HEAVY_WORDS", DEFAULT_HEAVY_WORD_COUNT),
            heavy_tokens: env_usize("MODEL_ROUTER_HEAVY_TOKENS", DEFAULT_HEAVY_TOKENS),
            keywords: env_list("MODEL_ROUTER_KEYWORDS", DEFAULT_KEYWORDS),
            heavy_intents: Vec::new(),
            max_short_prompt_tokens: DEFAULT_MAX_SHORT_PROMPT_TOKENS,
            rag_long_context_threshold: DEFAULT_RAG_LONG_CONTEXT_THRESHOLD,
            doc_long_reply_target: DEFAULT_DOC_LONG_REPLY_TARGET,
            ops_max_files_simple: DEFAULT_OPS_MAX_FILES_SIMPLE,
            self_check_fail_threshold: env_f64(
                "SELF_CHECK_FAIL_THRESHOLD",
                DEFAULT_SELF_CHECK_FAIL_THRESHOLD,
            ),
            max_retries_per_request: env_u32(
                "MAX_RETRIES_PER_REQUEST",
                DEFAULT_MAX_RETRIES_PER_REQUEST,
            ),
            user_cb_threshold: env_u32("USER_CB_THRESHOLD", DEFAULT_USER_CB_THRESHOLD),
            user_cb_cooldown_secs: env_u64("USER_CB_COOLDOWN", DEFAULT_USER_CB_COOLDOWN_SECS),
            sim_threshold: env_f64("SIM_THRESHOLD", DEFAULT_SIM_THRESHOLD),
            cache_ttl_secs: env_u64("CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            cache_max_entries: env_usize("CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
            budget_reply_len_target: env_usize(
                "BUDGET_REPLY_LEN_TARGET",
                DEFAULT_BUDGET_REPLY_LEN_TARGET,
            ),
            blocked_phrases: DEFAULT_BLOCKED_PHRASES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Whether `intent` routes to the primary heavy model.
    ///
    /// The base heavy set is fixed; the rules file may only extend it.
    #[must_use]
    pub fn is_heavy_intent(&self, intent: Intent) -> bool {
        intent.is_heavy()
            || self
                .heavy_intents
                .iter()
                .any(|name| name.eq_ignore_ascii_case(intent.as_str()))
    }

    /// Allow-list lookup for one vendor.
    #[must_use]
    pub fn model_allowed(&self, model: &str, vendor: Vendor) -> bool {
        match vendor {
            Vendor::Primary => self.allowed_primary_models.contains(model),
            Vendor::Secondary => self.allowed_secondary_models.contains(model),
        }
    }

    /// Validate `model` against the allow-list of `vendor`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ModelNotAllowed`] when the model is not listed.
    pub fn validate_model(&self, model: &str, vendor: Vendor) -> Result<(), RouterError> {
        if self.model_allowed(model, vendor) {
            Ok(())
        } else {
            Err(RouterError::ModelNotAllowed {
                model: model.to_string(),
                vendor: vendor.as_str().to_string(),
            })
        }
    }

    /// Safety precheck over the normalized prompt. Substring match, lowercase.
    #[must_use]
    pub fn blocked_phrase<'a>(&'a self, prompt: &str) -> Option<&'a str> {
        let lowered = prompt.to_lowercase();
        self.blocked_phrases
            .iter()
            .find(|phrase| lowered.contains(phrase.to_lowercase().as_str()))
            .map(String::as_str)
    }

    fn apply_file(&mut self, file: RulesFile) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = file.$field {
                    self.$field = value;
                }
            };
        }
        take!(budget_ms);
        take!(primary_timeout_ms);
        take!(secondary_timeout_ms);
        take!(heavy_word_count);
        take!(heavy_tokens);
        take!(max_short_prompt_tokens);
        take!(rag_long_context_threshold);
        take!(doc_long_reply_target);
        take!(ops_max_files_simple);
        take!(self_check_fail_threshold);
        take!(max_retries_per_request);
        take!(user_cb_threshold);
        take!(user_cb_cooldown_secs);
        take!(sim_threshold);
        take!(cache_ttl_secs);
        take!(cache_max_entries);
        take!(budget_reply_len_target);
        if let Some(models) = file.allowed_primary_models {
            self.allowed_primary_models = normalize_model_set(models);
        }
        if let Some(models) = file.allowed_secondary_models {
            self.allowed_secondary_models = normalize_model_set(models);
        }
        if let Some(keywords) = file.keywords {
            self.keywords = normalize_list(keywords);
        }
        if let Some(intents) = file.heavy_intents {
            self.heavy_intents = normalize_list(intents);
        }
        if let Some(phrases) = file.blocked_phrases {
            self.blocked_phrases = normalize_list(phrases);
        }
    }
}

/// Partial rules file; every field is optional so the file can override any
/// subset of the snapshot.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    budget_ms: Option<u64>,
    primary_timeout_ms: Option<u64>,
    secondary_timeout_ms: Option<u64>,
    allowed_primary_models: Option<Vec<String>>,
    allowed_secondary_models: Option<Vec<String>>,
    heavy_word_count: Option<usize>,
    heavy_tokens: Option<usize>,
    keywords: Option<Vec<String>>,
    heavy_intents: Option<Vec<String>>,
    max_short_prompt_tokens: Option<usize>,
    rag_long_context_threshold: Option<usize>,
    doc_long_reply_target: Option<usize>,
    ops_max_files_simple: Option<usize>,
    self_check_fail_threshold: Option<f64>,
    max_retries_per_request: Option<u32>,
    user_cb_threshold: Option<u32>,
    user_cb_cooldown_secs: Option<u64>,
    sim_threshold: Option<f64>,
    cache_ttl_secs: Option<u64>,
    cache_max_entries: Option<usize>,
    budget_reply_len_target: Option<usize>,
    blocked_phrases: Option<Vec<String>>,
}

struct ReloadState {
    snapshot: Arc<RouterRules>,
    file_mtime: Option<SystemTime>,
}

/// Owner of the hot-reloadable rules snapshot. Single writer, many readers.
pub struct PolicyEngine {
    rules_path: PathBuf,
    state: RwLock<ReloadState>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(rules_path: impl Into<PathBuf>) -> Self {
        let rules_path = rules_path.into();
        let mut base = RouterRules::from_env();
        let file_mtime = file_mtime(&rules_path);
        if file_mtime.is_some() {
            match load_rules_file(&rules_path) {
                Ok(file) => base.apply_file(file),
                Err(err) => {
                    tracing::warn!(path = %rules_path.display(), error = %err, "rules file invalid at startup, using env/defaults");
                }
            }
        }
        Self {
            rules_path,
            state: RwLock::new(ReloadState {
                snapshot: Arc::new(base),
                file_mtime,
            }),
        }
    }

    /// Current rules snapshot, re-reading the file when its mtime changed.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RouterRules> {
        let current_mtime = file_mtime(&self.rules_path);
        {
            let state = self.state.read();
            if state.file_mtime == current_mtime {
                return Arc::clone(&state.snapshot);
            }
        }

        let mut state = self.state.write();
        // Another writer may have beaten us to the reload.
        if state.file_mtime == current_mtime {
            return Arc::clone(&state.snapshot);
        }

        let mut rebuilt = RouterRules::from_env();
        if current_mtime.is_some() {
            match load_rules_file(&self.rules_path) {
                Ok(file) => rebuilt.apply_file(file),
                Err(err) => {
                    tracing::warn!(
                        path = %self.rules_path.display(),
                        error = %err,
                        "rules file reload failed, keeping last good snapshot"
                    );
                    state.file_mtime = current_mtime;
                    return Arc::clone(&state.snapshot);
                }
            }
        }
        state.snapshot = Arc::new(rebuilt);
        state.file_mtime = current_mtime;
        tracing::info!(path = %self.rules_path.display(), "router rules reloaded");
        Arc::clone(&state.snapshot)
    }
}

/// Route an explicit model override to its vendor by prefix.
///
/// Prefix inference only selects the vendor whose allow-list will be checked;
/// it never bypasses the list itself.
#[must_use]
pub fn vendor_for_override(model: &str) -> Option<Vendor> {
    let trimmed = model.trim();
    if trimmed.starts_with("gpt") {
        Some(Vendor::Primary)
    } else if trimmed.starts_with("llama") {
        Some(Vendor::Secondary)
    } else {
        None
    }
}

fn load_rules_file(path: &std::path::Path) -> Result<RulesFile, String> {
    let contents = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_yaml::from_str(&contents).map_err(|err| err.to_string())
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_model_set(key: &str, default: &str) -> FxHashSet<String> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_list(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .collect(),
        Err(_) => defaults.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn normalize_model_set(models: Vec<String>) -> FxHashSet<String> {
    models
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

fn normalize_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rules(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("router_rules.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("askgate-policy-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_without_file() {
        let engine = PolicyEngine::new("no-such-rules-file.yaml");
        let rules = engine.snapshot();
        assert_eq!(rules.heavy_word_count, 30);
        assert!(rules.model_allowed("gpt-4o", Vendor::Primary));
        assert!(rules.model_allowed("llama3:latest", Vendor::Secondary));
        assert!(!rules.model_allowed("gpt-4o", Vendor::Secondary));
    }

    #[test]
    fn file_overrides_and_reload() {
        let dir = temp_dir("reload");
        let path = write_rules(&dir, "heavy_word_count: 10\nkeywords: [vector]\n");
        let engine = PolicyEngine::new(&path);
        let rules = engine.snapshot();
        assert_eq!(rules.heavy_word_count, 10);
        assert_eq!(rules.keywords, vec!["vector".to_string()]);

        // Rewrite with a different mtime; snapshot picks it up.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, "heavy_word_count: 55\n").unwrap();
        let mtime = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
        let rules = engine.snapshot();
        assert_eq!(rules.heavy_word_count, 55);
    }

    #[test]
    fn malformed_file_keeps_last_good() {
        let dir = temp_dir("malformed");
        let path = write_rules(&dir, "heavy_word_count: 10\n");
        let engine = PolicyEngine::new(&path);
        assert_eq!(engine.snapshot().heavy_word_count, 10);

        std::fs::write(&path, "heavy_word_count: [not an int\n").unwrap();
        let mtime = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
        assert_eq!(engine.snapshot().heavy_word_count, 10);
    }

    #[test]
    fn override_prefix_inference() {
        assert_eq!(vendor_for_override("gpt-4o"), Some(Vendor::Primary));
        assert_eq!(vendor_for_override("llama3:latest"), Some(Vendor::Secondary));
        assert_eq!(vendor_for_override("claude-3"), None);
    }

    #[test]
    fn validate_model_rejects_unlisted() {
        let rules = RouterRules::from_env();
        assert!(rules.validate_model("gpt-4o", Vendor::Primary).is_ok());
        let err = rules
            .validate_model("gpt-forbidden", Vendor::Primary)
            .unwrap_err();
        assert_eq!(err.category(), "model_not_allowed");
    }

    #[test]
    fn blocked_phrases_match_case_insensitively() {
        let rules = RouterRules::from_env();
        assert!(rules.blocked_phrase("please DROP TABLE users;").is_some());
        assert!(rules.blocked_phrase("summarize this essay").is_none());
    }

    #[test]
    fn heavy_intent_extension() {
        let mut rules = RouterRules::from_env();
        assert!(rules.is_heavy_intent(Intent::Analysis));
        assert!(!rules.is_heavy_intent(Intent::Code));
        rules.heavy_intents = vec!["code".to_string()];
        assert!(rules.is_heavy_intent(Intent::Code));
    }
}
