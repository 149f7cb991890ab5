//! Approximate token counting and lightweight intent classification.
//!
//! Both are deliberately cheap: counting never loads a BPE table and intent
//! detection is a deterministic pattern scan. The router only needs stable
//! coarse signals, not model-accurate numbers.

use serde::Serialize;

/// Fixed intent set recognized by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Chat,
    Smalltalk,
    Search,
    Recall,
    Code,
    Analysis,
    Research,
    Ops,
}

impl Intent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Chat => "chat",
            Intent::Smalltalk => "smalltalk",
            Intent::Search => "search",
            Intent::Recall => "recall",
            Intent::Code => "code",
            Intent::Analysis => "analysis",
            Intent::Research => "research",
            Intent::Ops => "ops",
        }
    }

    /// Heavy intents always route to the primary heavy model.
    #[must_use]
    pub fn is_heavy(self) -> bool {
        matches!(self, Intent::Analysis | Intent::Research)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count tokens in `text` with floor heuristics that never undercount.
///
/// Spaced text uses `max(words, ceil(0.75 * words))`; text without any
/// whitespace approximates 4 characters per token. The count is monotone
/// under concatenation.
#[must_use]
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let has_space = text.chars().any(char::is_whitespace);
    if has_space {
        let words = text.split_whitespace().count();
        words.max((words * 3).div_ceil(4))
    } else {
        text.chars().count().div_ceil(4)
    }
}

/// First keyword (rule order) appearing case-insensitively in `prompt`.
#[must_use]
pub fn keyword_hit<'a>(prompt: &str, keywords: &'a [String]) -> Option<&'a str> {
    if keywords.is_empty() {
        return None;
    }
    let lowered = prompt.to_lowercase();
    keywords
        .iter()
        .find(|keyword| !keyword.is_empty() && lowered.contains(keyword.to_lowercase().as_str()))
        .map(String::as_str)
}

const SMALLTALK_OPENERS: &[&str] = &[
    "hi", "hey", "hello", "yo", "good morning", "good evening", "thanks", "thank you", "how are",
];
const SEARCH_MARKERS: &[&str] = &["search", "find ", "look up", "lookup", "google", "latest news"];
const RECALL_MARKERS: &[&str] = &[
    "remember when",
    "what did i",
    "recall",
    "remind me what",
    "last time",
];
const CODE_MARKERS: &[&str] = &[
    "```", "code", "function", "compile", "refactor", "stack trace", "regex", "sql",
];
const ANALYSIS_MARKERS: &[&str] = &["analyze", "analysis", "compare", "evaluate", "benchmark"];
const RESEARCH_MARKERS: &[&str] = &["research", "literature", "deep dive", "investigate"];
const OPS_MARKERS: &[&str] = &[
    "deploy", "restart", "rollback", "server", "kubectl", "docker", "migrate", "backup",
];

/// Maximum classifier priority; prompts at this class route to the primary
/// heavy model regardless of the configured heavy-intent names.
pub const HEAVY_PRIORITY: u8 = 3;

/// Classify `prompt` into an [`Intent`] plus a coarse priority in
/// 0..=[`HEAVY_PRIORITY`].
///
/// Deterministic: the same prompt always yields the same result. The picker
/// consumes the priority as a second heavy signal alongside the intent name.
#[must_use]
pub fn detect_intent(prompt: &str) -> (Intent, u8) {
    let lowered = prompt.trim().to_lowercase();
    if lowered.is_empty() {
        return (Intent::Chat, 0);
    }

    // Ordering matters: specific work classes win over conversational ones.
    if contains_any(&lowered, RESEARCH_MARKERS) {
        return (Intent::Research, 3);
    }
    if contains_any(&lowered, ANALYSIS_MARKERS) {
        return (Intent::Analysis, 3);
    }
    if contains_any(&lowered, OPS_MARKERS) {
        return (Intent::Ops, 2);
    }
    if contains_any(&lowered, CODE_MARKERS) {
        return (Intent::Code, 2);
    }
    if contains_any(&lowered, RECALL_MARKERS) {
        return (Intent::Recall, 1);
    }
    if contains_any(&lowered, SEARCH_MARKERS) {
        return (Intent::Search, 1);
    }
    if is_smalltalk(&lowered) {
        return (Intent::Smalltalk, 0);
    }
    (Intent::Chat, 0)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn is_smalltalk(lowered: &str) -> bool {
    if lowered.split_whitespace().count() > 6 {
        return false;
    }
    SMALLTALK_OPENERS
        .iter()
        .any(|opener| lowered.starts_with(opener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tokens_empty() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn count_tokens_spaced_uses_word_floor() {
        assert_eq!(count_tokens("one two three four"), 4);
        // max(words, ceil(0.75 * words)) == words for any positive count
        assert_eq!(count_tokens("a b"), 2);
    }

    #[test]
    fn count_tokens_no_space_uses_char_quarter() {
        assert_eq!(count_tokens("abcdefgh"), 2);
        assert_eq!(count_tokens("abc"), 1);
        assert_eq!(count_tokens("abcdefghi"), 3);
    }

    #[test]
    fn count_tokens_monotone_in_concatenation() {
        let a = "hello world this is a prompt";
        let b = "moretextwithoutspaces";
        let combined = format!("{a} {b}");
        assert!(count_tokens(&combined) >= count_tokens(a));
        assert!(count_tokens(&combined) >= count_tokens(b));
    }

    #[test]
    fn heavy_intents() {
        assert!(Intent::Analysis.is_heavy());
        assert!(Intent::Research.is_heavy());
        assert!(!Intent::Code.is_heavy());
        assert!(!Intent::Ops.is_heavy());
    }

    #[test]
    fn detect_intent_is_deterministic() {
        let (a, pa) = detect_intent("please analyze this dataset");
        let (b, pb) = detect_intent("please analyze this dataset");
        assert_eq!(a, b);
        assert_eq!(pa, pb);
        assert_eq!(a, Intent::Analysis);
    }

    #[test]
    fn heavy_priority_marks_heavy_intents() {
        assert_eq!(detect_intent("research the history of sse").1, HEAVY_PRIORITY);
        assert_eq!(detect_intent("please analyze this dataset").1, HEAVY_PRIORITY);
        assert!(detect_intent("write a function in rust").1 < HEAVY_PRIORITY);
        assert!(detect_intent("hi there").1 < HEAVY_PRIORITY);
    }

    #[test]
    fn detect_intent_classes() {
        assert_eq!(detect_intent("hi there").0, Intent::Smalltalk);
        assert_eq!(detect_intent("search for rust crates").0, Intent::Search);
        assert_eq!(detect_intent("what did i say yesterday").0, Intent::Recall);
        assert_eq!(detect_intent("write a function in rust").0, Intent::Code);
        assert_eq!(detect_intent("research the history of sse").0, Intent::Research);
        assert_eq!(detect_intent("restart the api server").0, Intent::Ops);
        assert_eq!(detect_intent("tell me a story").0, Intent::Chat);
    }

    #[test]
    fn keyword_hit_first_match_case_insensitive() {
        let keywords = vec!["code".to_string(), "SQL".to_string()];
        assert_eq!(keyword_hit("Show me some CODE now", &keywords), Some("code"));
        assert_eq!(keyword_hit("optimize my sql query", &keywords), Some("SQL"));
        assert_eq!(keyword_hit("nothing here", &keywords), None);
    }
}
