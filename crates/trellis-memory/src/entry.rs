//! Memory records and matching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::{CoreError, Result};
pub use trellis_session::UserKey;

/// Default cap on memories per user.
pub const DEFAULT_MEMORY_LIMIT: usize = 1000;

/// Identifies one memory of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MemoryKey {
    /// Application name
    pub app_name: String,
    /// User identifier
    pub user_id: String,
    /// Memory identifier
    pub memory_id: String,
}

impl MemoryKey {
    /// Build a key
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>, memory_id: impl Into<String>) -> Self {
        Self { app_name: app_name.into(), user_id: user_id.into(), memory_id: memory_id.into() }
    }

    /// Key of the owning user
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.app_name.clone(), self.user_id.clone())
    }

    /// App, user and memory id must all be set.
    pub fn check(&self) -> Result<()> {
        self.user_key().check_user_key()?;
        if self.memory_id.is_empty() {
            return Err(CoreError::ValidationError("memory id is required".to_string()));
        }
        Ok(())
    }
}

/// The remembered fact itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Memory {
    /// Third-person statement about the user
    pub memory: String,
    /// Categorization topics
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    /// Last time the content changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// A stored memory with its ownership and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Memory id, unique per user
    pub id: String,
    /// Application name
    pub app_name: String,
    /// User identifier
    pub user_id: String,
    /// Content
    pub memory: Memory,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    /// Key addressing this entry
    pub fn key(&self) -> MemoryKey {
        MemoryKey::new(self.app_name.clone(), self.user_id.clone(), self.id.clone())
    }

    /// Whether `query` matches the memory text or a topic.
    pub fn matches(&self, query: &str) -> bool {
        match_memory(&self.memory, query)
    }
}

const MIN_TOKEN_LEN: usize = 2;

fn is_stopword(s: &str) -> bool {
    matches!(
        s,
        "a" | "an" | "the" | "and" | "or" | "of" | "in" | "on" | "to" | "for" | "with" | "is" | "are" | "am" | "be"
    )
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0x20000..=0x2A6DF)
}

fn dedup(tokens: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    for t in tokens {
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

/// Search tokens of a query.
///
/// Queries containing Han characters become bigrams over their
/// non-space, non-punctuation characters. Everything else is split on
/// non-alphanumerics with short tokens and a few English stopwords dropped.
pub fn search_tokens(query: &str) -> Vec<String> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return Vec::new();
    }

    if q.chars().any(is_cjk) {
        let chars: Vec<char> = q.chars().filter(|c| c.is_alphanumeric()).collect();
        return match chars.len() {
            0 => Vec::new(),
            1 => vec![chars[0].to_string()],
            _ => dedup(chars.windows(2).map(|w| w.iter().collect()).collect()),
        };
    }

    let tokens = q
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN && !is_stopword(t))
        .map(str::to_string)
        .collect();
    dedup(tokens)
}

/// Case-insensitive match of `query` against memory text and topics.
///
/// Any token hit is a match. A query that yields no tokens (only
/// stopwords, say) falls back to a plain substring test.
pub fn match_memory(memory: &Memory, query: &str) -> bool {
    let query = query.trim();
    if query.is_empty() {
        return false;
    }
    let content = memory.memory.to_lowercase();
    let topics: Vec<String> = memory.topics.iter().map(|t| t.to_lowercase()).collect();
    let hit = |needle: &str| content.contains(needle) || topics.iter().any(|t| t.contains(needle));

    let tokens = search_tokens(query);
    if tokens.is_empty() {
        return hit(&query.to_lowercase());
    }
    tokens.iter().any(|t| hit(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(text: &str, topics: &[&str]) -> Memory {
        Memory { memory: text.to_string(), topics: topics.iter().map(|t| t.to_string()).collect(), last_updated: None }
    }

    #[test]
    fn english_tokens_drop_stopwords_and_short_words() {
        assert_eq!(search_tokens("  The user likes a Hiking, and  x  coffee! "), vec!["user", "likes", "hiking", "coffee"]);
        assert!(search_tokens("   ").is_empty());
    }

    #[test]
    fn cjk_queries_become_bigrams() {
        assert_eq!(search_tokens("喜欢 爬山"), vec!["喜欢", "欢爬", "爬山"]);
        assert_eq!(search_tokens("山"), vec!["山"]);
    }

    #[test]
    fn matches_content_or_topics() {
        let m = memory("User enjoys hiking on weekends", &["Outdoors"]);
        assert!(match_memory(&m, "HIKING trips"));
        assert!(match_memory(&m, "outdoors"));
        assert!(!match_memory(&m, "cooking"));
        assert!(!match_memory(&m, "  "));
    }

    #[test]
    fn stopword_only_query_falls_back_to_substring() {
        let m = memory("lives in the city", &[]);
        assert!(match_memory(&m, "the"));
        assert!(!match_memory(&memory("lives downtown", &[]), "the"));
    }

    #[test]
    fn memory_key_requires_all_parts() {
        assert!(MemoryKey::new("app", "u", "m1").check().is_ok());
        assert!(MemoryKey::new("app", "u", "").check().is_err());
        assert!(MemoryKey::new("", "u", "m1").check().is_err());
    }
}
