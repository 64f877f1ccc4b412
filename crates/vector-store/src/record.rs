use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One embedded chunk, addressed by the hash of its text.
///
/// Content records are immutable and global to a collection: two
/// branches holding the same blob share a single record, so switching
/// branches never re-embeds unchanged content. `file_path` is the path
/// the content was first seen under; per-branch placement lives in
/// [`VisibilityRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub file_path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub provider_name: String,
    pub model_name: String,
    pub created_at_ms: u64,
}

/// Points one (branch, path, chunk) slot at its visible content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityRecord {
    pub branch: String,
    pub file_path: String,
    pub chunk_index: usize,
    pub content_hash: String,
    pub commit: String,
    pub updated_at_ms: u64,
}

impl VisibilityRecord {
    #[must_use]
    pub fn key(&self) -> VisibilityKey {
        (
            self.branch.clone(),
            self.file_path.clone(),
            self.chunk_index,
        )
    }
}

/// Map key for visibility lookups: (branch, file_path, chunk_index).
pub type VisibilityKey = (String, String, usize);

/// Lowercase hex SHA-256 of a chunk's text.
#[must_use]
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_encode_lower(&hasher.finalize())
}

fn hex_encode_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Directory-safe key for a project/provider/model triple.
///
/// Each component is sanitized independently, so distinct triples can
/// only collide if their sanitized components already collide.
#[must_use]
pub fn collection_key(project_id: &str, provider: &str, model: &str) -> String {
    format!(
        "{}__{}__{}",
        sanitize_component(project_id),
        sanitize_component(provider),
        sanitize_component(model)
    )
}

fn sanitize_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if out.is_empty() {
        return "_".to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_hash_is_stable_lowercase_hex() {
        let hash = content_hash("fn main() {}");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, content_hash("fn main() {}"));
    }

    #[test]
    fn different_text_hashes_differently() {
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[test]
    fn collection_key_sanitizes_each_component() {
        let key = collection_key("my/project", "openai", "text-embedding-3.small");
        assert_eq!(key, "my_project__openai__text-embedding-3.small");
    }

    #[test]
    fn empty_component_becomes_placeholder() {
        assert_eq!(collection_key("", "p", "m"), "___p__m");
    }

    #[test]
    fn visibility_key_carries_branch_path_and_chunk() {
        let record = VisibilityRecord {
            branch: "main".to_string(),
            file_path: "src/lib.rs".to_string(),
            chunk_index: 2,
            content_hash: "abc".to_string(),
            commit: "deadbeef".to_string(),
            updated_at_ms: 1,
        };
        assert_eq!(
            record.key(),
            ("main".to_string(), "src/lib.rs".to_string(), 2)
        );
    }
}
