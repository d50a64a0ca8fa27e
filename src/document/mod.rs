//! Documents - text extraction and multi-document context
//!
//! This module provides:
//! - Document / DocumentMeta: extracted text plus provenance
//! - DocumentLoader: the extraction seam, with ExtractingLoader as the default
//! - DocumentRegistry: several documents combined into one query context

pub mod loader;
pub mod registry;

pub use loader::{DocumentLoader, ExtractingLoader, Strategy, load_text};
pub use registry::DocumentRegistry;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a document's text came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Source file, `None` for text supplied directly
    pub path: Option<PathBuf>,
    pub strategy: Strategy,
    pub loaded_at: DateTime<Utc>,
    /// Hex SHA-256 of the text
    pub digest: String,
    pub chars: usize,
}

/// Extracted document text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub meta: DocumentMeta,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>, strategy: Strategy, path: Option<PathBuf>) -> Self {
        let text = text.into();
        let meta = DocumentMeta {
            path,
            strategy,
            loaded_at: Utc::now(),
            digest: hex::encode(Sha256::digest(text.as_bytes())),
            chars: text.chars().count(),
        };
        Self {
            id: id.into(),
            text,
            meta,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Rough token count (four characters per token)
    pub fn token_estimate(&self) -> usize {
        self.meta.chars / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_meta() {
        let doc = Document::new("memo", "Q3 revenue: $1.8M", Strategy::Inline, None);
        assert_eq!(doc.meta.chars, 17);
        assert_eq!(doc.token_estimate(), 4);
        assert_eq!(doc.meta.digest.len(), 64);
        assert!(doc.meta.path.is_none());
    }

    #[test]
    fn test_digest_is_stable() {
        let a = Document::new("a", "same text", Strategy::Inline, None);
        let b = Document::new("b", "same text", Strategy::Utf8, None);
        assert_eq!(a.meta.digest, b.meta.digest);
    }
}
