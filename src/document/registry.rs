//! Multi-document registry.

use std::collections::BTreeMap;
use std::path::Path;

use crate::document::loader::{DocumentLoader, ExtractingLoader, load_text};
use crate::document::{Document, DocumentMeta};
use crate::error::{Result, RlmError};

/// Loaded documents by id, plus the most recently loaded one.
pub struct DocumentRegistry {
    loader: Box<dyn DocumentLoader>,
    documents: BTreeMap<String, Document>,
    active: Option<String>,
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::with_loader(ExtractingLoader::new())
    }

    pub fn with_loader(loader: impl DocumentLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            documents: BTreeMap::new(),
            active: None,
        }
    }

    /// Extract `path` and register it under its file stem.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<&DocumentMeta> {
        let document = self.loader.load(path.as_ref())?;
        Ok(self.insert(document))
    }

    pub fn load_text(&mut self, id: impl Into<String>, text: impl Into<String>) -> &DocumentMeta {
        self.insert(load_text(id, text))
    }

    /// Load every file matching a glob pattern; returns the ids loaded, in path order.
    pub fn load_glob(&mut self, pattern: &str) -> Result<Vec<String>> {
        let paths = glob::glob(pattern).map_err(|e| RlmError::Config(format!("Invalid glob '{}': {}", pattern, e)))?;

        let mut ids = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| RlmError::Io(e.into_error()))?;
            if !path.is_file() {
                continue;
            }
            let document = self.loader.load(&path)?;
            ids.push(document.id.clone());
            self.insert(document);
        }
        Ok(ids)
    }

    pub fn insert(&mut self, document: Document) -> &DocumentMeta {
        let id = document.id.clone();
        if self.documents.contains_key(&id) {
            log::debug!("Replacing document {}", id);
        }
        self.active = Some(id.clone());
        self.documents.insert(id.clone(), document);
        &self.documents[&id].meta
    }

    pub fn get(&self, id: &str) -> Result<&Document> {
        self.documents.get(id).ok_or_else(|| {
            let available: Vec<&str> = self.documents.keys().map(String::as_str).collect();
            RlmError::DocumentNotFound(format!("{} (available: {})", id, available.join(", ")))
        })
    }

    /// The most recently loaded document
    pub fn active(&self) -> Option<&Document> {
        self.active.as_deref().and_then(|id| self.documents.get(id))
    }

    pub fn remove(&mut self, id: &str) -> Option<Document> {
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        self.documents.remove(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Concatenate documents with `=== DOCUMENT: <id> ===` section markers.
    pub fn combined_context<S: AsRef<str>>(&self, ids: &[S]) -> Result<String> {
        let sections = ids
            .iter()
            .map(|id| {
                let document = self.get(id.as_ref())?;
                Ok(format!("=== DOCUMENT: {} ===\n{}", document.id, document.text))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(sections.join("\n\n"))
    }
}
