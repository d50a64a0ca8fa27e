//! Middleware chain wrapped around each query.
//!
//! Pre-query hooks run in registration order and may rewrite the question or
//! context. Post-query hooks run in reverse order and may rewrite the result.
//! A hook error aborts the query and reaches the caller unchanged.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::{DETECTION_SAMPLE_CHARS, DomainId, DomainProvider};
use crate::error::Result;
use crate::llm::TokenUsage;
use crate::query::QueryResult;

/// A hook around query execution
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn pre_query(&self, question: String, context: String) -> Result<(String, String)> {
        Ok((question, context))
    }

    fn post_query(&self, result: QueryResult) -> Result<QueryResult> {
        Ok(result)
    }
}

/// Ordered set of middleware
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.middleware.iter().map(|m| m.name()))
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Add middleware (builder pattern)
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub fn run_pre(&self, question: String, context: String) -> Result<(String, String)> {
        let mut current = (question, context);
        for middleware in &self.middleware {
            log::debug!("pre_query: {}", middleware.name());
            current = middleware.pre_query(current.0, current.1)?;
        }
        Ok(current)
    }

    pub fn run_post(&self, result: QueryResult) -> Result<QueryResult> {
        let mut current = result;
        for middleware in self.middleware.iter().rev() {
            log::debug!("post_query: {}", middleware.name());
            current = middleware.post_query(current)?;
        }
        Ok(current)
    }
}

/// Logs each query and its outcome.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn pre_query(&self, question: String, context: String) -> Result<(String, String)> {
        log::info!(
            "Query: {} ({} chars of context)",
            question,
            context.chars().count()
        );
        Ok((question, context))
    }

    fn post_query(&self, result: QueryResult) -> Result<QueryResult> {
        log::info!(
            "Result: {} after {} iterations, {} sub-calls, {} tokens",
            result.outcome,
            result.iterations,
            result.sub_calls,
            result.total_usage().total()
        );
        Ok(result)
    }
}

/// Running totals across every query the middleware has seen
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostTotals {
    pub queries: u64,
    pub root_usage: TokenUsage,
    pub sub_usage: TokenUsage,
    pub cost_usd: f64,
}

/// Accumulates token usage and estimated spend.
#[derive(Debug)]
pub struct CostTrackingMiddleware {
    root_model: String,
    sub_model: String,
    queries: AtomicU64,
    root_in: AtomicU64,
    root_out: AtomicU64,
    sub_in: AtomicU64,
    sub_out: AtomicU64,
}

impl CostTrackingMiddleware {
    pub fn new(root_model: impl Into<String>, sub_model: impl Into<String>) -> Self {
        Self {
            root_model: root_model.into(),
            sub_model: sub_model.into(),
            queries: AtomicU64::new(0),
            root_in: AtomicU64::new(0),
            root_out: AtomicU64::new(0),
            sub_in: AtomicU64::new(0),
            sub_out: AtomicU64::new(0),
        }
    }

    pub fn totals(&self) -> CostTotals {
        let root_usage = TokenUsage::new(
            self.root_in.load(Ordering::SeqCst),
            self.root_out.load(Ordering::SeqCst),
        );
        let sub_usage = TokenUsage::new(
            self.sub_in.load(Ordering::SeqCst),
            self.sub_out.load(Ordering::SeqCst),
        );
        CostTotals {
            queries: self.queries.load(Ordering::SeqCst),
            root_usage,
            sub_usage,
            cost_usd: root_usage.cost_usd(&self.root_model) + sub_usage.cost_usd(&self.sub_model),
        }
    }
}

impl Middleware for CostTrackingMiddleware {
    fn name(&self) -> &str {
        "cost-tracking"
    }

    fn post_query(&self, result: QueryResult) -> Result<QueryResult> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.root_in
            .fetch_add(result.root_usage.input_tokens, Ordering::SeqCst);
        self.root_out
            .fetch_add(result.root_usage.output_tokens, Ordering::SeqCst);
        self.sub_in.fetch_add(result.sub_usage.input_tokens, Ordering::SeqCst);
        self.sub_out
            .fetch_add(result.sub_usage.output_tokens, Ordering::SeqCst);
        log::debug!(
            "Query cost ${:.4}",
            result.cost_usd(&self.root_model, &self.sub_model)
        );
        Ok(result)
    }
}

/// Appends domain synonyms of the question's terms to the question.
pub struct SynonymExpansionMiddleware {
    provider: Arc<dyn DomainProvider>,
    filename: String,
}

impl SynonymExpansionMiddleware {
    pub fn new(provider: Arc<dyn DomainProvider>) -> Self {
        Self {
            provider,
            filename: String::new(),
        }
    }

    /// Use the document's file name as an extra detection signal
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    fn related_terms(&self, question: &str, domain: DomainId) -> BTreeSet<String> {
        let words: Vec<String> = question
            .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '&')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        // Single words plus adjacent pairs, so "net income" matches as a phrase.
        let mut candidates: Vec<String> = words.clone();
        candidates.extend(words.windows(2).map(|pair| pair.join(" ")));

        let mut related = BTreeSet::new();
        for candidate in &candidates {
            for term in self.provider.expand(candidate, domain) {
                if !question.to_lowercase().contains(&term.to_lowercase()) {
                    related.insert(term);
                }
            }
        }
        related
    }
}

impl Middleware for SynonymExpansionMiddleware {
    fn name(&self) -> &str {
        "synonym-expansion"
    }

    fn pre_query(&self, question: String, context: String) -> Result<(String, String)> {
        let sample: String = context.chars().take(DETECTION_SAMPLE_CHARS).collect();
        let domain = self.provider.detect(&sample, &self.filename);
        if domain == DomainId::Generic {
            return Ok((question, context));
        }

        let related = self.related_terms(&question, domain);
        if related.is_empty() {
            return Ok((question, context));
        }

        log::debug!("Expanded question with {} {} terms", related.len(), domain);
        let terms: Vec<String> = related.into_iter().collect();
        let question = format!(
            "{}\n\n(Related {} terms: {})",
            question,
            domain,
            terms.join(", ")
        );
        Ok((question, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::KeywordDomainRouter;
    use crate::error::RlmError;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn pre_query(&self, question: String, context: String) -> Result<(String, String)> {
            self.log.lock().unwrap().push(format!("pre:{}", self.name));
            Ok((format!("{}+{}", question, self.name), context))
        }

        fn post_query(&self, mut result: QueryResult) -> Result<QueryResult> {
            self.log.lock().unwrap().push(format!("post:{}", self.name));
            result.answer.push_str(self.name);
            Ok(result)
        }
    }

    struct Rejecting;

    impl Middleware for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        fn pre_query(&self, _question: String, _context: String) -> Result<(String, String)> {
            Err(RlmError::Middleware("question rejected".to_string()))
        }
    }

    fn recorders(log: &Arc<Mutex<Vec<String>>>) -> MiddlewareChain {
        MiddlewareChain::new()
            .with(Recorder {
                name: "a",
                log: Arc::clone(log),
            })
            .with(Recorder {
                name: "b",
                log: Arc::clone(log),
            })
    }

    #[test]
    fn test_order_of_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = recorders(&log);

        let (question, _) = chain.run_pre("q".to_string(), "ctx".to_string()).unwrap();
        assert_eq!(question, "q+a+b");

        let result = chain.run_post(QueryResult::answered("")).unwrap();
        assert_eq!(result.answer, "ba");

        assert_eq!(*log.lock().unwrap(), vec!["pre:a", "pre:b", "post:b", "post:a"]);
    }

    #[test]
    fn test_error_propagates_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new().with(Rejecting).with(Recorder {
            name: "after",
            log: Arc::clone(&log),
        });

        let err = chain.run_pre("q".to_string(), String::new()).unwrap_err();
        assert_eq!(err.to_string(), "Middleware error: question rejected");
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_debug_lists_names() {
        let chain = MiddlewareChain::new().with(LoggingMiddleware).with(Rejecting);
        assert_eq!(format!("{:?}", chain), r#"["logging", "rejecting"]"#);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_cost_tracking() {
        let tracker = CostTrackingMiddleware::new("claude-sonnet-4-5", "claude-haiku-4-5");
        let mut result = QueryResult::answered("x");
        result.root_usage = TokenUsage::new(1_000, 100);
        result.sub_usage = TokenUsage::new(500, 50);

        tracker.post_query(result.clone()).unwrap();
        tracker.post_query(result.clone()).unwrap();

        let totals = tracker.totals();
        assert_eq!(totals.queries, 2);
        assert_eq!(totals.root_usage, TokenUsage::new(2_000, 200));
        assert_eq!(totals.sub_usage, TokenUsage::new(1_000, 100));
        let expected = 2.0 * result.cost_usd("claude-sonnet-4-5", "claude-haiku-4-5");
        assert!((totals.cost_usd - expected).abs() < 1e-9);
    }

    #[test]
    fn test_synonym_expansion_for_finance() {
        let middleware = SynonymExpansionMiddleware::new(Arc::new(KeywordDomainRouter::new()))
            .with_filename("acme-10-k.txt");
        let (question, context) = middleware
            .pre_query("What was revenue in Q3?".to_string(), "Consolidated balance sheet".to_string())
            .unwrap();

        assert!(question.starts_with("What was revenue in Q3?\n\n(Related finance terms:"));
        assert!(question.contains("net sales"));
        assert_eq!(context, "Consolidated balance sheet");
    }

    #[test]
    fn test_synonym_expansion_generic_untouched() {
        let middleware = SynonymExpansionMiddleware::new(Arc::new(KeywordDomainRouter::new()));
        let (question, _) = middleware
            .pre_query("What was revenue?".to_string(), "A short story about a cat.".to_string())
            .unwrap();
        assert_eq!(question, "What was revenue?");
    }
}
