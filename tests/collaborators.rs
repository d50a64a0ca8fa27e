//! Document, domain and middleware collaborators working with the query loop.

use std::sync::Arc;
use std::time::Duration;

use rlm_engine::document::{DocumentRegistry, load_text};
use rlm_engine::domain::{DomainId, DomainProvider, KeywordDomainRouter};
use rlm_engine::llm::ScriptedClient;
use rlm_engine::middleware::{CostTrackingMiddleware, LoggingMiddleware, MiddlewareChain, SynonymExpansionMiddleware};
use rlm_engine::query::QueryLoop;
use rlm_engine::sandbox::{Sandbox, SandboxConfig};
use tempfile::TempDir;

#[test]
fn test_detect_empty_text_is_generic() {
    assert_eq!(KeywordDomainRouter::new().detect("", ""), DomainId::Generic);
}

#[test]
fn test_load_text_empty_document() {
    let doc = load_text("id", "");
    assert_eq!(doc.id, "id");
    assert_eq!(doc.text, "");
    assert_eq!(doc.meta.chars, 0);
}

#[test]
fn test_contract_detected_as_legal() {
    let text = "MASTER SERVICES AGREEMENT\nWHEREAS the parties wish to cooperate;\n\
                NOW, THEREFORE, the parties hereby agree as follows. Governing law: Delaware.";
    let router = KeywordDomainRouter::new();
    assert_eq!(router.detect(text, "msa.docx"), DomainId::Legal);

    let terms = router.expand("termination", DomainId::Legal);
    assert!(terms.contains("cancellation"));
}

#[tokio::test]
async fn test_multi_document_query_with_middleware() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("acme-10-k.txt"), "FORM 10-K\nFiscal year 2024 revenue: $7.2M").unwrap();
    std::fs::write(dir.path().join("globex-10-k.txt"), "FORM 10-K\nFiscal year 2024 revenue: $5.1M").unwrap();

    let mut registry = DocumentRegistry::new();
    let ids = registry.load_glob(&format!("{}/*-10-k.txt", dir.path().display())).unwrap();
    assert_eq!(ids, vec!["acme-10-k".to_string(), "globex-10-k".to_string()]);
    let context = registry.combined_context(&ids).unwrap();

    let client = Arc::new(ScriptedClient::with_responses([
        "```repl\ngrep -c '=== DOCUMENT:' \"$RLM_CONTEXT_FILE\"\n```",
        "FINAL_ANSWER: ACME had the higher revenue ($7.2M vs $5.1M)",
    ]));
    let cost = Arc::new(CostTrackingMiddleware::new("claude-sonnet-4-5", "claude-haiku-4-5"));
    let mut middleware = MiddlewareChain::new()
        .with(LoggingMiddleware)
        .with(SynonymExpansionMiddleware::new(Arc::new(KeywordDomainRouter::new())).with_filename("acme-10-k.txt"));
    middleware.add(cost.clone());

    let query = QueryLoop::new(
        Arc::clone(&client),
        Sandbox::new(SandboxConfig::shell().with_timeout(Duration::from_secs(10))),
    )
    .with_middleware(middleware);

    let result = query.run("Which company had higher revenue?", &context).await.unwrap();

    assert!(result.answer.starts_with("ACME"));
    assert_eq!(result.trajectory.unwrap()[0].output.trim(), "2");

    let first_turn = &client.requests()[0].messages[0].content;
    assert!(first_turn.contains("Related finance terms"));
    assert!(first_turn.contains("net sales"));

    let totals = cost.totals();
    assert_eq!(totals.queries, 1);
    assert_eq!(totals.root_usage.total(), 30);
}
