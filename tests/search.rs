mod common;

use std::sync::Arc;

use codeslice::context::{CodebaseContext, SyncPhase};
use codeslice::coordinator::IndexCoordinator;
use codeslice::retrieval::{RetrievalEngine, SearchOptions};
use codeslice_core::models::{vector_key, ContentHash};
use codeslice_core::search::BoostConfig;
use codeslice_core::store::memory::InMemoryVectorStore;
use codeslice_core::store::{ChunkMetadata, VectorStore};
use common::{embed_text, test_config, write, FakeGateway};
use tempfile::TempDir;

const RETRY_RS: &str = "\
/// Delay before the next attempt.
pub fn backoff_delay(attempt: u32) -> u64 {
    let exponential = 100u64 << attempt;
    exponential.min(30_000)
}

pub fn should_retry(status: u16) -> bool {
    status == 429 || status >= 500
}
";

const PARSER_RS: &str = "\
pub struct Parser {
    tokens: Vec<String>,
}

impl Parser {
    pub fn parse_tokens(&mut self, input: &str) {
        self.tokens = input.split_whitespace().map(str::to_string).collect();
    }
}
";

const GUIDE_MD: &str = "\
# Guide

Install the tool, then run the indexer over your repository.
The parser splits input into tokens before anything else happens.
";

struct Fixture {
    dir: TempDir,
    gateway: Arc<FakeGateway>,
    store: Arc<InMemoryVectorStore>,
    coordinator: IndexCoordinator,
    engine: RetrievalEngine,
}

impl Fixture {
    async fn indexed() -> (Self, CodebaseContext) {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/retry.rs", RETRY_RS);
        write(dir.path(), "src/parser.rs", PARSER_RS);
        write(dir.path(), "docs/guide.md", GUIDE_MD);

        let gateway = Arc::new(FakeGateway::new());
        let store = Arc::new(InMemoryVectorStore::new());
        let coordinator = IndexCoordinator::new(gateway.clone(), store.clone());
        let engine = RetrievalEngine::new(gateway.clone(), store.clone());
        let ctx = CodebaseContext::open(dir.path(), test_config()).unwrap();
        coordinator.sync(&ctx).await.unwrap();

        (
            Self {
                dir,
                gateway,
                store,
                coordinator,
                engine,
            },
            ctx,
        )
    }
}

#[tokio::test]
async fn test_zero_k_and_blank_query_return_nothing() {
    let (fx, ctx) = Fixture::indexed().await;
    let opts = SearchOptions::default();
    let calls = fx.gateway.calls();

    assert!(fx.engine.search(&ctx, "backoff", 0, &opts).await.is_empty());
    assert!(fx.engine.search(&ctx, "   ", 5, &opts).await.is_empty());
    assert_eq!(fx.gateway.calls(), calls);
}

#[tokio::test]
async fn test_results_are_bounded_and_sorted() {
    let (fx, ctx) = Fixture::indexed().await;
    let opts = SearchOptions::default();

    let hits = fx.engine.search(&ctx, "parse tokens", 2, &opts).await;
    assert_eq!(hits.len(), 2);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

    // fewer candidates than k: everything comes back
    let all = fx.engine.search(&ctx, "parse tokens", 50, &opts).await;
    assert_eq!(all.len(), ctx.committed().chunk_count());
}

#[tokio::test]
async fn test_most_relevant_file_ranks_first() {
    let (fx, ctx) = Fixture::indexed().await;
    let opts = SearchOptions::default();

    let hits = fx
        .engine
        .search(&ctx, "exponential backoff delay before retry", 3, &opts)
        .await;
    assert_eq!(hits[0].path, "src/retry.rs");
    assert!(hits[0].keyword_score > 0.0);
    assert_eq!(hits[0].start_line, 1);

    let hits = fx.engine.search(&ctx, "Parser parse_tokens", 3, &opts).await;
    assert_eq!(hits[0].path, "src/parser.rs");
}

#[tokio::test]
async fn test_path_prefix_limits_results() {
    let (fx, ctx) = Fixture::indexed().await;
    let opts = SearchOptions {
        path_prefix: Some("docs".to_string()),
        ..Default::default()
    };

    let hits = fx.engine.search(&ctx, "parser tokens", 10, &opts).await;
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.path.starts_with("docs/")));

    let opts = SearchOptions {
        path_prefix: Some("src/retry.rs".to_string()),
        ..Default::default()
    };
    let hits = fx.engine.search(&ctx, "parser tokens", 10, &opts).await;
    assert!(hits.iter().all(|h| h.path == "src/retry.rs"));
}

#[tokio::test]
async fn test_min_score_filters_weak_matches() {
    let (fx, ctx) = Fixture::indexed().await;
    let opts = SearchOptions {
        boost: Some(BoostConfig {
            min_score: 2.0,
            ..BoostConfig::default()
        }),
        ..Default::default()
    };
    assert!(fx.engine.search(&ctx, "backoff", 5, &opts).await.is_empty());
}

#[tokio::test]
async fn test_uncommitted_vectors_are_invisible() {
    let (fx, ctx) = Fixture::indexed().await;
    let id = "uncommitted-chunk".to_string();
    let metadata = ChunkMetadata {
        scope: ctx.scope().to_string(),
        chunk_id: id.clone(),
        path: "src/ghost.rs".to_string(),
        chunk_index: 0,
        start_line: 1,
        end_line: 1,
        content_hash: ContentHash::of(b"ghost"),
        text: "exponential backoff delay before retry".to_string(),
    };
    let query = "exponential backoff delay before retry";
    fx.store
        .upsert(&vector_key(ctx.scope(), &id), &embed_text(query), &metadata)
        .await
        .unwrap();

    let hits = fx.engine.search(&ctx, query, 10, &SearchOptions::default()).await;
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.path != "src/ghost.rs"));
}

#[tokio::test]
async fn test_uncommitted_vectors_do_not_crowd_out_results() {
    let (fx, ctx) = Fixture::indexed().await;
    let query = "parse tokens";
    // more identical uncommitted vectors than the default candidate pool
    for i in 0..60 {
        let id = format!("ghost-{i}");
        let metadata = ChunkMetadata {
            scope: ctx.scope().to_string(),
            chunk_id: id.clone(),
            path: format!("src/ghost_{i}.rs"),
            chunk_index: 0,
            start_line: 1,
            end_line: 1,
            content_hash: ContentHash::of(id.as_bytes()),
            text: query.to_string(),
        };
        fx.store
            .upsert(&vector_key(ctx.scope(), &id), &embed_text(query), &metadata)
            .await
            .unwrap();
    }

    let hits = fx.engine.search(&ctx, query, 2, &SearchOptions::default()).await;
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| !h.path.starts_with("src/ghost_")));
}

#[tokio::test]
async fn test_related_chunks_exclude_the_source_chunk() {
    let (fx, ctx) = Fixture::indexed().await;
    let manifest = ctx.committed();
    let source = manifest.chunk_ids("src/parser.rs")[0].clone();
    let calls = fx.gateway.calls();

    let opts = SearchOptions::default();
    let related = fx.engine.search_related(&ctx, &source, 10, &opts).await;
    assert_eq!(related.len(), manifest.chunk_count() - 1);
    assert!(related.iter().all(|h| h.chunk_id != source));
    assert!(related.windows(2).all(|w| w[0].score >= w[1].score));
    // ranks from the stored vector, no query embedding
    assert_eq!(fx.gateway.calls(), calls);

    let docs_only = SearchOptions {
        path_prefix: Some("docs".to_string()),
        ..Default::default()
    };
    let related = fx.engine.search_related(&ctx, &source, 10, &docs_only).await;
    assert!(!related.is_empty());
    assert!(related.iter().all(|h| h.path.starts_with("docs/")));

    assert!(fx.engine.search_related(&ctx, &source, 0, &opts).await.is_empty());
    assert!(fx
        .engine
        .search_related(&ctx, "no-such-chunk", 5, &opts)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_store_failure_degrades_to_empty() {
    let (fx, ctx) = Fixture::indexed().await;
    fx.store.set_offline(true);
    let hits = fx
        .engine
        .search(&ctx, "backoff", 5, &SearchOptions::default())
        .await;
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_query_embedding_failure_degrades_to_empty() {
    let (fx, ctx) = Fixture::indexed().await;
    fx.gateway.poison(Some("backoff"));
    let hits = fx
        .engine
        .search(&ctx, "backoff", 5, &SearchOptions::default())
        .await;
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_model_mismatch_returns_nothing() {
    let (fx, ctx) = Fixture::indexed().await;
    let engine = RetrievalEngine::new(
        Arc::new(FakeGateway::with_model("another-model")),
        fx.store.clone(),
    );
    let hits = engine.search(&ctx, "backoff", 5, &SearchOptions::default()).await;
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_search_is_scoped_to_its_codebase() {
    let (fx, ctx) = Fixture::indexed().await;

    let other_dir = TempDir::new().unwrap();
    write(other_dir.path(), "lib.rs", "pub fn backoff() -> u64 {\n    42\n}\n");
    let other = CodebaseContext::open(other_dir.path(), test_config()).unwrap();
    fx.coordinator.sync(&other).await.unwrap();

    let opts = SearchOptions::default();
    let hits = fx.engine.search(&other, "backoff", 10, &opts).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "lib.rs");

    let hits = fx.engine.search(&ctx, "backoff", 10, &opts).await;
    assert!(hits.iter().all(|h| h.path != "lib.rs"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_search_during_sync_sees_last_commit() {
    let (fx, ctx) = Fixture::indexed().await;
    let ctx = Arc::new(ctx);
    let opts = SearchOptions::default();
    let before = fx.engine.search(&ctx, "parse tokens", 10, &opts).await;

    // the syncing gateway blocks inside the embedding phase
    let slow = Arc::new(FakeGateway::new());
    let gate = slow.gate();
    let coordinator = Arc::new(IndexCoordinator::new(slow.clone(), fx.store.clone()));
    std::fs::remove_file(fx.dir.path().join("src/parser.rs")).unwrap();
    write(fx.dir.path(), "src/lexer.rs", "pub fn lex_tokens() {}\n");

    let mut phases = ctx.subscribe();
    let task = {
        let ctx = Arc::clone(&ctx);
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.sync(&ctx).await })
    };
    while *phases.borrow_and_update() != SyncPhase::Embedding {
        phases.changed().await.unwrap();
    }

    let during = fx.engine.search(&ctx, "parse tokens", 10, &opts).await;
    assert_eq!(during, before);
    assert!(during.iter().any(|h| h.path == "src/parser.rs"));

    gate.add_permits(1000);
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.files_removed, vec!["src/parser.rs"]);
    assert_eq!(ctx.phase(), SyncPhase::Idle);

    let after = fx.engine.search(&ctx, "parse tokens", 10, &opts).await;
    assert!(after.iter().all(|h| h.path != "src/parser.rs"));
    assert!(after.iter().any(|h| h.path == "src/lexer.rs"));
}
