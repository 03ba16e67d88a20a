mod helpers;

use archivist::config::ArchivistConfig;
use archivist::error::MemoryError;
use archivist::failover::StoreRole;
use archivist::memory::{content_hash, index};
use archivist::provider::EmbeddingProvider;
use archivist::retriever::{self, DELIMITER};
use archivist::service::{ContextMode, MemoryService};
use helpers::{test_db, BagEmbedding};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn service() -> (MemoryService, Arc<BagEmbedding>) {
    let conn = Arc::new(Mutex::new(test_db()));
    let provider = Arc::new(BagEmbedding::new());
    let svc = MemoryService::from_parts(
        conn,
        provider.clone() as Arc<dyn EmbeddingProvider>,
        ArchivistConfig::default(),
        StoreRole::Local,
    );
    (svc, provider)
}

#[test]
fn priority_bundle_leads_with_core_identity_under_budget() {
    let (svc, _) = service();
    let id_core = svc
        .add_memory(None, "I am the archivist.", Some("core_identity"), None, None)
        .unwrap();
    svc.add_memory(None, "an ingested framework note", Some("ingested"), None, None)
        .unwrap();
    svc.add_memory(None, "imported knowledge", Some("imported"), None, None)
        .unwrap();

    let bundle = svc.load_context(Some(1000), ContextMode::Priority, None).unwrap();
    assert_eq!(bundle.memory_ids[0], id_core);
    assert!(bundle.used_tokens <= 1000);
    assert!(bundle.text.chars().count() <= 4000);
}

#[test]
fn oversized_memory_truncated_to_exact_budget() {
    let (svc, _) = service();
    svc.add_memory(None, &"x".repeat(10_000), Some("core_identity"), None, None)
        .unwrap();

    let bundle = svc.load_context(Some(100), ContextMode::Priority, None).unwrap();
    assert_eq!(bundle.memory_ids.len(), 1);
    assert_eq!(bundle.text.chars().count(), 400);
}

#[test]
fn higher_priority_namespaces_come_first() {
    let (svc, _) = service();
    // Insert in reverse priority order to rule out insertion-order effects
    let id_imported = svc.add_memory(None, "imported row", Some("imported"), None, None).unwrap();
    let id_session = svc
        .add_memory(None, "session row", Some("session_recovery"), None, None)
        .unwrap();
    let id_wolf = svc.add_memory(None, "wolf row", Some("logical-wolf"), None, None).unwrap();
    let id_ingested = svc.add_memory(None, "ingested row", Some("ingested"), None, None).unwrap();
    let id_core = svc.add_memory(None, "core row", Some("core_identity"), None, None).unwrap();

    let bundle = svc.load_context(Some(1000), ContextMode::Priority, None).unwrap();
    assert_eq!(
        bundle.memory_ids,
        vec![id_core, id_ingested, id_wolf, id_session, id_imported]
    );

    let sections: Vec<&str> = bundle.text.split(DELIMITER).collect();
    assert_eq!(sections, vec![
        "core row",
        "ingested row",
        "wolf row",
        "session row",
        "imported row",
    ]);
}

#[test]
fn bundle_is_deterministic() {
    let (svc, _) = service();
    svc.add_memory(None, "alpha memory", Some("core_identity"), None, None).unwrap();
    svc.add_memory(None, "beta memory", Some("ingested"), None, None).unwrap();

    let a = svc.load_context(Some(500), ContextMode::Priority, None).unwrap();
    let b = svc.load_context(Some(500), ContextMode::Priority, None).unwrap();
    assert_eq!(a.text, b.text);
    assert_eq!(a.memory_ids, b.memory_ids);
    assert_eq!(a.used_tokens, b.used_tokens);
}

#[test]
fn semantic_bundle_prefers_similar_memories() {
    let (svc, provider) = service();
    let id_match = svc.add_memory(None, "hello world", Some("imported"), None, None).unwrap();
    let id_other = svc.add_memory(None, "random topic", Some("imported"), None, None).unwrap();
    {
        let conn = svc.connection();
        let mut c = conn.lock().unwrap();
        for (id, text) in [(id_match, "hello world"), (id_other, "random topic")] {
            let v = provider.embed(text).unwrap();
            index::upsert(&mut c, id, 0, &v, &content_hash(text)).unwrap();
        }
    }

    let bundle = svc
        .load_context(Some(1000), ContextMode::Semantic, Some("hello"))
        .unwrap();
    assert_eq!(bundle.memory_ids[0], id_match);
}

#[test]
fn semantic_tie_broken_by_sentiment() {
    let (svc, provider) = service();
    let id_low = svc
        .add_memory(
            None,
            "tied content",
            Some("imported"),
            None,
            Some(&serde_json::json!({"sentiment_level": 4})),
        )
        .unwrap();
    let id_high = svc
        .add_memory(
            None,
            "tied content",
            Some("imported"),
            None,
            Some(&serde_json::json!({"sentiment_level": 2})),
        )
        .unwrap();
    {
        let conn = svc.connection();
        let mut c = conn.lock().unwrap();
        let v = provider.embed("tied content").unwrap();
        index::upsert(&mut c, id_low, 0, &v, &content_hash("tied content")).unwrap();
        index::upsert(&mut c, id_high, 0, &v, &content_hash("tied content")).unwrap();
    }

    let query = provider.embed("tied content").unwrap();
    let conn = svc.connection();
    let c = conn.lock().unwrap();
    let ranked = retriever::search_ranked(&c, &query, 5, None).unwrap();
    assert_eq!(ranked[0].0.id, id_high);
}

#[test]
fn semantic_mode_degrades_to_priority_when_provider_down() {
    let (svc, provider) = service();
    let id = svc.add_memory(None, "core fact", Some("core_identity"), None, None).unwrap();
    provider.fail.store(true, Ordering::SeqCst);

    let bundle = svc
        .load_context(Some(500), ContextMode::Semantic, Some("anything"))
        .unwrap();
    assert_eq!(bundle.memory_ids, vec![id]);

    // Direct search still surfaces the typed error
    let res = svc.search_memories("anything", 3, None);
    assert!(matches!(res, Err(MemoryError::EmbeddingUnavailable(_))));
}

struct SlowEmbedding;

impl EmbeddingProvider for SlowEmbedding {
    fn embed(&self, _: &str) -> archivist::error::Result<Vec<f32>> {
        std::thread::sleep(Duration::from_millis(400));
        let mut v = vec![0.0f32; 8];
        v[0] = 1.0;
        Ok(v)
    }
    fn dimensions(&self) -> usize {
        8
    }
    fn health(&self) -> archivist::error::Result<()> {
        Ok(())
    }
}

#[test]
fn slow_embedding_does_not_block_writes() {
    let conn = Arc::new(Mutex::new(test_db()));
    let svc = Arc::new(MemoryService::from_parts(
        conn,
        Arc::new(SlowEmbedding),
        ArchivistConfig::default(),
        StoreRole::Local,
    ));

    let searcher = Arc::clone(&svc);
    let search = std::thread::spawn(move || searcher.search_memories("anything", 3, None));

    // Let the search reach the model call, then write.
    std::thread::sleep(Duration::from_millis(100));
    let start = Instant::now();
    svc.add_memory(None, "written mid-search", None, None, None).unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(200),
        "write stalled behind an in-flight embedding"
    );
    search.join().unwrap().unwrap();
}
