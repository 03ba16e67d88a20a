mod helpers;

use archivist::config::LibrarianConfig;
use archivist::librarian::Librarian;
use archivist::memory::types::EMBEDDING_ERROR_KEY;
use archivist::memory::{chunk_text, content_hash, index, store};
use archivist::provider::EmbeddingProvider;
use archivist::retriever;
use helpers::{insert_memory, test_db, BagEmbedding};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

fn librarian_config() -> LibrarianConfig {
    LibrarianConfig {
        workers: 2,
        min_embed_len: 1,
        max_attempts: 2,
        chunk_max: 100,
        chunk_overlap: 10,
        ..Default::default()
    }
}

fn setup() -> (Librarian, Arc<Mutex<rusqlite::Connection>>, Arc<BagEmbedding>) {
    let conn = Arc::new(Mutex::new(test_db()));
    let provider = Arc::new(BagEmbedding::new());
    let librarian = Librarian::new(
        Arc::clone(&conn),
        provider.clone() as Arc<dyn EmbeddingProvider>,
        librarian_config(),
    );
    (librarian, conn, provider)
}

#[test]
fn insert_then_embed_then_search() {
    let (mut librarian, conn, provider) = setup();
    let id = {
        let c = conn.lock().unwrap();
        insert_memory(&c, "hello world", "ingested")
    };

    let stats = librarian.run_once(false).unwrap();
    assert_eq!(stats.embedded, 1);

    let c = conn.lock().unwrap();
    assert!(!index::is_stale(&c, id, 100, 10).unwrap());

    let query = provider.embed("hello").unwrap();
    let hits = index::search(&c, &query, 1, None).unwrap();
    assert_eq!(hits[0].0, id);
    assert!(hits[0].1 > 0.5);
}

#[test]
fn repeated_runs_produce_identical_index() {
    let (mut librarian, conn, _provider) = setup();
    {
        let c = conn.lock().unwrap();
        insert_memory(&c, "a stable memory", "imported");
        insert_memory(&c, &"long content ".repeat(20), "imported");
    }

    librarian.run_once(true).unwrap();
    let first: Vec<_> = {
        let c = conn.lock().unwrap();
        (1..=2)
            .flat_map(|id| index::entries(&c, id).unwrap())
            .map(|e| (e.memory_id, e.chunk_ordinal, e.source_hash))
            .collect()
    };

    librarian.run_once(true).unwrap();
    let second: Vec<_> = {
        let c = conn.lock().unwrap();
        (1..=2)
            .flat_map(|id| index::entries(&c, id).unwrap())
            .map(|e| (e.memory_id, e.chunk_ordinal, e.source_hash))
            .collect()
    };

    assert_eq!(first, second);
}

#[test]
fn fresh_rows_carry_current_content_hashes() {
    let (mut librarian, conn, _provider) = setup();
    let content = "word ".repeat(60); // multi-chunk at chunk_max=100
    let id = {
        let c = conn.lock().unwrap();
        insert_memory(&c, &content, "imported")
    };

    librarian.run_once(false).unwrap();

    let c = conn.lock().unwrap();
    let expected: Vec<String> = chunk_text(&content, 100, 10)
        .iter()
        .map(|chunk| content_hash(chunk))
        .collect();
    let stored: Vec<String> = index::entries(&c, id)
        .unwrap()
        .into_iter()
        .map(|e| e.source_hash)
        .collect();
    assert_eq!(stored, expected);
}

#[test]
fn content_update_invalidates_and_reindexes() {
    let (mut librarian, conn, provider) = setup();
    let id = {
        let c = conn.lock().unwrap();
        insert_memory(&c, "A", "imported")
    };
    librarian.run_once(false).unwrap();

    {
        let mut c = conn.lock().unwrap();
        store::update_content(&mut c, id, "B").unwrap();
        assert!(index::is_stale(&c, id, 100, 10).unwrap());
    }

    librarian.run_once(true).unwrap();

    let c = conn.lock().unwrap();
    let entries = index::entries(&c, id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source_hash, content_hash("B"));

    let hits_b = index::search(&c, &provider.embed("B").unwrap(), 1, None).unwrap();
    assert_eq!(hits_b[0].0, id);
    assert!(hits_b[0].1 > 0.9);

    // The old content no longer matches
    let hits_a = index::search(&c, &provider.embed("A").unwrap(), 1, None).unwrap();
    assert!(hits_a[0].1 < 0.1);
}

#[test]
fn provider_outage_poisons_then_content_change_recovers() {
    let (mut librarian, conn, provider) = setup();
    let id = {
        let c = conn.lock().unwrap();
        insert_memory(&c, "stubborn row", "imported")
    };

    provider.fail.store(true, Ordering::SeqCst);
    librarian.run_once(false).unwrap();
    librarian.run_once(true).unwrap(); // max_attempts = 2 → poisoned
    provider.fail.store(false, Ordering::SeqCst);

    {
        let c = conn.lock().unwrap();
        let meta = store::get_memory(&c, id).unwrap().metadata.unwrap();
        assert!(meta.get(EMBEDDING_ERROR_KEY).is_some());
    }

    // Still skipped while poisoned
    assert_eq!(librarian.run_once(true).unwrap().embedded, 0);

    // A correction clears the tag and the row gets embedded
    {
        let mut c = conn.lock().unwrap();
        store::update_content(&mut c, id, "corrected row").unwrap();
    }
    assert_eq!(librarian.run_once(true).unwrap().embedded, 1);
}

#[test]
fn search_skips_rows_deleted_after_indexing() {
    let (mut librarian, conn, provider) = setup();
    let keep;
    {
        let c = conn.lock().unwrap();
        keep = insert_memory(&c, "hello again", "imported");
        insert_memory(&c, "hello doomed", "imported");
    }
    librarian.run_once(false).unwrap();

    {
        let mut c = conn.lock().unwrap();
        store::hard_delete(&mut c, keep + 1).unwrap();
    }

    let query = provider.embed("hello").unwrap();
    let c = conn.lock().unwrap();
    let hits = retriever::search_ranked(&c, &query, 5, None).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, keep);
}
