use std::sync::Arc;
use std::time::Duration;

use retrieval_core::error::BackendError;
use retrieval_core::normalize::normalize;
use retrieval_core::traits::VectorBackend;
use retrieval_core::types::{BackendId, DocumentChunk, Filters, HealthState, Meta, PageRef, NO_CONTENT};
use retrieval_local::LocalAnnBackend;
use tempfile::TempDir;

const DIM: usize = 8;
const INDEX: &str = "bylaws";

fn embedding(i: usize) -> Vec<f32> {
    (0..DIM).map(|j| ((i + 1) as f32 * (j + 1) as f32 * 0.37).sin() + 1.5).collect()
}

fn chunks(range: std::ops::Range<usize>) -> Vec<DocumentChunk> {
    range
        .map(|i| DocumentChunk {
            id: format!("bylaws:{i}"),
            content: format!("bylaw section {i}"),
            source: if i % 2 == 0 { "zoning.pdf" } else { "parking.pdf" }.to_string(),
            page: Some(i as u32 + 1),
            offset: None,
            metadata: Meta::new(),
            embedding: embedding(i),
        })
        .collect()
}

async fn seeded(n: usize) -> anyhow::Result<(TempDir, LocalAnnBackend)> {
    let tmp = TempDir::new()?;
    let backend = LocalAnnBackend::new(BackendId::from("local"), tmp.path());
    backend.upsert(INDEX, &chunks(0..n)).await?;
    Ok((tmp, backend))
}

#[tokio::test]
async fn upsert_then_search_returns_nearest_first() -> anyhow::Result<()> {
    let (_tmp, backend) = seeded(20).await?;
    let hits = backend.search(INDEX, &embedding(3), 5, &Filters::new()).await?;
    assert_eq!(hits.len(), 5);
    let top = normalize(&hits[0], backend.id());
    assert_eq!(top.chunk_id, "bylaws:3");
    assert_eq!(top.content, "bylaw section 3");
    assert_eq!(top.source, "parking.pdf");
    assert_eq!(top.page, PageRef::Number(4));
    assert!(top.score > 0.999, "exact match should score ~1, got {}", top.score);
    assert!(!top.anomaly);
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score, "hits are score-descending");
    }
    Ok(())
}

#[tokio::test]
async fn filters_are_pushed_down_or_rejected() -> anyhow::Result<()> {
    let (_tmp, backend) = seeded(20).await?;
    let mut filters = Filters::new();
    filters.insert("source".into(), "zoning.pdf".into());
    let hits = backend.search(INDEX, &embedding(3), 10, &filters).await?;
    assert!(!hits.is_empty());
    for h in &hits {
        assert_eq!(normalize(h, backend.id()).source, "zoning.pdf");
    }

    let mut unsupported = Filters::new();
    unsupported.insert("department".into(), "planning".into());
    let err = backend.search(INDEX, &embedding(3), 10, &unsupported).await.unwrap_err();
    assert!(matches!(err, BackendError::UnsupportedFilter(ref k) if k == "department"), "{err}");
    Ok(())
}

#[tokio::test]
async fn describe_and_list() -> anyhow::Result<()> {
    let (_tmp, backend) = seeded(12).await?;
    let d = backend.describe_index(INDEX).await?;
    assert_eq!(d.dimension, DIM);
    assert_eq!(d.vector_count, 12);
    assert!(backend.list_collections().await?.contains(&INDEX.to_string()));
    assert_eq!(backend.health_check(Duration::from_secs(2)).await?, HealthState::Healthy);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_loads_once() -> anyhow::Result<()> {
    let (tmp, writer) = seeded(30).await?;
    drop(writer);

    let backend = Arc::new(LocalAnnBackend::new(BackendId::from("local"), tmp.path()));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let b = backend.clone();
        handles.push(tokio::spawn(async move { b.open_index(INDEX).await }));
    }
    let mut loaded = Vec::new();
    for h in handles {
        loaded.push(h.await??);
    }
    assert_eq!(backend.load_count(), 1, "exactly one physical load");
    assert!(loaded.iter().all(|i| Arc::ptr_eq(i, &loaded[0])), "all callers share the loaded index");

    backend.search(INDEX, &embedding(1), 3, &Filters::new()).await?;
    assert_eq!(backend.load_count(), 1, "later searches reuse the cached index");
    Ok(())
}

#[tokio::test]
async fn metadata_mismatch_degrades_but_still_serves() -> anyhow::Result<()> {
    let (tmp, writer) = seeded(100).await?;
    drop(writer);

    let meta_path = tmp.path().join(format!("{INDEX}.meta.json"));
    let mut file: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
    let records = file["records"].as_object_mut().expect("versioned store");
    for row in ["10", "20", "30"] {
        records.remove(row);
    }
    std::fs::write(&meta_path, serde_json::to_vec(&file)?)?;

    let backend = LocalAnnBackend::new(BackendId::from("local"), tmp.path());
    let index = backend.open_index(INDEX).await?;
    assert!(!index.is_consistent());
    assert_eq!(index.metadata_entries().await, 97);
    assert_eq!(backend.describe_index(INDEX).await?.vector_count, 100);
    assert_eq!(backend.health_check(Duration::from_secs(2)).await?, HealthState::Degraded);

    let hits = backend.search(INDEX, &embedding(0), 100, &Filters::new()).await?;
    assert_eq!(hits.len(), 100);
    let results: Vec<_> = hits.iter().map(|h| normalize(h, backend.id())).collect();
    let mut flagged: Vec<&str> = results.iter().filter(|r| r.anomaly).map(|r| r.chunk_id.as_str()).collect();
    flagged.sort_unstable();
    assert_eq!(flagged, vec!["10", "20", "30"]);
    assert!(results.iter().filter(|r| r.anomaly).all(|r| r.content == NO_CONTENT));
    Ok(())
}

#[tokio::test]
async fn missing_directory_is_unreachable() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalAnnBackend::new(BackendId::from("local"), tmp.path().join("does-not-exist"));
    assert!(matches!(backend.connect().await, Err(BackendError::Unreachable(_))));
    assert!(matches!(backend.health_check(Duration::from_millis(500)).await, Err(BackendError::Unreachable(_))));
    let err = backend.search(INDEX, &embedding(0), 5, &Filters::new()).await.unwrap_err();
    assert!(err.is_explicit_outage(), "{err}");
}

#[tokio::test]
async fn rejects_bad_requests() -> anyhow::Result<()> {
    let (_tmp, backend) = seeded(5).await?;
    let err = backend.search(INDEX, &embedding(0), 0, &Filters::new()).await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidRequest(_)));
    let err = backend.search(INDEX, &[1.0, 2.0], 3, &Filters::new()).await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidRequest(_)));

    let mut wrong = chunks(5..6);
    wrong[0].embedding = vec![1.0; DIM + 1];
    let err = backend.upsert(INDEX, &wrong).await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidRequest(_)));
    assert!(matches!(backend.search("../etc", &embedding(0), 1, &Filters::new()).await, Err(BackendError::InvalidRequest(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn searches_run_alongside_upserts() -> anyhow::Result<()> {
    let (_tmp, backend) = seeded(10).await?;
    let backend = Arc::new(backend);

    let mut readers = Vec::new();
    for i in 0..8 {
        let b = backend.clone();
        readers.push(tokio::spawn(async move { b.search(INDEX, &embedding(i), 3, &Filters::new()).await }));
    }
    for batch in 0..3 {
        let start = 10 + batch * 5;
        backend.upsert(INDEX, &chunks(start..start + 5)).await?;
    }
    for r in readers {
        assert!(!r.await??.is_empty());
    }

    let d = backend.describe_index(INDEX).await?;
    assert_eq!(d.vector_count, 25);
    assert!(backend.open_index(INDEX).await?.is_consistent());
    assert_eq!(backend.load_count(), 1);
    Ok(())
}

fn only_chunk(id: &str) -> Filters {
    let mut f = Filters::new();
    f.insert("chunk_id".into(), id.into());
    f
}

#[tokio::test]
async fn upserting_an_existing_chunk_replaces_it() -> anyhow::Result<()> {
    let (tmp, backend) = seeded(20).await?;
    let mut revised = chunks(3..4);
    revised[0].content = "bylaw section 3, amended".into();
    backend.upsert(INDEX, &revised).await?;
    backend.upsert(INDEX, &revised).await?;

    assert_eq!(backend.describe_index(INDEX).await?.vector_count, 20);
    let hits = backend.search(INDEX, &embedding(3), 10, &only_chunk("bylaws:3")).await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(normalize(&hits[0], backend.id()).content, "bylaw section 3, amended");

    let mut twice = chunks(25..26);
    twice.extend(chunks(25..26));
    twice[1].content = "second copy".into();
    backend.upsert(INDEX, &twice).await?;
    assert_eq!(backend.describe_index(INDEX).await?.vector_count, 21);
    let hits = backend.search(INDEX, &embedding(25), 10, &only_chunk("bylaws:25")).await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(normalize(&hits[0], backend.id()).content, "second copy");
    drop(backend);

    let reopened = LocalAnnBackend::new(BackendId::from("local"), tmp.path());
    let index = reopened.open_index(INDEX).await?;
    assert!(index.is_consistent());
    assert_eq!(index.metadata_entries().await, 21);
    let hits = reopened.search(INDEX, &embedding(3), 10, &only_chunk("bylaws:3")).await?;
    assert_eq!(normalize(&hits[0], reopened.id()).content, "bylaw section 3, amended");
    Ok(())
}

#[tokio::test]
async fn failed_store_write_leaves_index_unchanged() -> anyhow::Result<()> {
    let (tmp, backend) = seeded(10).await?;
    backend.open_index(INDEX).await?;

    // a non-empty directory in place of the store file makes the rename fail
    let meta_path = tmp.path().join(format!("{INDEX}.meta.json"));
    std::fs::remove_file(&meta_path)?;
    std::fs::create_dir(&meta_path)?;
    std::fs::write(meta_path.join("blocker"), b"x")?;

    let mut batch = chunks(2..3);
    batch[0].content = "never written".into();
    batch.extend(chunks(10..12));
    let err = backend.upsert(INDEX, &batch).await.unwrap_err();
    assert!(matches!(err, BackendError::Storage(_)), "{err}");

    let index = backend.open_index(INDEX).await?;
    assert!(index.is_consistent());
    assert_eq!(index.metadata_entries().await, 10);
    assert_eq!(backend.describe_index(INDEX).await?.vector_count, 10);
    let hits = backend.search(INDEX, &embedding(2), 5, &only_chunk("bylaws:2")).await?;
    assert_eq!(normalize(&hits[0], backend.id()).content, "bylaw section 2");
    assert!(backend.search(INDEX, &embedding(11), 5, &only_chunk("bylaws:11")).await?.is_empty());

    std::fs::remove_dir_all(&meta_path)?;
    backend.upsert(INDEX, &batch).await?;
    drop(backend);

    let reopened = LocalAnnBackend::new(BackendId::from("local"), tmp.path());
    let index = reopened.open_index(INDEX).await?;
    assert!(index.is_consistent());
    assert_eq!(reopened.describe_index(INDEX).await?.vector_count, 12);
    let hits = reopened.search(INDEX, &embedding(2), 5, &only_chunk("bylaws:2")).await?;
    assert_eq!(normalize(&hits[0], reopened.id()).content, "never written");
    Ok(())
}
