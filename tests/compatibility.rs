//! Behavioral contract every backend must satisfy
//!
//! Each test runs against the in-memory store, a temporary local directory,
//! and an HTTP object service fake.

mod support;

use bytes::Bytes;
use futures::TryStreamExt;
use rstest::rstest;
use stowage::{ErrorKind, Tags};
use support::{Flavor, Harness};
use tokio::task::JoinSet;

fn keys(listing: &[stowage::ObjectMetadata]) -> Vec<String> {
    listing.iter().map(|m| m.key.to_string()).collect()
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn put_then_get_returns_body_and_hash(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    let meta = h.client.put("docs/readme.md", "# Stowage").await.unwrap();
    assert_eq!(meta.size_bytes, 9);
    assert!(meta.content_hash.verify(b"# Stowage"));

    let object = h.client.get("docs/readme.md").await.unwrap();
    assert_eq!(object.body, Bytes::from_static(b"# Stowage"));
    assert_eq!(object.metadata.content_hash, meta.content_hash);
    assert_eq!(object.metadata.size_bytes, 9);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn equivalent_spellings_address_one_object(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    h.client.put("/a//b/c.txt/", "v1").await.unwrap();
    let object = h.client.get("a/b/c.txt").await.unwrap();
    assert_eq!(object.metadata.key.to_string(), "a/b/c.txt");
    assert_eq!(h.client.list_all("").await.unwrap().len(), 1);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn dot_segments_are_invalid(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    for raw in ["a/../b", "./x", "", "/"] {
        let err = h.client.put(raw, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey, "{raw:?}");
    }
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn missing_key_is_not_found(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    assert_eq!(h.client.get("missing/key").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        h.client.stat_metadata("missing/key").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(!h.client.exists("missing/key").await.unwrap());
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn delete_twice_succeeds(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    h.client.put("tmp/scratch", "bytes").await.unwrap();
    h.client.delete("tmp/scratch").await.unwrap();
    h.client.delete("tmp/scratch").await.unwrap();
    assert_eq!(h.client.get("tmp/scratch").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn put_if_match_is_optimistic_concurrency(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    let h1 = h.client.put("counter", "1").await.unwrap().content_hash;
    let h2 = h.client.put_if_match("counter", "2", &h1).await.unwrap().content_hash;

    // A second writer holding the stale hash loses
    let err = h.client.put_if_match("counter", "3", &h1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let current = h.client.get("counter").await.unwrap();
    assert_eq!(current.body.as_ref(), b"2");
    assert_eq!(current.metadata.content_hash, h2);

    // Conditional write against an absent key also conflicts
    let err = h.client.put_if_match("never-written", "x", &h2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn put_if_absent_creates_once(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    h.client.put_if_absent("lock", "owner-a").await.unwrap();
    let err = h.client.put_if_absent("lock", "owner-b").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(h.client.get("lock").await.unwrap().body.as_ref(), b"owner-a");
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn tampered_body_is_corrupt(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    h.client.put("ledger", "balance=100").await.unwrap();
    h.tamper("ledger", b"balance=999");

    assert_eq!(h.client.get("ledger").await.unwrap_err().kind(), ErrorKind::Corrupt);

    let stream = h.client.get_stream("ledger").await.unwrap();
    assert_eq!(stream.read_to_end().await.unwrap_err().kind(), ErrorKind::Corrupt);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn listing_respects_segment_boundaries(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    for key in ["a/b/c.txt", "a/b/d.txt", "a/bc/e.txt", "b/a.txt"] {
        h.client.put(key, "x").await.unwrap();
    }

    assert_eq!(keys(&h.client.list_all("a/b").await.unwrap()), vec!["a/b/c.txt", "a/b/d.txt"]);
    assert_eq!(h.client.list_all("a").await.unwrap().len(), 3);
    assert_eq!(h.client.list_all("/").await.unwrap().len(), 4);
    assert!(h.client.list_all("c").await.unwrap().is_empty());
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn listing_pages_lazily_in_key_order(#[case] flavor: Flavor) {
    let h = Harness::with_page_size(flavor, 3).await;

    for i in (0..10).rev() {
        h.client.put(&format!("logs/{i:03}"), "entry").await.unwrap();
    }

    let mut stream = h.client.list("logs").unwrap();
    let first = stream.try_next().await.unwrap().unwrap();
    assert_eq!(first.key.to_string(), "logs/000");

    let rest: Vec<_> = stream.try_collect().await.unwrap();
    assert_eq!(rest.len(), 9);
    assert!(rest.windows(2).all(|w| w[0].key < w[1].key));

    let page = h.client.list_page("logs", None).await.unwrap();
    assert_eq!(page.objects.len(), 3);
    assert!(page.next.is_some());
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn streamed_write_is_invisible_until_commit(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    let mut writer = h.client.writer("media/clip.bin", Tags::new()).await.unwrap();
    for chunk in ["frame-1;", "frame-2;", "frame-3;"] {
        writer.write(chunk).await.unwrap();
        assert!(!h.client.exists("media/clip.bin").await.unwrap());
    }
    let meta = writer.commit().await.unwrap();
    assert_eq!(meta.size_bytes, 24);

    let stream = h.client.get_stream("media/clip.bin").await.unwrap();
    assert_eq!(stream.metadata().content_hash, meta.content_hash);
    assert_eq!(stream.read_to_end().await.unwrap().as_ref(), b"frame-1;frame-2;frame-3;");

    let mut abandoned = h.client.writer("media/partial.bin", Tags::new()).await.unwrap();
    abandoned.write("half").await.unwrap();
    drop(abandoned);
    assert!(!h.client.exists("media/partial.bin").await.unwrap());
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn tags_round_trip(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;
    let mut tags = Tags::new();
    tags.insert("content-type".to_string(), "image/png".to_string());
    tags.insert("owner".to_string(), "team-storage".to_string());

    h.client.put_with_tags("img/logo.png", vec![0x89u8, 0x50], tags.clone()).await.unwrap();

    assert_eq!(h.client.stat_metadata("img/logo.png").await.unwrap().tags, tags);
    let listed = h.client.list_all("img").await.unwrap();
    assert_eq!(listed[0].tags, tags);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn overwrite_replaces_metadata(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    let first = h.client.put("k", "short").await.unwrap();
    let second = h.client.put("k", "a longer body").await.unwrap();
    assert_ne!(first.content_hash, second.content_hash);

    let meta = h.client.stat_metadata("k").await.unwrap();
    assert_eq!(meta.size_bytes, 13);
    assert_eq!(meta.content_hash, second.content_hash);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_conditional_writes_have_one_winner(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;
    let base = h.client.put("race", "base").await.unwrap().content_hash;

    let mut writers = JoinSet::new();
    for i in 0..16 {
        let client = h.client.clone();
        let expected = base.clone();
        writers.spawn(async move {
            let body = format!("writer-{i}");
            client
                .put_if_match("race", body.clone(), &expected)
                .await
                .map(|_| body)
        });
    }

    let mut winners = Vec::new();
    while let Some(joined) = writers.join_next().await {
        match joined.unwrap() {
            Ok(body) => winners.push(body),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Conflict, "{err}"),
        }
    }
    assert_eq!(winners.len(), 1, "{winners:?}");
    let stored = h.client.get("race").await.unwrap();
    assert_eq!(stored.body, Bytes::from(winners.remove(0)));
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_on_distinct_keys_all_land(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    let mut callers = JoinSet::new();
    for i in 0..24 {
        let client = h.client.clone();
        callers.spawn(async move {
            let key = format!("shared/dir/{i:02}");
            client.put(&key, format!("body-{i}")).await?;
            let object = client.get(&key).await?;
            assert_eq!(object.body, Bytes::from(format!("body-{i}")));
            if i % 3 == 0 {
                client.delete(&key).await?;
            }
            client.exists(&key).await
        });
    }
    while let Some(joined) = callers.join_next().await {
        joined.unwrap().unwrap();
    }

    assert_eq!(h.client.list_all("shared").await.unwrap().len(), 16);
}

#[rstest]
#[case::memory(Flavor::Memory)]
#[case::local(Flavor::Local)]
#[case::remote(Flavor::Remote)]
#[tokio::test]
async fn key_named_like_a_descriptor_does_not_shadow_its_neighbour(#[case] flavor: Flavor) {
    let h = Harness::new(flavor).await;

    h.client.put("x.json/y", "nested").await.unwrap();
    assert!(!h.client.exists("x").await.unwrap());
    assert_eq!(h.client.get("x").await.unwrap_err().kind(), ErrorKind::NotFound);

    h.client.put("x", "top").await.unwrap();
    assert_eq!(keys(&h.client.list_all("").await.unwrap()), vec!["x", "x.json/y"]);
    assert_eq!(h.client.get("x").await.unwrap().body.as_ref(), b"top");
}

#[tokio::test]
async fn remote_service_hiccups_are_retried() {
    let (server, service) = support::FakeObjectService::start().await;
    let backend = stowage::RemoteBackend::new(
        stowage::RemoteConfig::new(server.uri(), support::BUCKET),
        stowage::Credential::bearer("test-token"),
    )
    .unwrap();
    let client = stowage::StorageClient::with_policy(
        std::sync::Arc::new(backend),
        support::test_policy(),
        std::time::Duration::from_secs(30),
    );

    service.fail_next(2);
    client.put("flaky", "eventually").await.unwrap();

    service.fail_next(10);
    let err = client.get("flaky").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    service.fail_next(0);
    assert_eq!(client.get("flaky").await.unwrap().body.as_ref(), b"eventually");
}
