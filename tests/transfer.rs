//! End-to-end transfers over the in-process loopback: a real coordinator
//! driving real slave streamers through encoded frames.

mod common;

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::timeout;

use common::{LoopbackProvider, MemWriter};
use rft::{
    CancelReason, Config, DownloadEvent, DownloadState, DownloadsManager, Range, RangeSet,
    ResourceId, TotalHash, UploadsManager,
};

fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_terminal(
    events: &mut tokio::sync::mpsc::Receiver<DownloadEvent>,
) -> (DownloadState, Option<CancelReason>) {
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(DownloadEvent::StateChanged { state, reason }) if state.is_terminal() => {
                    return (state, reason)
                }
                Some(_) => {}
                None => panic!("event stream ended before a terminal state"),
            }
        }
    })
    .await
    .expect("transfer did not finish in time")
}

#[tokio::test]
async fn test_two_providers_complete_disjoint_halves() {
    common::init_tracing();
    let data = test_bytes(1000);
    let uploads = Arc::new(UploadsManager::new(Config::default()));

    let provider_a = LoopbackProvider::partial(
        uploads.clone(),
        data.clone(),
        RangeSet::from_range(Range::new(0, 499)),
    );
    let provider_b = LoopbackProvider::partial(
        uploads.clone(),
        data.clone(),
        RangeSet::from_range(Range::new(500, 999)),
    );

    let downloads = DownloadsManager::new(Config::default());
    let writer = MemWriter::default();
    let state = writer.0.clone();
    let (id, mut events) = downloads
        .start(
            ResourceId::new("store", "halves"),
            Box::new(writer),
            None,
            None,
            None,
            1.0,
        )
        .unwrap();
    downloads.add_provider(id, &provider_a).await.unwrap();
    downloads.add_provider(id, &provider_b).await.unwrap();

    let (terminal, reason) = wait_terminal(&mut events).await;
    assert_eq!(terminal, DownloadState::Completed);
    assert_eq!(reason, None);

    let state = state.lock();
    assert!(state.completed);
    assert_eq!(state.buf, data);
    // Each byte was requested from exactly one provider.
    let written: usize = state.writes.iter().map(|(_, len)| len).sum();
    assert_eq!(written, 1000);
}

#[tokio::test]
async fn test_hash_verified_completion() {
    common::init_tracing();
    let data = test_bytes(5000);
    let digest = hex::encode(Sha256::digest(&data));

    let uploads = Arc::new(UploadsManager::new(Config::default()));
    let provider = LoopbackProvider::new(uploads.clone(), data.clone());

    let downloads = DownloadsManager::new(Config::default());
    let writer = MemWriter::default();
    let state = writer.0.clone();
    let (id, mut events) = downloads
        .start(
            ResourceId::new("store", "hashed"),
            Box::new(writer),
            Some(TotalHash::new("SHA-256", digest)),
            None,
            None,
            1.0,
        )
        .unwrap();
    downloads.add_provider(id, &provider).await.unwrap();

    let terminal = timeout(Duration::from_secs(10), async {
        let mut hashed_to_end = false;
        loop {
            match events.recv().await {
                Some(DownloadEvent::HashingProgress(100)) => hashed_to_end = true,
                Some(DownloadEvent::StateChanged { state, reason }) if state.is_terminal() => {
                    return (state, reason, hashed_to_end)
                }
                Some(_) => {}
                None => panic!("event stream ended before a terminal state"),
            }
        }
    })
    .await
    .expect("transfer did not finish in time");

    assert_eq!(terminal.0, DownloadState::Completed);
    assert!(terminal.2, "hashing never reached 100%");
    assert!(state.lock().completed);
    assert_eq!(state.lock().buf, data);
}

#[tokio::test]
async fn test_hash_mismatch_cancels_but_preserves_bytes() {
    common::init_tracing();
    let data = test_bytes(2000);
    let wrong = hex::encode(Sha256::digest(b"something else entirely"));

    let uploads = Arc::new(UploadsManager::new(Config::default()));
    let provider = LoopbackProvider::new(uploads.clone(), data.clone());

    let downloads = DownloadsManager::new(Config::default());
    let writer = MemWriter::default();
    let state = writer.0.clone();
    let (id, mut events) = downloads
        .start(
            ResourceId::new("store", "corrupt"),
            Box::new(writer),
            Some(TotalHash::new("SHA-256", wrong)),
            None,
            None,
            1.0,
        )
        .unwrap();
    downloads.add_provider(id, &provider).await.unwrap();

    let (terminal, reason) = wait_terminal(&mut events).await;
    assert_eq!(terminal, DownloadState::Cancelled);
    assert!(matches!(reason, Some(CancelReason::HashMismatch { .. })));

    // A mismatch is not a silent discard: the bytes stay on disk.
    let state = state.lock();
    assert!(state.stopped);
    assert!(!state.cancelled);
    assert_eq!(state.buf, data);
}

#[tokio::test]
async fn test_resume_never_rewrites_owned_bytes() {
    common::init_tracing();
    let data = test_bytes(1000);

    // A previous session already fetched the first half.
    let mut seeded = data.clone();
    seeded[500..].fill(0);
    let writer = MemWriter::resumed(
        1000,
        seeded,
        RangeSet::from_range(Range::new(0, 499)),
    );
    let state = writer.0.clone();

    let uploads = Arc::new(UploadsManager::new(Config::default()));
    let provider = LoopbackProvider::new(uploads.clone(), data.clone());

    let downloads = DownloadsManager::new(Config::default());
    let (id, mut events) = downloads
        .start(
            ResourceId::new("store", "resumed"),
            Box::new(writer),
            None,
            None,
            None,
            1.0,
        )
        .unwrap();
    downloads.add_provider(id, &provider).await.unwrap();

    let (terminal, _) = wait_terminal(&mut events).await;
    assert_eq!(terminal, DownloadState::Completed);

    let state = state.lock();
    assert_eq!(state.buf, data);
    // Only the missing half crossed the wire.
    for &(offset, len) in &state.writes {
        assert!(offset >= 500, "rewrote owned bytes at offset {offset}");
        assert!(offset as usize + len <= 1000);
    }
    let written: usize = state.writes.iter().map(|(_, len)| len).sum();
    assert_eq!(written, 500);
}

#[tokio::test]
async fn test_chunks_respect_intermediate_hash_windows() {
    common::init_tracing();
    let data = test_bytes(4096);
    let uploads = Arc::new(UploadsManager::new(Config::default()));
    let provider = LoopbackProvider::new(uploads.clone(), data.clone());

    let downloads = DownloadsManager::new(Config::default());
    let writer = MemWriter::default();
    let state = writer.0.clone();
    let (id, mut events) = downloads
        .start(
            ResourceId::new("store", "windowed"),
            Box::new(writer),
            None,
            None,
            Some(512),
            1.0,
        )
        .unwrap();
    downloads.add_provider(id, &provider).await.unwrap();

    let (terminal, _) = wait_terminal(&mut events).await;
    assert_eq!(terminal, DownloadState::Completed);

    let state = state.lock();
    assert_eq!(state.buf, data);
    // No chunk straddles a 512-byte hash window boundary.
    for &(offset, len) in &state.writes {
        assert_eq!(
            offset / 512,
            (offset + len as u64 - 1) / 512,
            "chunk at {offset}+{len} crosses a window boundary"
        );
    }
}

#[tokio::test]
async fn test_file_writer_end_to_end() {
    common::init_tracing();
    let data = test_bytes(3000);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resource.bin");

    let uploads = Arc::new(UploadsManager::new(Config::default()));
    let provider = LoopbackProvider::new(uploads.clone(), data.clone());

    let downloads = DownloadsManager::new(Config::default());
    let writer = rft::FileWriter::open(&path).unwrap();
    let (id, mut events) = downloads
        .start(
            ResourceId::new("store", "on-disk"),
            Box::new(writer),
            None,
            None,
            None,
            1.0,
        )
        .unwrap();
    downloads.add_provider(id, &provider).await.unwrap();

    let (terminal, _) = wait_terminal(&mut events).await;
    assert_eq!(terminal, DownloadState::Completed);

    assert_eq!(std::fs::read(&path).unwrap(), data);
    // Completion cleans the resume sidecar up.
    assert!(!dir.path().join("resource.bin.rftmeta").exists());
}
