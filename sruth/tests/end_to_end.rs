use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use sruth::config::Config;
use sruth::node::{SinkNode, SourceNode};
use sruth::tracker::Tracker;
use sruth_archive::{Archive, ArchiveConfig};
use sruth_core::{
    ArchivePath, ArchiveTime, FileId, FileInfo, Piece, Predicate, PIECE_SIZE,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_config(port_base: u16) -> Config {
    Config {
        port_range_start: port_base,
        port_range_end: port_base + 20,
        tracker_poll_seconds: 1,
        ..Config::default()
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

async fn start_tracker(cancel: &CancellationToken) -> (SocketAddr, JoinHandle<()>) {
    let tracker = Tracker::bind((LOCALHOST, 0).into()).await.unwrap();
    let addr = tracker.local_addr().unwrap();
    let cancel = cancel.clone();
    let task = tokio::spawn(async move {
        tracker.run(cancel).await.unwrap();
    });
    (addr, task)
}

/// Polls until the visible file appears; whenever it is observed it must
/// already be whole, since materialization is an atomic rename.
async fn wait_for_file(path: &Path, expected: &[u8], timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(contents) = std::fs::read(path) {
            assert_eq!(
                contents.len(),
                expected.len(),
                "visible file must never be observed incomplete: {}",
                path.display()
            );
            assert_eq!(contents, expected, "transferred bytes differ");
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            path.display()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_publisher_single_subscriber() {
    let cancel = CancellationToken::new();
    let (tracker_addr, _tracker) = start_tracker(&cancel).await;

    // The publisher's archive holds one 200,000-byte file up front.
    let source_root = TempDir::new().unwrap();
    std::fs::create_dir_all(source_root.path().join("a")).unwrap();
    let payload = patterned(200_000);
    std::fs::write(source_root.path().join("a/b.txt"), &payload).unwrap();

    let source_archive =
        Archive::open(source_root.path(), test_config(42000).archive_config()).unwrap();
    let source = SourceNode::new(
        source_archive,
        LOCALHOST,
        test_config(42000),
        vec![tracker_addr],
    )
    .await
    .unwrap();
    tokio::spawn(source.run(cancel.clone()));

    let sink_root = TempDir::new().unwrap();
    let sink_archive =
        Archive::open(sink_root.path(), test_config(42030).archive_config()).unwrap();
    let sink = SinkNode::new(
        sink_archive,
        LOCALHOST,
        test_config(42030),
        vec![tracker_addr],
        Predicate::everything(),
    )
    .await
    .unwrap();
    let sink_house = sink.clearing_house();
    tokio::spawn(sink.run(cancel.clone()));

    wait_for_file(
        &sink_root.path().join("a/b.txt"),
        &payload,
        Duration::from_secs(30),
    )
    .await;

    // A file created while both nodes run flows through the watcher.
    let late = patterned(1_000);
    std::fs::create_dir_all(source_root.path().join("c")).unwrap();
    std::fs::write(source_root.path().join("c/d.txt"), &late).unwrap();
    wait_for_file(
        &sink_root.path().join("c/d.txt"),
        &late,
        Duration::from_secs(30),
    )
    .await;

    // Quiescence: nothing left in flight.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sink_house.outstanding_count(), 0);

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_after_partial_delivery() {
    let cancel = CancellationToken::new();
    let (tracker_addr, _tracker) = start_tracker(&cancel).await;

    let payload = patterned(200_000);
    let time = ArchiveTime::from_millis(1_700_000_000_000);

    // The publisher holds the complete file with a pinned timestamp.
    let source_root = TempDir::new().unwrap();
    std::fs::create_dir_all(source_root.path().join("a")).unwrap();
    let source_file = source_root.path().join("a/b.txt");
    std::fs::write(&source_file, &payload).unwrap();
    time.apply_to(&source_file).unwrap();

    // The subscriber already received piece 0 in this session.
    let sink_root = TempDir::new().unwrap();
    let sink_archive =
        Archive::open(sink_root.path(), test_config(42130).archive_config()).unwrap();
    let info = FileInfo::new(
        FileId::new(ArchivePath::new("a/b.txt").unwrap(), time),
        payload.len() as u64,
        PIECE_SIZE,
        3600,
    );
    let first = Piece::new(
        info.clone(),
        0,
        Bytes::from(payload[..PIECE_SIZE as usize].to_vec()),
    );
    assert!(!sink_archive.put_piece(&first).unwrap());
    assert!(sink_root.path().join(".sruth/a/b.txt").exists());

    let source_archive =
        Archive::open(source_root.path(), test_config(42100).archive_config()).unwrap();
    let source = SourceNode::new(
        source_archive,
        LOCALHOST,
        test_config(42100),
        vec![tracker_addr],
    )
    .await
    .unwrap();
    tokio::spawn(source.run(cancel.clone()));

    let sink = SinkNode::new(
        sink_archive,
        LOCALHOST,
        test_config(42130),
        vec![tracker_addr],
        Predicate::everything(),
    )
    .await
    .unwrap();
    tokio::spawn(sink.run(cancel.clone()));

    wait_for_file(
        &sink_root.path().join("a/b.txt"),
        &payload,
        Duration::from_secs(30),
    )
    .await;
    assert!(
        !sink_root.path().join(".sruth/a/b.txt").exists(),
        "no lingering hidden copy"
    );

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn version_overwrite_reaches_subscriber() {
    let cancel = CancellationToken::new();
    let (tracker_addr, _tracker) = start_tracker(&cancel).await;

    let source_root = TempDir::new().unwrap();
    let first = patterned(50_000);
    std::fs::write(source_root.path().join("data.bin"), &first).unwrap();

    let source_archive =
        Archive::open(source_root.path(), test_config(42200).archive_config()).unwrap();
    let source = SourceNode::new(
        source_archive,
        LOCALHOST,
        test_config(42200),
        vec![tracker_addr],
    )
    .await
    .unwrap();
    tokio::spawn(source.run(cancel.clone()));

    let sink_root = TempDir::new().unwrap();
    let sink_archive =
        Archive::open(sink_root.path(), test_config(42230).archive_config()).unwrap();
    let sink = SinkNode::new(
        sink_archive,
        LOCALHOST,
        test_config(42230),
        vec![tracker_addr],
        Predicate::everything(),
    )
    .await
    .unwrap();
    tokio::spawn(sink.run(cancel.clone()));

    wait_for_file(
        &sink_root.path().join("data.bin"),
        &first,
        Duration::from_secs(30),
    )
    .await;

    // Overwrite with different content; the millisecond clock has moved on.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second: Vec<u8> = patterned(60_000).into_iter().rev().collect();
    std::fs::write(source_root.path().join("data.bin"), &second).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if std::fs::read(sink_root.path().join("data.bin")).map(|c| c == second).unwrap_or(false) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriber never converged on the overwritten version"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_subscribers_one_source() {
    let cancel = CancellationToken::new();
    let (tracker_addr, _tracker) = start_tracker(&cancel).await;

    let source_root = TempDir::new().unwrap();
    let payload = patterned(300_000);
    std::fs::write(source_root.path().join("shared.bin"), &payload).unwrap();

    let source_archive =
        Archive::open(source_root.path(), test_config(42300).archive_config()).unwrap();
    let source = SourceNode::new(
        source_archive,
        LOCALHOST,
        test_config(42300),
        vec![tracker_addr],
    )
    .await
    .unwrap();
    let source_house = source.clearing_house();
    tokio::spawn(source.run(cancel.clone()));

    let mut sink_roots = Vec::new();
    let mut houses = Vec::new();
    for base in [42330u16, 42360] {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), test_config(base).archive_config()).unwrap();
        let sink = SinkNode::new(
            archive,
            LOCALHOST,
            test_config(base),
            vec![tracker_addr],
            Predicate::everything(),
        )
        .await
        .unwrap();
        houses.push(sink.clearing_house());
        tokio::spawn(sink.run(cancel.clone()));
        sink_roots.push(root);
    }

    for root in &sink_roots {
        wait_for_file(
            &root.path().join("shared.bin"),
            &payload,
            Duration::from_secs(30),
        )
        .await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(source_house.outstanding_count(), 0);
    for house in &houses {
        assert_eq!(house.outstanding_count(), 0);
    }

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ttl_expiry_removes_file_and_empty_directories() {
    let root = TempDir::new().unwrap();
    let archive = Archive::open(
        root.path(),
        ArchiveConfig {
            active_file_cache_size: 8,
            default_ttl_seconds: 3600,
            piece_size: 64,
        },
    )
    .unwrap();

    let info = FileInfo::new(
        FileId::new(
            ArchivePath::new("deep/nested/short.bin").unwrap(),
            ArchiveTime::now(),
        ),
        16,
        64,
        1,
    );
    let piece = Piece::new(info.clone(), 0, Bytes::from(vec![7u8; 16]));
    assert!(archive.put_piece(&piece).unwrap());

    let visible = root.path().join("deep/nested/short.bin");
    assert!(visible.exists());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while visible.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expired file was never deleted"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // Directories that became empty are pruned up to the archive root.
    assert!(!root.path().join("deep").exists());
    assert!(root.path().exists());
}
