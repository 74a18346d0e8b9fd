//! End-to-end scenarios against scripted NNTP servers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    test_config, test_server, wait_for_event, ArticleBehavior, NntpTestServer,
    RecordingPersistence, ServedArticle,
};
use usenet_engine::{
    ArticleStatus, DownloadEngine, Event, FileInfo, NoOpParityHandler, NzbInfo,
};

const DEADLINE: Duration = Duration::from_secs(20);

fn two_part_bundle(name: &str, filename: &str, data_len: usize) -> (NzbInfo, Vec<u8>) {
    let data: Vec<u8> = (0..data_len).map(|i| (i % 251) as u8).collect();
    let mut nzb = NzbInfo::new(name, ""); // empty dest: the engine fills in the configured one
    let mut file = FileInfo::new(
        format!("{filename} (1/2)"),
        filename,
        vec!["alt.binaries.test".to_string()],
    );
    file.add_article(1, format!("{name}-a1@test"), (data_len / 2) as u64);
    file.add_article(2, format!("{name}-a2@test"), (data_len / 2) as u64);
    nzb.add_file(file);
    (nzb, data)
}

/// Happy path, single server: two articles download, the file is joined
/// into `<dest>/<name>/<filename>` and the counters balance.
#[tokio::test]
async fn happy_path_single_server() {
    let server = NntpTestServer::start().await;
    let (nzb, data) = two_part_bundle("happy", "archive.bin", 2048);
    server.add(
        "happy-a1@test",
        ArticleBehavior::Serve(ServedArticle::part("archive.bin", &data, 1, 1, 1024)),
    );
    server.add(
        "happy-a2@test",
        ArticleBehavior::Serve(ServedArticle::part("archive.bin", &data, 2, 1025, 2048)),
    );

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let config = test_config(
        vec![test_server(1, server.port, 0)],
        temp.path(),
        dest.path(),
    );
    let persistence = Arc::new(RecordingPersistence::default());
    let engine = DownloadEngine::with_collaborators(
        config,
        Arc::new(NoOpParityHandler),
        persistence.clone(),
    )
    .await
    .unwrap();
    let mut events = engine.subscribe();
    engine.start();

    let id = engine.add_nzb(nzb).await.unwrap();

    let complete = wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbComplete { id: got, .. } if *got == id)
    })
    .await;
    match complete {
        Event::NzbComplete {
            articles_failed,
            articles_total,
            ..
        } => {
            assert_eq!(articles_failed, 0);
            assert_eq!(articles_total, 2);
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbRemoved { id: got } if *got == id)
    })
    .await;

    let assembled = dest.path().join("happy").join("archive.bin");
    assert_eq!(std::fs::read(&assembled).unwrap(), data);
    assert!(
        !dest.path().join("happy").join("_brokenlog.txt").exists(),
        "a clean download must not write a broken log"
    );

    // counters from the last persisted state of the bundle
    let stats = persistence.last_state_of(id).unwrap();
    assert_eq!(stats.success_size, 2048);
    assert_eq!(stats.failed_size, 0);
    assert_eq!(stats.remaining_size, 0);

    engine.shutdown().await.unwrap();
}

/// Failover to level 1: the primary answers 430 for every article, the
/// backup serves them; both articles finish.
#[tokio::test]
async fn failover_to_level_one() {
    let primary = NntpTestServer::start().await;
    let backup = NntpTestServer::start().await;
    let (nzb, data) = two_part_bundle("failover", "payload.bin", 4096);

    primary.add("failover-a1@test", ArticleBehavior::NotFound);
    primary.add("failover-a2@test", ArticleBehavior::NotFound);
    backup.add(
        "failover-a1@test",
        ArticleBehavior::Serve(ServedArticle::part("payload.bin", &data, 1, 1, 2048)),
    );
    backup.add(
        "failover-a2@test",
        ArticleBehavior::Serve(ServedArticle::part("payload.bin", &data, 2, 2049, 4096)),
    );

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let config = test_config(
        vec![
            test_server(1, primary.port, 0),
            test_server(2, backup.port, 1),
        ],
        temp.path(),
        dest.path(),
    );
    let engine = DownloadEngine::new(config).await.unwrap();
    let mut events = engine.subscribe();
    engine.start();
    let id = engine.add_nzb(nzb).await.unwrap();

    let complete = wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbComplete { id: got, .. } if *got == id)
    })
    .await;
    match complete {
        Event::NzbComplete { articles_failed, .. } => assert_eq!(articles_failed, 0),
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(
        std::fs::read(dest.path().join("failover").join("payload.bin")).unwrap(),
        data
    );
    assert!(
        primary.accepts.load(std::sync::atomic::Ordering::SeqCst) >= 1,
        "the primary must have been tried first"
    );

    engine.shutdown().await.unwrap();
}

/// CRC retry: the first server delivers a corrupted article, which burns
/// it; the second server at the same level delivers a good copy.
#[tokio::test]
async fn crc_error_burns_server_and_retries_on_peer() {
    let bad = NntpTestServer::start().await;
    let good = NntpTestServer::start().await;

    let data: Vec<u8> = (0..1024).map(|i| (i % 17) as u8).collect();
    bad.add(
        "crc-a1@test",
        ArticleBehavior::Serve(ServedArticle::single("blob.bin", &data).with_bad_crc()),
    );
    good.add(
        "crc-a1@test",
        ArticleBehavior::Serve(ServedArticle::single("blob.bin", &data)),
    );

    let mut nzb = NzbInfo::new("crc", "");
    let mut file = FileInfo::new("blob.bin (1/1)", "blob.bin", vec!["alt.test".into()]);
    file.add_article(1, "crc-a1@test", 1024);
    nzb.add_file(file);

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let config = test_config(
        vec![test_server(1, bad.port, 0), test_server(2, good.port, 0)],
        temp.path(),
        dest.path(),
    );
    let engine = DownloadEngine::new(config).await.unwrap();
    let mut events = engine.subscribe();
    engine.start();
    let id = engine.add_nzb(nzb).await.unwrap();

    let complete = wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbComplete { id: got, .. } if *got == id)
    })
    .await;
    match complete {
        Event::NzbComplete { articles_failed, .. } => {
            assert_eq!(articles_failed, 0, "the peer server must have recovered A1");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        std::fs::read(dest.path().join("crc").join("blob.bin")).unwrap(),
        data
    );

    engine.shutdown().await.unwrap();
}

/// Connect errors retry the same server without burning it or consuming
/// retries: even with `retries = 1`, several dropped connections in a row
/// must not fail the article.
#[tokio::test]
async fn connect_error_does_not_burn_the_server() {
    let server = NntpTestServer::start().await;
    let data = b"tiny payload".to_vec();
    server.add(
        "conn-a1@test",
        ArticleBehavior::Serve(ServedArticle::single("tiny.bin", &data)),
    );
    server.drop_next_connects(3);

    let mut nzb = NzbInfo::new("conn", "");
    let mut file = FileInfo::new("tiny.bin (1/1)", "tiny.bin", vec!["alt.test".into()]);
    file.add_article(1, "conn-a1@test", data.len() as u64);
    nzb.add_file(file);

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let mut config = test_config(
        vec![test_server(1, server.port, 0)],
        temp.path(),
        dest.path(),
    );
    config.download.retries = 1;

    let engine = DownloadEngine::new(config).await.unwrap();
    let mut events = engine.subscribe();
    engine.start();
    let id = engine.add_nzb(nzb).await.unwrap();

    let complete = wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbComplete { id: got, .. } if *got == id)
    })
    .await;
    match complete {
        Event::NzbComplete { articles_failed, .. } => {
            assert_eq!(
                articles_failed, 0,
                "connect failures must neither burn the only server nor consume the retry budget"
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(
        server.accepts.load(std::sync::atomic::Ordering::SeqCst) >= 4,
        "three dropped connects plus the successful one"
    );
    assert_eq!(
        std::fs::read(dest.path().join("conn").join("tiny.bin")).unwrap(),
        data
    );

    engine.shutdown().await.unwrap();
}

/// A file whose article is missing on every server at every level
/// completes with `failed_size == size` and still assembles nothing.
#[tokio::test]
async fn all_servers_missing_terminally_fails_the_article() {
    let a = NntpTestServer::start().await;
    let b = NntpTestServer::start().await;
    a.add("gone-a1@test", ArticleBehavior::NotFound);
    b.add("gone-a1@test", ArticleBehavior::NotFound);

    let mut nzb = NzbInfo::new("gone", "");
    let mut file = FileInfo::new("gone.bin (1/1)", "gone.bin", vec!["alt.test".into()]);
    file.add_article(1, "gone-a1@test", 512);
    nzb.add_file(file);

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let config = test_config(
        vec![test_server(1, a.port, 0), test_server(2, b.port, 1)],
        temp.path(),
        dest.path(),
    );
    let persistence = Arc::new(RecordingPersistence::default());
    let engine = DownloadEngine::with_collaborators(
        config,
        Arc::new(NoOpParityHandler),
        persistence.clone(),
    )
    .await
    .unwrap();
    let mut events = engine.subscribe();
    engine.start();
    let id = engine.add_nzb(nzb).await.unwrap();

    let complete = wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbComplete { id: got, .. } if *got == id)
    })
    .await;
    match complete {
        Event::NzbComplete { articles_failed, articles_total, .. } => {
            assert_eq!(articles_failed, 1);
            assert_eq!(articles_total, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let stats = persistence.last_state_of(id).unwrap();
    assert_eq!(stats.failed_size, 512);
    assert_eq!(stats.success_size, 0);

    engine.shutdown().await.unwrap();
}

/// With a zero retry budget, a single generic failure burns the only
/// server and the article terminally fails.
#[tokio::test]
async fn zero_retries_burn_the_server_on_first_failure() {
    let server = NntpTestServer::start().await;
    server.add(
        "burn-a1@test",
        ArticleBehavior::Respond("599 temporarily confused".into()),
    );

    let mut nzb = NzbInfo::new("burn", "");
    let mut file = FileInfo::new("burn.bin (1/1)", "burn.bin", vec!["alt.test".into()]);
    file.add_article(1, "burn-a1@test", 256);
    nzb.add_file(file);

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let mut config = test_config(
        vec![test_server(1, server.port, 0)],
        temp.path(),
        dest.path(),
    );
    config.download.retries = 0;

    let engine = DownloadEngine::new(config).await.unwrap();
    let mut events = engine.subscribe();
    engine.start();
    let id = engine.add_nzb(nzb).await.unwrap();

    let complete = wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbComplete { id: got, .. } if *got == id)
    })
    .await;
    match complete {
        Event::NzbComplete { articles_failed, .. } => {
            assert_eq!(articles_failed, 1, "one failure must exhaust the server");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        server.accepts.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "the burned server must not be contacted again"
    );

    engine.shutdown().await.unwrap();
}

/// A bundle with zero files completes immediately as success.
#[tokio::test]
async fn zero_file_bundle_completes_immediately() {
    let server = NntpTestServer::start().await;
    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let config = test_config(
        vec![test_server(1, server.port, 0)],
        temp.path(),
        dest.path(),
    );
    let engine = DownloadEngine::new(config).await.unwrap();
    let mut events = engine.subscribe();
    engine.start();

    let id = engine.add_nzb(NzbInfo::new("empty", "")).await.unwrap();
    let complete = wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbComplete { id: got, .. } if *got == id)
    })
    .await;
    match complete {
        Event::NzbComplete { articles_failed, articles_total, .. } => {
            assert_eq!(articles_failed, 0);
            assert_eq!(articles_total, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbRemoved { id: got } if *got == id)
    })
    .await;

    engine.shutdown().await.unwrap();
}

/// Direct-write: concurrent parts land at their declared offsets in one
/// pre-allocated file; re-reading yields the original bytes with no join
/// step.
#[tokio::test]
async fn direct_write_assembles_at_offsets() {
    let server = NntpTestServer::start().await;
    let (nzb, data) = two_part_bundle("direct", "sparse.bin", 8192);
    server.add(
        "direct-a1@test",
        ArticleBehavior::Serve(ServedArticle::part("sparse.bin", &data, 1, 1, 4096)),
    );
    server.add(
        "direct-a2@test",
        ArticleBehavior::Serve(ServedArticle::part("sparse.bin", &data, 2, 4097, 8192)),
    );

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let mut config = test_config(
        vec![test_server(1, server.port, 0)],
        temp.path(),
        dest.path(),
    );
    config.download.direct_write = true;

    let engine = DownloadEngine::new(config).await.unwrap();
    let mut events = engine.subscribe();
    engine.start();
    let id = engine.add_nzb(nzb).await.unwrap();

    wait_for_event(&mut events, DEADLINE, |e| {
        matches!(e, Event::NzbRemoved { id: got } if *got == id)
    })
    .await;

    assert_eq!(
        std::fs::read(dest.path().join("direct").join("sparse.bin")).unwrap(),
        data
    );
    assert!(
        !temp.path().join(format!("nzb-{id}")).exists(),
        "the staging directory must be cleaned up after the move"
    );

    engine.shutdown().await.unwrap();
}

/// Cancellation mid-body: the read unblocks promptly, the temp file is
/// removed, the article is re-queued as Undefined and the connection is
/// returned disconnected.
#[tokio::test]
async fn cancellation_mid_body_requeues_the_article() {
    let server = NntpTestServer::start().await;
    let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 201) as u8).collect();
    server.add(
        "stall-a1@test",
        ArticleBehavior::StallMidBody {
            article: ServedArticle::single("stall.bin", &data),
            after_lines: 100,
        },
    );

    let mut nzb = NzbInfo::new("stall", "");
    let mut file = FileInfo::new("stall.bin (1/1)", "stall.bin", vec!["alt.test".into()]);
    file.add_article(1, "stall-a1@test", data.len() as u64);
    nzb.add_file(file);

    let temp = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let config = test_config(
        vec![test_server(1, server.port, 0)],
        temp.path(),
        dest.path(),
    );
    let engine = DownloadEngine::new(config).await.unwrap();
    engine.start();
    let id = engine.add_nzb(nzb).await.unwrap();

    // the worker is now mid-body
    let stall_deadline = std::time::Instant::now() + DEADLINE;
    while !server.stalled.load(std::sync::atomic::Ordering::SeqCst) {
        assert!(
            std::time::Instant::now() < stall_deadline,
            "worker never reached the stall point"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = std::time::Instant::now();
    engine.shutdown().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "shutdown must unblock the stalled read promptly, took {:?}",
        start.elapsed()
    );

    let queue = engine.lock_queue().await;
    let nzb = queue.find_nzb(id).expect("bundle still queued");
    assert_eq!(
        nzb.files[0].articles[0].status,
        ArticleStatus::Undefined,
        "a cancelled article must be re-queued, not counted"
    );
    assert_eq!(nzb.files[0].active_downloads, 0);
    drop(queue);

    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    assert!(
        leftovers.is_empty(),
        "temp files must be cleaned up on cancel: {leftovers:?}"
    );
}
