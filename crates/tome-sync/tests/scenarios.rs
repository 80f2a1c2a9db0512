//! Multi-device scenarios against the in-memory store and library.

use std::sync::Arc;
use std::time::Duration;

use tome_core::{Collection, EntityType, LibraryEntity, MangaDocument, SyncPhase};
use tome_store::{KvStore, MemoryKvStore};
use tome_sync::fixtures::{chapter, manga};
use tome_sync::persist::{LEGACY_QUEUE_KEY, QUEUE_KEY};
use tome_sync::{
    FailureKind, FlushReport, MemoryLibrary, MemoryRemoteStore, StaticAuth, SyncConfig,
    SyncEngine,
};

const USER: &str = "reader-1";

struct Device {
    engine: SyncEngine,
    library: Arc<MemoryLibrary>,
    auth: Arc<StaticAuth>,
}

async fn device(
    name: &str,
    remote: &Arc<MemoryRemoteStore>,
    kv: Arc<MemoryKvStore>,
    library: Arc<MemoryLibrary>,
    signed_in: bool,
) -> Device {
    let mut config = SyncConfig::default();
    config.device.id = name.to_string();

    let auth = Arc::new(if signed_in {
        StaticAuth::signed_in(USER)
    } else {
        StaticAuth::signed_out()
    });

    let engine = SyncEngine::builder(config)
        .with_kv_store(kv)
        .with_local(library.clone())
        .with_change_source(library.clone())
        .with_remote(remote.clone())
        .with_auth(auth.clone())
        .build()
        .await
        .unwrap();

    Device {
        engine,
        library,
        auth,
    }
}

async fn signed_in_device(name: &str, remote: &Arc<MemoryRemoteStore>) -> Device {
    device(
        name,
        remote,
        Arc::new(MemoryKvStore::new()),
        Arc::new(MemoryLibrary::new()),
        true,
    )
    .await
}

/// Lets capture debounce, flush debounce and listeners run.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(10)).await;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test(start_paused = true)]
async fn offline_mark_read_reaches_remote_after_reconnect() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    a.library.seed(LibraryEntity::Manga(manga("m1", 10)));
    a.library.seed(LibraryEntity::Chapter(chapter("c1", "m1", 10)));
    a.engine.upload_local_library().await.unwrap();
    settle().await;

    remote.set_offline(true);
    let mut read = chapter("c1", "m1", 20);
    read.is_read = true;
    read.last_page_read = 18;
    a.library.upsert(LibraryEntity::Chapter(read));

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(a.engine.queue().len().await, 1);
    let doc = remote.document(USER, Collection::Manga, "m1").unwrap();
    assert_eq!(doc["chapters"]["c1"]["is_read"], false);
    assert!(a.engine.state().last_error.is_some());

    remote.set_offline(false);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let doc = remote.document(USER, Collection::Manga, "m1").unwrap();
    assert_eq!(doc["chapters"]["c1"]["is_read"], true);
    assert_eq!(doc["chapters"]["c1"]["last_page_read"], 18);
    assert!(a.engine.queue().is_empty().await);
    assert_eq!(a.engine.state().phase, SyncPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn two_devices_reading_different_chapters_converge() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    let b = signed_in_device("device-b", &remote).await;

    for library in [&a.library, &b.library] {
        library.seed(LibraryEntity::Manga(manga("m1", 10)));
        library.seed(LibraryEntity::Chapter(chapter("c1", "m1", 10)));
        library.seed(LibraryEntity::Chapter(chapter("c2", "m1", 10)));
    }
    a.engine.upload_local_library().await.unwrap();
    settle().await;

    let mut c1 = chapter("c1", "m1", 20);
    c1.is_read = true;
    a.library.upsert(LibraryEntity::Chapter(c1));

    let mut c2 = chapter("c2", "m1", 20);
    c2.last_page_read = 7;
    b.library.upsert(LibraryEntity::Chapter(c2));

    settle().await;

    let doc = remote.document(USER, Collection::Manga, "m1").unwrap();
    assert_eq!(doc["chapters"]["c1"]["is_read"], true);
    assert_eq!(doc["chapters"]["c2"]["last_page_read"], 7);

    // Each device sees the other's progress and keeps its own.
    for library in [&a.library, &b.library] {
        assert!(library.chapter("c1").unwrap().is_read);
        assert_eq!(library.chapter("c2").unwrap().last_page_read, 7);
    }
    assert!(a.engine.queue().is_empty().await);
    assert!(b.engine.queue().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn two_devices_reading_the_same_chapter_keep_the_furthest_progress() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    let b = signed_in_device("device-b", &remote).await;

    for library in [&a.library, &b.library] {
        library.seed(LibraryEntity::Manga(manga("m1", 10)));
        library.seed(LibraryEntity::Chapter(chapter("c1", "m1", 10)));
    }
    a.engine.upload_local_library().await.unwrap();
    settle().await;

    // Edited on both devices before either hears of the other.
    let mut further = chapter("c1", "m1", 20);
    further.last_page_read = 15;
    a.library.upsert(LibraryEntity::Chapter(further));

    let mut finished = chapter("c1", "m1", 30);
    finished.is_read = true;
    finished.last_page_read = 3;
    b.library.upsert(LibraryEntity::Chapter(finished));

    settle().await;

    let doc = remote.document(USER, Collection::Manga, "m1").unwrap();
    assert_eq!(doc["chapters"]["c1"]["is_read"], true);
    assert_eq!(doc["chapters"]["c1"]["last_page_read"], 15);
    assert_eq!(doc["chapters"]["c1"]["modified"], 30);

    for library in [&a.library, &b.library] {
        let c1 = library.chapter("c1").unwrap();
        assert!(c1.is_read);
        assert_eq!(c1.last_page_read, 15);
    }
}

#[tokio::test(start_paused = true)]
async fn own_writes_do_not_echo_back() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    settle().await;

    let mut edited = manga("m1", 50);
    edited.title = "Renamed".into();
    a.library.upsert(LibraryEntity::Manga(edited));
    settle().await;

    let commits = remote.commit_count();
    assert_eq!(commits, 1);
    assert!(a.engine.queue().is_empty().await);

    // Nothing ping-pongs between the listener and the capture.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(remote.commit_count(), commits);
    assert_eq!(a.library.manga("m1").unwrap().title, "Renamed");
}

#[tokio::test(start_paused = true)]
async fn same_stamp_from_another_device_is_not_an_echo() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    settle().await;

    let stamp = now_ms();
    let echo = a.engine.orchestrator().echo();
    for id in ["ours", "theirs"] {
        echo.record(Collection::Manga.document_path(USER, id), stamp);
    }

    for (id, writer) in [("ours", "device-a"), ("theirs", "device-b")] {
        let mut doc = serde_json::to_value(MangaDocument::from_local(&manga(id, 5), &[])).unwrap();
        doc["updated_at"] = stamp.into();
        doc["updated_by"] = writer.into();
        remote.put_document(USER, Collection::Manga, id, doc);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(a.library.manga("ours").is_none());
    assert!(a.library.manga("theirs").is_some());
}

#[tokio::test(start_paused = true)]
async fn changes_missed_while_disconnected_are_caught_up() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    settle().await;
    assert!(a.engine.is_listening().await);

    remote.disconnect_listeners();
    let mut doc = MangaDocument::from_local(&manga("m2", 5), &[chapter("c9", "m2", 5)]);
    doc.updated_at = now_ms();
    remote.put_document(USER, Collection::Manga, "m2", serde_json::to_value(&doc).unwrap());
    assert!(a.library.manga("m2").is_none());

    tokio::time::sleep(Duration::from_secs(70)).await;

    assert!(a.library.manga("m2").is_some());
    assert!(a.library.chapter("c9").is_some());
    // Merged state is not captured back
    assert!(a.engine.queue().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn remote_soft_delete_drops_queued_edit() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    a.library.seed(LibraryEntity::Manga(manga("m1", 10)));
    settle().await;

    a.engine.pause();
    let mut edited = manga("m1", 20);
    edited.favorite = false;
    a.library.upsert(LibraryEntity::Manga(edited));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(a.engine.queue().len().await, 1);

    let mut deleted = MangaDocument::from_local(&manga("m1", 30), &[]);
    deleted.deleted = true;
    deleted.updated_at = now_ms();
    remote.put_document(USER, Collection::Manga, "m1", serde_json::to_value(&deleted).unwrap());
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(a.library.manga("m1").unwrap().deleted);
    assert!(a.engine.queue().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn revoked_credential_suspends_until_sign_in() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    settle().await;

    remote.fail_next(1, FailureKind::Unauthenticated);
    a.library.upsert(LibraryEntity::Manga(manga("m1", 10)));
    settle().await;

    let state = a.engine.state();
    assert!(state.needs_reauth);
    assert_eq!(a.engine.queue().len().await, 1);
    assert!(matches!(a.engine.flush().await, FlushReport::Skipped(_)));

    a.auth.sign_in(USER);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!a.engine.state().needs_reauth);

    assert_eq!(a.engine.flush().await.written(), 1);
    assert!(remote.document(USER, Collection::Manga, "m1").is_some());
}

#[tokio::test(start_paused = true)]
async fn queued_edits_survive_restart() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let kv = Arc::new(MemoryKvStore::new());
    let library = Arc::new(MemoryLibrary::new());

    let offline = device("device-a", &remote, kv.clone(), library.clone(), false).await;
    offline.library.upsert(LibraryEntity::Manga(manga("m1", 10)));
    settle().await;
    assert_eq!(offline.engine.queue().len().await, 1);
    offline.engine.shutdown().await;

    let online = device("device-a", &remote, kv, library, true).await;
    settle().await;

    assert!(online.engine.queue().is_empty().await);
    let doc = remote.decoded(USER, Collection::Manga, "m1").unwrap();
    assert_eq!(doc.id(), "m1");
}

#[tokio::test(start_paused = true)]
async fn legacy_queue_is_migrated_and_flushed() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let kv = Arc::new(MemoryKvStore::new());
    let payload = serde_json::to_string(&LibraryEntity::Manga(manga("m7", 3)).to_payload().unwrap())
        .unwrap();
    kv.put(
        LEGACY_QUEUE_KEY,
        &format!(r#"[{{"type":"manga","entityId":"m7","data":{}}}]"#, payload),
    )
    .await
    .unwrap();

    let a = device("device-a", &remote, kv.clone(), Arc::new(MemoryLibrary::new()), true).await;
    settle().await;

    assert!(kv.get(LEGACY_QUEUE_KEY).await.unwrap().is_none());
    assert!(kv.get(QUEUE_KEY).await.unwrap().is_some());
    assert!(a.engine.queue().is_empty().await);
    assert!(remote.document(USER, Collection::Manga, "m7").is_some());
}

#[tokio::test(start_paused = true)]
async fn large_upload_respects_batch_ceiling() {
    let remote = Arc::new(MemoryRemoteStore::with_max_batch(10));
    let a = signed_in_device("device-a", &remote).await;
    settle().await;

    for i in 0..25 {
        a.library.seed(LibraryEntity::Manga(manga(&format!("m{}", i), 1)));
    }
    assert_eq!(a.engine.upload_local_library().await.unwrap(), 25);
    assert_eq!(remote.commit_sizes(), vec![10, 10, 5]);
    assert!(a.engine.state().last_full_sync > 0);
}

#[tokio::test(start_paused = true)]
async fn sign_out_clears_user_state() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    settle().await;

    a.engine.pause();
    a.library.upsert(LibraryEntity::Manga(manga("m1", 10)));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(a.engine.queue().len().await, 1);

    a.auth.sign_out();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(a.engine.queue().is_empty().await);
    assert!(!a.engine.is_listening().await);
    assert_eq!(a.engine.state().last_sync_timestamp, 0);
    assert!(a.library.entity(EntityType::Manga, "m1").is_some());
}

#[tokio::test(start_paused = true)]
async fn edit_pending_at_sign_out_never_reaches_the_next_account() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = signed_in_device("device-a", &remote).await;
    settle().await;

    // Still inside the capture debounce window.
    a.library.upsert(LibraryEntity::Manga(manga("m1", 10)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.auth.sign_out();
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.auth.sign_in("reader-2");
    settle().await;

    assert!(a.engine.queue().is_empty().await);
    assert!(remote.document("reader-2", Collection::Manga, "m1").is_none());
    assert!(remote.document(USER, Collection::Manga, "m1").is_none());
    assert!(a.library.entity(EntityType::Manga, "m1").is_some());
}
