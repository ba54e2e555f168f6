mod common;

use common::{manager, MockSource};
use download_cache::{CacheError, CacheKey, CacheOrigin, ErrorKind};
use filetime::FileTime;
use std::fs;

const POSTER: &str = "https://media.example.com/posters/42.jpg";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_never_goes_below_zero() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path(), MockSource::open());

    let handle = cache.get(POSTER, None);
    handle.file().await.unwrap();
    assert_eq!(handle.ref_count(), 1);

    assert_eq!(cache.release(&handle), 0);
    assert_eq!(cache.release(&handle), 0);
    assert_eq!(handle.release(), 0);
    assert_eq!(handle.ref_count(), 0);

    handle.add_ref();
    assert_eq!(handle.ref_count(), 1);
    assert!(cache.file_for_key(handle.key()).is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_file_is_adopted_and_touched() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::open();
    let cache = manager(dir.path(), source.clone());

    let path = cache.file_for_key(&CacheKey::explicit("poster-42").unwrap());
    fs::write(&path, b"from an earlier run").unwrap();
    let old = FileTime::from_unix_time(1_000_000, 0);
    filetime::set_file_mtime(&path, old).unwrap();

    let handle = cache.get(POSTER, Some("poster-42"));
    assert_eq!(handle.cached_file(), Some(path.clone()));
    assert_eq!(handle.file().await.unwrap(), path);
    assert_eq!(source.fetches(), 0);

    let mtime = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
    assert!(mtime > old);
    assert_eq!(fs::read(&path).unwrap(), b"from an earlier run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidate_deletes_even_with_references() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::open();
    let cache = manager(dir.path(), source.clone());

    let first = cache.get(POSTER, None);
    let second = cache.get(POSTER, None);
    let path = first.file().await.unwrap();

    cache.invalidate(&first);
    assert!(!path.exists());
    assert!(!cache.contains(POSTER, None));
    assert_eq!(second.file().await.unwrap_err(), CacheError::Invalidated);
    assert_eq!(second.last_error(), Some(CacheError::Invalidated));

    let again = cache.get(POSTER, None);
    assert_eq!(again.file().await.unwrap(), path);
    assert_eq!(source.fetches(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidate_key_without_a_handle() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path(), MockSource::open());

    let handle = cache.get(POSTER, None);
    let path = handle.file().await.unwrap();
    cache.invalidate_key(handle.key());

    assert!(!path.exists());
    assert!(handle.is_invalidated());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_moves_file_into_cache() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::open();
    let cache = manager(&dir.path().join("cache"), source.clone());

    let original = dir.path().join("render.bin");
    fs::write(&original, b"rendered locally").unwrap();

    assert!(cache.peek("render").is_none());
    assert!(cache.put("render", &original, true));
    assert!(!original.exists());

    let handle = cache.peek("render").unwrap();
    assert_eq!(handle.origin(), &CacheOrigin::Adopted);
    assert_eq!(handle.ref_count(), 1);
    let path = handle.file().await.unwrap();
    assert_eq!(fs::read(path).unwrap(), b"rendered locally");
    assert_eq!(source.fetches(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_copy_keeps_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(&dir.path().join("cache"), MockSource::open());

    let original = dir.path().join("thumb.png");
    fs::write(&original, b"png").unwrap();

    assert!(cache.put("thumb", &original, false));
    assert!(original.exists());
    assert!(cache.contains("", Some("thumb")));
    assert!(!cache.put("thumb", &original, true));
    assert!(original.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidated_adopted_entry_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(&dir.path().join("cache"), MockSource::open());

    let original = dir.path().join("notes.txt");
    fs::write(&original, b"notes").unwrap();
    assert!(cache.put("notes", &original, false));

    let handle = cache.peek("notes").unwrap();
    let path = handle.file().await.unwrap();
    fs::remove_file(&path).unwrap();
    cache.invalidate(&handle);

    assert!(cache.peek("notes").is_none());
    assert_eq!(handle.file().await.unwrap_err(), CacheError::Invalidated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn swept_entry_reports_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path(), MockSource::open());

    let handle = cache.get(POSTER, None);
    handle.file().await.unwrap();
    handle.release();

    let report = cache.sweep_with(1, u64::MAX);
    assert_eq!(report.removed, vec![handle.key().clone()]);
    assert_eq!(cache.entry_count(), 0);

    let err = handle.file().await.unwrap_err();
    assert!(matches!(err, CacheError::Evicted(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_all_wipes_entries_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::open();
    let cache = manager(dir.path(), source.clone());

    let a = cache.get("https://media.example.com/a", None);
    let b = cache.get("https://media.example.com/b", None);
    a.file().await.unwrap();
    b.file().await.unwrap();
    assert_eq!(cache.statistics().count, 2);

    cache.clear_all();
    assert_eq!(cache.statistics().count, 0);
    assert_eq!(cache.entry_count(), 0);
    assert!(matches!(a.file().await, Err(CacheError::Evicted(_))));
    assert!(cache.config().staging_dir().is_dir());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peek_does_not_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::open();
    let cache = manager(dir.path(), source.clone());

    assert!(cache.peek("never-requested").is_none());
    assert_eq!(cache.entry_count(), 0);

    let handle = cache.get(POSTER, Some("poster"));
    handle.file().await.unwrap();
    let peeked = cache.peek("poster").unwrap();
    assert_eq!(peeked.ref_count(), 2);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn look_alike_explicit_keys_get_their_own_files() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::open();
    source.set_body("https://media.example.com/one", b"ONE");
    source.set_body("https://media.example.com/two", b"TWO");
    let cache = manager(dir.path(), source.clone());

    let dotted = cache.get("https://media.example.com/one", Some("clip.mp4"));
    let underscored = cache.get("https://media.example.com/two", Some("clip_mp4"));
    assert_ne!(dotted.key(), underscored.key());

    let dotted_path = dotted.file().await.unwrap();
    let underscored_path = underscored.file().await.unwrap();
    assert_ne!(dotted_path, underscored_path);
    assert_eq!(fs::read(&dotted_path).unwrap(), b"ONE");
    assert_eq!(fs::read(&underscored_path).unwrap(), b"TWO");
    assert_eq!(source.fetches(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_entries_are_dropped_once_released() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::open();
    let cache = manager(dir.path(), source.clone());

    let mut released = Vec::new();
    for i in 0..50 {
        let uri = format!("https://media.example.com/broken/{}", i);
        source.fail(&uri);
        let handle = cache.get(&uri, None);
        assert!(handle.file().await.is_err());
        handle.release();
        released.push(handle);
    }

    let held_uri = "https://media.example.com/broken/held";
    source.fail(held_uri);
    let held = cache.get(held_uri, None);
    assert!(held.file().await.is_err());

    let report = cache.sweep_with(1, 1);
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.statistics().count, 0);
    assert!(report.ran);
    assert!(matches!(
        released[0].file().await,
        Err(CacheError::Evicted(_))
    ));

    // The referenced entry survives and can still retry.
    source.heal(held_uri);
    assert!(held.file().await.is_ok());
}
