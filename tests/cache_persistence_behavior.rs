//! Behavior-driven tests for the persistent cache.
//!
//! These tests verify that cached responses survive a process restart,
//! that overwrites are atomic per key, that a second process can read while
//! the writer is open, and that maintenance only removes what it should.

mod support;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use feedvault_core::{
    CacheEntry, CacheStore, Clock, FetchOptions, FetchOutcome, HttpResponse, SourceId,
    SourcePolicies, StoreConfig, StoreError,
};
use support::{
    child_role, client_with, fred_series, manual_clock, observations, spawn_child,
    unspaced_policy, ScriptedHttp,
};
use tempfile::TempDir;
use time::OffsetDateTime;

fn fred_only() -> SourcePolicies {
    SourcePolicies::empty().with_policy(unspaced_policy(SourceId::Fred, 60))
}

fn entry(key: &str, payload: &str, fetched_at: OffsetDateTime, ttl_seconds: u64) -> CacheEntry {
    CacheEntry {
        key: key.to_owned(),
        payload: payload.to_owned(),
        fetched_at,
        ttl_seconds,
        source: String::from("fred"),
        endpoint: String::from("series/observations"),
    }
}

#[tokio::test]
async fn when_process_restarts_within_ttl_cached_response_is_served_without_network() {
    // Given: A response fetched and persisted by a first "process"
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("cache.duckdb");
    let clock = manual_clock();
    {
        let store = Arc::new(CacheStore::open(StoreConfig::at(&path)).expect("open store"));
        let http = Arc::new(ScriptedHttp::new(clock.clone()).then(Ok(HttpResponse::ok(observations("3.7")))));
        let client = client_with(store, http.clone(), clock.clone(), fred_only());
        client
            .fetch(&fred_series("UNRATE"), &FetchOptions::default())
            .await
            .expect("first run");
        assert_eq!(http.call_count(), 1);
    }

    // When: A second "process" opens the same file and repeats the request
    clock.advance(Duration::from_secs(600));
    let store = Arc::new(CacheStore::open(StoreConfig::at(&path)).expect("reopen store"));
    let http = Arc::new(ScriptedHttp::new(clock.clone()));
    let client = client_with(store, http.clone(), clock, fred_only());
    let outcome = client
        .fetch(&fred_series("UNRATE"), &FetchOptions::default())
        .await
        .expect("second run");

    // Then: The persisted body is returned and no network call is made
    let FetchOutcome::CacheHit(payload) = outcome else {
        panic!("expected CacheHit, got {outcome:?}");
    };
    assert_eq!(payload.body, observations("3.7"));
    assert_eq!(http.call_count(), 0);
}

#[test]
fn when_entry_is_overwritten_reopened_store_holds_only_the_new_value() {
    // Given: A key written twice
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("cache.duckdb");
    let now = OffsetDateTime::now_utc();
    {
        let store = CacheStore::open(StoreConfig::at(&path)).expect("open store");
        store
            .put(&entry("fred|series/observations|series_id=GDP", "old", now, 60))
            .expect("first write");
        store
            .put(&entry("fred|series/observations|series_id=GDP", "new", now, 120))
            .expect("overwrite");
    }

    // When: The store is reopened
    let store = CacheStore::open(StoreConfig::at(&path)).expect("reopen store");

    // Then: Exactly one entry exists with the replacement value
    let stored = store
        .get("fred|series/observations|series_id=GDP")
        .expect("read")
        .expect("entry present");
    assert_eq!(stored.payload, "new");
    assert_eq!(stored.ttl_seconds, 120);
    assert_eq!(store.stats().expect("stats").entries, 1);
}

#[test]
fn when_cache_is_pruned_only_old_or_expired_entries_are_removed() {
    // Given: One ancient entry, one expired entry, and one fresh entry
    let dir = TempDir::new().expect("temp dir");
    let store = CacheStore::open(StoreConfig::at(dir.path().join("cache.duckdb"))).expect("open");
    let clock = manual_clock();
    let now = clock.now();
    store
        .put(&entry("fred|a|", "{}", now - time::Duration::days(40), 86_400 * 365))
        .expect("ancient");
    store
        .put(&entry("fred|b|", "{}", now - time::Duration::hours(2), 3_600))
        .expect("expired");
    store
        .put(&entry("fred|c|", "{}", now - time::Duration::minutes(5), 3_600))
        .expect("fresh");

    // When: Entries older than 30 days are pruned, then expired ones
    let by_age = store.prune(now - time::Duration::days(30)).expect("prune by age");
    let by_ttl = store.prune_expired(now).expect("prune expired");

    // Then: Each pass removes one entry and the fresh one remains
    assert_eq!(by_age, 1);
    assert_eq!(by_ttl, 1);
    assert_eq!(store.list_keys("fred|", 10).expect("keys"), vec!["fred|c|"]);
}

#[test]
fn when_writer_has_closed_read_only_reader_sees_complete_entries() {
    // Given: A writer that stored an entry and closed
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("cache.duckdb");
    let now = OffsetDateTime::now_utc();
    let written = entry("fred|series/observations|series_id=CPIAUCSL", &observations("310.3"), now, 3_600);
    {
        let writer = CacheStore::open(StoreConfig::at(&path)).expect("open writer");
        writer.put(&written).expect("write");
    }

    // When: A read-only reader opens the same file
    let reader = CacheStore::open_read_only(&path).expect("open reader");

    // Then: The entry reads back whole and writes are refused
    let read = reader
        .get(&written.key)
        .expect("read")
        .expect("entry present");
    assert_eq!(read.payload, written.payload);
    assert_eq!(read.ttl_seconds, written.ttl_seconds);
    assert!(read.is_fresh(now));
    assert!(matches!(
        reader.invalidate(&written.key),
        Err(StoreError::ReadOnly { .. })
    ));
}

const SHARED_KEY: &str = "fred|series/observations|series_id=CPIAUCSL";
const CHILD_READS: usize = 40;

/// Child side: open read-only beside the writer and read the shared key
/// repeatedly, requiring a whole, checksum-valid payload every time.
fn read_repeatedly(path: &Path) {
    let config = StoreConfig::at(path).with_lock_timeout(Duration::from_secs(20));
    let reader = CacheStore::open_read_only_with(config).expect("open reader beside writer");

    let mut complete = 0;
    for _ in 0..CHILD_READS {
        let stored = reader
            .get(SHARED_KEY)
            .expect("read verifies checksum")
            .expect("entry present");
        let body: serde_json::Value =
            serde_json::from_str(&stored.payload).expect("payload is whole json");
        assert!(body["observations"][0]["value"].is_string());
        complete += 1;
        thread::sleep(Duration::from_millis(10));
    }
    println!("complete_reads={complete}");
}

#[test]
fn when_writer_is_still_open_another_process_reads_complete_entries() {
    if let Some((role, path)) = child_role() {
        assert_eq!(role, "reader");
        read_repeatedly(&path);
        std::process::exit(0);
    }

    // Given: A writer that stays open for the whole test
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("cache.duckdb");
    let now = OffsetDateTime::now_utc();
    let writer = CacheStore::open(StoreConfig::at(&path)).expect("open writer");
    writer
        .put(&entry(SHARED_KEY, &observations("0"), now, 3_600))
        .expect("seed");

    // When: Another process reads while the writer keeps overwriting the key
    let mut reader = spawn_child(
        "when_writer_is_still_open_another_process_reads_complete_entries",
        "reader",
        &path,
    );
    let deadline = Instant::now() + Duration::from_secs(60);
    let mut revisions = 0_u32;
    while reader.try_wait().expect("poll reader").is_none() {
        if Instant::now() > deadline {
            let _ = reader.kill();
            panic!("reader process did not finish within a minute");
        }
        revisions += 1;
        writer
            .put(&entry(SHARED_KEY, &observations(&revisions.to_string()), now, 3_600))
            .expect("overwrite while reader runs");
        thread::sleep(Duration::from_millis(5));
    }
    let output = reader.wait_with_output().expect("reader output");

    // Then: Every read in the other process was complete and the writer still works
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "reader failed: {}{}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains(&format!("complete_reads={CHILD_READS}")), "{stdout}");
    assert!(revisions > 0);
    let last = writer.get(SHARED_KEY).expect("writer read").expect("entry present");
    assert_eq!(last.payload, observations(&revisions.to_string()));
}

/// Child side: start replacing the shared entry and die before committing.
fn write_then_abort(path: &Path) -> ! {
    let connection = duckdb::Connection::open(path).expect("open raw connection");
    connection.execute_batch("BEGIN TRANSACTION;").expect("begin");
    connection
        .execute(
            "UPDATE cache_entries SET value = ?, checksum = ? WHERE key = ?",
            duckdb::params![r#"{"observations":[{"da"#, "partial", SHARED_KEY],
        )
        .expect("partial update");
    connection
        .execute(
            "INSERT INTO cache_entries \
             (key, value, updated_at, ttl_seconds, source, endpoint, checksum) \
             VALUES ('fred|orphan', '{}', 0, 60, 'fred', 'series', 'none')",
            duckdb::params![],
        )
        .expect("partial insert");
    println!("update_applied");
    let _ = std::io::stdout().flush();
    std::process::abort();
}

#[test]
fn when_a_write_is_interrupted_partway_the_previous_entry_stays_readable() {
    if let Some((role, path)) = child_role() {
        assert_eq!(role, "interrupted-writer");
        write_then_abort(&path);
    }

    // Given: A stored entry and a store that stays open
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("cache.duckdb");
    let now = OffsetDateTime::now_utc();
    let store = CacheStore::open(StoreConfig::at(&path)).expect("open store");
    let original = entry(SHARED_KEY, &observations("310.3"), now, 3_600);
    store.put(&original).expect("write original");

    // When: Another process begins replacing it and dies mid-transaction
    let output = spawn_child(
        "when_a_write_is_interrupted_partway_the_previous_entry_stays_readable",
        "interrupted-writer",
        &path,
    )
    .wait_with_output()
    .expect("writer output");

    // Then: The original entry reads back whole and nothing partial remains
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success(), "writer should have aborted: {stdout}");
    assert!(stdout.contains("update_applied"), "{stdout}");
    let stored = store
        .get(SHARED_KEY)
        .expect("read verifies checksum")
        .expect("entry present");
    assert_eq!(stored.payload, original.payload);
    assert_eq!(stored.ttl_seconds, original.ttl_seconds);
    assert_eq!(store.stats().expect("stats").entries, 1);
    store
        .put(&entry(SHARED_KEY, &observations("311.0"), now, 3_600))
        .expect("store still writable");
}
