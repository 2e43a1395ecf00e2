mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use maplit::btreeset;
use memstate::MemChange;
use memstate::MemState;
use raft_member::log::Entry;
use raft_member::log::EntryPayload;
use raft_member::log::Log;
use raft_member::message::AppendEntriesRequest;

fn entries(prev_index: u64, prev_term: u64, payload: &[(u64, i64)]) -> Log<MemState> {
    let mut log = Log::new(prev_index, prev_term);
    for (term, amount) in payload {
        log.append(Entry {
            term: *term,
            payload: EntryPayload::Normal(MemChange::Add(*amount)),
        });
    }
    log
}

fn request(term: u64, entries: Log<MemState>, leader_commit: u64) -> AppendEntriesRequest<MemState> {
    AppendEntriesRequest {
        term,
        leader_id: 99,
        entries,
        leader_commit,
    }
}

/// AppendEntries receiver semantics, driven with crafted payloads against
/// a member whose own election timeout never fires.
///
/// What does this test do?
///
/// - seeds a follower's log from a pretend leader and verifies the
///   happy-path accept, commit and apply flow.
/// - verifies the stale-term rejection and that it neither mutates the log
///   nor touches storage.
/// - verifies the consistency-check rejection for an unknown
///   (prev_index, prev_term).
/// - verifies that a conflicting suffix is truncated and replaced.
/// - verifies that every successful acknowledgment is preceded by a
///   completed storage write.
///
/// RUST_LOG=raft_member,append_conflicts=trace cargo test -p raft-member --test append_conflicts
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_conflicts() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::quiescent_config()));
    router.new_lone_founder(0, btreeset![0, 1, 99]).await;
    let member = router.get_member(0).await;
    let storage = router.get_storage(0).await;

    // Happy path: two entries starting at the log base, nothing committed
    // yet.
    let writes_before = storage.write_count();
    let res = member.append_entries(request(2, entries(0, 0, &[(2, 1), (2, 2)]), 0)).await?;
    assert!(res.success);
    assert_eq!(res.term, 2);
    assert!(
        storage.write_count() > writes_before,
        "a successful acknowledgment requires a completed storage write"
    );
    let metrics = member.metrics().borrow().clone();
    assert_eq!(metrics.last_log_index, 2);
    assert_eq!(metrics.last_applied, 0, "uncommitted entries must not be applied");

    // A heartbeat carrying the leader's commit index applies the entries
    // in order.
    let res = member.append_entries(request(2, entries(2, 2, &[]), 2)).await?;
    assert!(res.success);
    member.wait(Some(Duration::from_secs(1))).applied(2, "heartbeat commit").await?;
    assert_eq!(member.current_state().borrow().clone().unwrap().value, 3);

    // Stale term: refused, and nothing is written or changed.
    let writes_before = storage.write_count();
    let res = member.append_entries(request(1, entries(2, 2, &[(1, 50)]), 2)).await?;
    assert!(!res.success);
    assert_eq!(res.term, 2, "the reply must carry the receiver's newer term");
    assert_eq!(storage.write_count(), writes_before, "a stale-term refusal must not write");
    assert_eq!(member.metrics().borrow().last_log_index, 2);

    // Unknown (prev_index, prev_term): the consistency check refuses.
    let res = member.append_entries(request(2, entries(7, 2, &[(2, 60)]), 2)).await?;
    assert!(!res.success, "a gap past the local log must be refused");
    let res = member.append_entries(request(2, entries(2, 1, &[(2, 60)]), 2)).await?;
    assert!(!res.success, "a mismatched prev_term must be refused");

    // Append one uncommitted entry at index 3, then have a newer-term
    // leader overwrite it: the conflicting suffix is truncated.
    let res = member.append_entries(request(2, entries(2, 2, &[(2, 70)]), 2)).await?;
    assert!(res.success);
    assert_eq!(member.metrics().borrow().last_log_index, 3);

    let res = member.append_entries(request(3, entries(2, 2, &[(3, 80)]), 2)).await?;
    assert!(res.success);
    assert_eq!(res.term, 3);
    let metrics = member.metrics().borrow().clone();
    assert_eq!(metrics.last_log_index, 3);
    assert_eq!(metrics.current_term, 3);

    // Committing through the replacement applies the replacement, not the
    // truncated orphan.
    let res = member.append_entries(request(3, entries(3, 3, &[]), 3)).await?;
    assert!(res.success);
    member.wait(Some(Duration::from_secs(1))).applied(3, "commit replacement").await?;
    assert_eq!(member.current_state().borrow().clone().unwrap().value, 83);

    // The persisted log agrees with the member's view of it.
    let persisted = storage.persisted().await.expect("nothing persisted");
    assert_eq!(persisted.log.latest_index(), 3);
    assert_eq!(persisted.log.term_at(3), 3);
    assert_eq!(persisted.current_term, 3);

    router.check_invariants().await;
    Ok(())
}

/// An idempotent re-send of entries the member already holds must succeed
/// without truncating anything.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_duplicate_entries_is_idempotent() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::quiescent_config()));
    router.new_lone_founder(0, btreeset![0, 1, 99]).await;
    let member = router.get_member(0).await;

    let res = member.append_entries(request(1, entries(0, 0, &[(1, 1), (1, 2)]), 2)).await?;
    assert!(res.success);
    member.wait(Some(Duration::from_secs(1))).applied(2, "initial commit").await?;

    // The same payload again: accepted, nothing re-applied.
    let res = member.append_entries(request(1, entries(0, 0, &[(1, 1), (1, 2)]), 2)).await?;
    assert!(res.success);
    member.wait(Some(Duration::from_secs(1))).applied(2, "still applied").await?;
    assert_eq!(
        member.current_state().borrow().clone().unwrap().value,
        3,
        "replayed entries must not be applied twice"
    );

    Ok(())
}

/// An uninitialized joiner refuses entries outright; it has no base state
/// to extend until a snapshot arrives.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_to_uninitialized_joiner_is_refused() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::quiescent_config()));
    router.new_joining_node(5).await;
    let member = router.get_member(5).await;

    let res = member.append_entries(request(1, entries(0, 0, &[(1, 1)]), 1)).await?;
    assert!(!res.success, "a joiner without a snapshot must refuse entries");
    assert_eq!(res.term, 1, "the joiner still adopts the leader's term");
    assert_eq!(member.metrics().borrow().last_log_index, 0);

    Ok(())
}
