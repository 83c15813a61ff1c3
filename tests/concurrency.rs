// Concurrency tests: several connections racing over one on-disk database

use card_dispenser::{
    admin, allocate_committed, open_database, AllocationError, ClaimOutcome, ClaimService,
    Combination, Denominations, NewRecipient, PlainText, RetryPolicy,
};
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{mpsc, Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn connect(path: &Path) -> Connection {
    open_database(path, Duration::from_secs(10)).unwrap()
}

fn service() -> Arc<ClaimService> {
    Arc::new(ClaimService::new(
        Denominations::default(),
        Arc::new(PlainText),
        RetryPolicy::default(),
    ))
}

fn seed(path: &Path, recipients: &[(&str, i64)], cards: &[(&str, u32)]) {
    let mut conn = connect(path);
    let batch: Vec<NewRecipient> = recipients
        .iter()
        .map(|(identity, target)| NewRecipient {
            identity: identity.to_string(),
            nickname: identity.to_string(),
            secret: "pw".to_string(),
            target: *target,
        })
        .collect();
    admin::import_recipients(&mut conn, &PlainText, &batch).unwrap();

    let denominations = Denominations::default();
    for (code, denomination) in cards {
        admin::add_cards(&mut conn, &denominations, code, *denomination).unwrap();
    }
}

fn used_cards(conn: &Connection) -> Vec<(String, String)> {
    let mut stmt = conn
        .prepare("SELECT code, used_by FROM cards WHERE is_used = 1 ORDER BY code")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

/// Take the write lock on another connection and keep it for `hold`.
/// Returns once the lock is held.
fn hold_write_lock(path: &Path, hold: Duration) -> JoinHandle<()> {
    let path = path.to_path_buf();
    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = thread::spawn(move || {
        let mut conn = connect(&path);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();
        locked_tx.send(()).unwrap();
        thread::sleep(hold);
        drop(tx);
    });
    locked_rx.recv().unwrap();
    holder
}

#[test]
fn test_last_card_goes_to_exactly_one_claimant() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    seed(&path, &[], &[("LAST-TEN", 10)]);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["u1", "u2"]
        .into_iter()
        .map(|claimant| {
            let mut conn = connect(&path);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let combination = Combination::from_counts([(10, 1)]);
                barrier.wait();
                allocate_committed(&mut conn, &combination, claimant, RetryPolicy::default())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one allocation must succeed");
    assert!(results.iter().any(|r| matches!(
        r,
        Err(AllocationError::InsufficientStock { denomination: 10, .. })
    )));

    let used = used_cards(&connect(&path));
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].1, winners[0].claimant);
}

#[test]
fn test_competing_recipients_never_share_cards() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crowd.db");

    let identities: Vec<String> = (0..8).map(|i| format!("u{}", i)).collect();
    let recipients: Vec<(&str, i64)> = identities.iter().map(|id| (id.as_str(), 18)).collect();
    let cards: Vec<(String, u32)> = (0..5)
        .flat_map(|i| [(format!("T{}", i), 10), (format!("F{}", i), 5), (format!("R{}", i), 3)])
        .collect();
    let card_refs: Vec<(&str, u32)> = cards.iter().map(|(c, d)| (c.as_str(), *d)).collect();
    seed(&path, &recipients, &card_refs);

    let svc = service();
    let barrier = Arc::new(Barrier::new(identities.len()));
    let handles: Vec<_> = identities
        .iter()
        .cloned()
        .map(|identity| {
            let mut conn = connect(&path);
            let svc = Arc::clone(&svc);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                svc.claim(&mut conn, &identity, "pw")
            })
        })
        .collect();

    let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let successes = outcomes.iter().filter(|o| o.is_success()).count();
    let short = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::InsufficientStock { .. }))
        .count();
    assert_eq!(successes, 5);
    assert_eq!(short, 3);

    let conn = connect(&path);
    let used = used_cards(&conn);
    assert_eq!(used.len(), 15, "three cards per successful claim");

    let mut handed_out: Vec<&String> = outcomes.iter().flat_map(|o| o.codes()).collect();
    handed_out.sort();
    handed_out.dedup();
    assert_eq!(handed_out.len(), 15, "no code may be handed out twice");

    // Every owner claimed exactly one 10, one 5 and one 3
    for owner in used.iter().map(|(_, owner)| owner) {
        let count = used.iter().filter(|(_, o)| o == owner).count();
        assert_eq!(count, 3);
    }

    let claimed: i64 = conn
        .query_row("SELECT COUNT(*) FROM recipients WHERE has_claimed = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(claimed, 5);
}

#[test]
fn test_parallel_claims_by_one_recipient_allocate_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("duplicate.db");
    seed(
        &path,
        &[("u1", 13)],
        &[("T1", 10), ("T2", 10), ("R1", 3), ("R2", 3), ("R3", 3)],
    );

    let svc = service();
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mut conn = connect(&path);
            let svc = Arc::clone(&svc);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                svc.claim(&mut conn, "u1", "pw")
            })
        })
        .collect();

    let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::AlreadyClaimed { .. }))
            .count(),
        3
    );
    assert_eq!(used_cards(&connect(&path)).len(), 2);
}

#[test]
fn test_lock_timeout_surfaces_as_internal_error_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");
    seed(&path, &[("u1", 10)], &[("TEN", 10)]);

    let mut holder = connect(&path);
    let mut impatient = open_database(&path, Duration::from_millis(50)).unwrap();
    let svc = ClaimService::new(
        Denominations::default(),
        Arc::new(PlainText),
        RetryPolicy { max_attempts: 2 },
    );

    {
        let _lock = holder
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();

        let outcome = svc.claim(&mut impatient, "u1", "pw");
        assert_eq!(outcome, ClaimOutcome::InternalError);
    }

    assert!(used_cards(&connect(&path)).is_empty());

    // Retrying once the lock is gone succeeds
    let outcome = svc.claim(&mut impatient, "u1", "pw");
    assert!(outcome.is_success());
    assert_eq!(outcome.codes(), ["TEN".to_string()]);
}

#[test]
fn test_claim_retries_until_lock_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("retry-claim.db");
    seed(&path, &[("u1", 13)], &[("TEN", 10), ("THREE", 3)]);

    // Each attempt gives up after 100ms; the lock is held for longer than that
    let mut patient = open_database(&path, Duration::from_millis(100)).unwrap();
    let svc = ClaimService::new(
        Denominations::default(),
        Arc::new(PlainText),
        RetryPolicy { max_attempts: 20 },
    );

    let holder = hold_write_lock(&path, Duration::from_millis(350));
    let started = Instant::now();
    let outcome = svc.claim(&mut patient, "u1", "pw");
    let waited = started.elapsed();
    holder.join().unwrap();

    assert!(outcome.is_success(), "got {:?}", outcome);
    assert!(waited >= Duration::from_millis(250), "claim must have outlived one lock wait");

    let used = used_cards(&connect(&path));
    assert_eq!(
        used,
        vec![
            ("TEN".to_string(), "u1".to_string()),
            ("THREE".to_string(), "u1".to_string())
        ]
    );
}

#[test]
fn test_allocation_retries_until_lock_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("retry-allocate.db");
    seed(&path, &[], &[("F1", 5), ("F2", 5)]);

    let mut patient = open_database(&path, Duration::from_millis(100)).unwrap();
    let combination = Combination::from_counts([(5, 2)]);

    let holder = hold_write_lock(&path, Duration::from_millis(350));
    let allocation = allocate_committed(
        &mut patient,
        &combination,
        "u1",
        RetryPolicy { max_attempts: 20 },
    )
    .unwrap();
    holder.join().unwrap();

    let mut codes = allocation.codes();
    codes.sort();
    assert_eq!(codes, vec!["F1", "F2"]);
    assert!(used_cards(&connect(&path))
        .iter()
        .all(|(_, owner)| owner == "u1"));
}

#[test]
fn test_admin_overrides_wait_for_a_concurrent_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("override.db");
    seed(&path, &[("u1", 10)], &[("TEN", 10)]);
    let mut admin_conn = connect(&path);
    assert!(service().claim(&mut admin_conn, "u1", "pw").is_success());

    // The other writer commits while the overrides are waiting for the lock
    let (locked_tx, locked_rx) = mpsc::channel();
    let writer_path = path.clone();
    let writer = thread::spawn(move || {
        let mut conn = connect(&writer_path);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();
        tx.execute("INSERT INTO cards (code, denomination) VALUES ('LATE', 5)", [])
            .unwrap();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(200));
        tx.commit().unwrap();
    });
    locked_rx.recv().unwrap();

    assert!(admin::release_card(&mut admin_conn, "TEN").unwrap());
    assert!(admin::reset_claim(&mut admin_conn, "u1").unwrap());
    writer.join().unwrap();

    assert!(used_cards(&admin_conn).is_empty());
    let late: i64 = admin_conn
        .query_row("SELECT COUNT(*) FROM cards WHERE code = 'LATE'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(late, 1);
}
