use lockq::engine::{LockError, LockUniverse, Namespace, Notice};
use std::time::Duration;
use tokio::time::Instant;

const IDLE: Duration = Duration::from_secs(10);

fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|key| key.to_string()).collect()
}

fn ns(name: &str) -> Namespace {
    Some(name.to_string())
}

fn results(notices: Vec<Notice<u32>>) -> Vec<(u32, Result<(), LockError>)> {
    notices.into_iter().map(|notice| (notice.notify, notice.result)).collect()
}

#[test]
fn release_is_scoped_to_owner() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", None, keys(&["x"])));
    assert!(!universe.try_lock("bob", None, keys(&["x"])));

    println!("Bob releases alice's resource");
    assert!(!universe.release("bob", None, keys(&["x"])));
    assert!(universe.is_locked(&None, "x"));
    assert_eq!(universe.owned("alice", &None), keys(&["x"]));

    println!("Alice releases her resource together with one she does not own");
    assert!(!universe.release("alice", None, keys(&["x", "y"])));
    assert!(!universe.is_locked(&None, "x"));
    assert!(universe.owned("alice", &None).is_empty());

    assert!(universe.try_lock("bob", None, keys(&["x"])));
    assert!(universe.release("bob", None, keys(&["x"])));
}

#[test]
fn namespaces_are_independent() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", None, keys(&["x"])));
    assert!(universe.try_lock("bob", ns("jobs"), keys(&["x"])));
    assert_eq!(universe.namespace_count(), 2);
    assert!(!universe.release("alice", ns("jobs"), keys(&["x"])));
    assert!(universe.is_locked(&ns("jobs"), "x"));
}

#[test]
fn lock_grant_is_deferred_after_release() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", None, keys(&["a", "b"])));
    let id = universe.lock("bob", None, keys(&["a"]), None, 1);
    println!("Request id: {}", &id);
    assert!(id.starts_with("bob_"));
    assert!(universe.take_notices().is_empty());
    assert_eq!(universe.pending_len(&None), 1);
    assert_eq!(universe.pending_requests("bob").len(), 1);

    assert!(universe.release("alice", None, keys(&["a"])));
    assert!(universe.has_deferred());
    assert!(universe.take_notices().is_empty(), "grant must not happen inside release");

    universe.run_deferred();
    assert!(!universe.has_deferred());
    let notices = universe.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].client, "bob");
    assert_eq!(notices[0].namespace, None);
    assert_eq!(notices[0].request_id, id);
    assert_eq!(notices[0].result, Ok(()));

    assert_eq!(universe.owned("bob", &None), keys(&["a"]));
    assert!(universe.pending_requests("bob").is_empty());
    assert!(!universe.abort("bob", None, &id), "granted request is not abortable");
}

#[test]
fn immediate_grant_issues_notice() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    universe.lock("alice", ns("jobs"), keys(&["a"]), None, 7);
    assert_eq!(results(universe.take_notices()), vec![(7, Ok(()))]);
    assert_eq!(universe.owned("alice", &ns("jobs")), keys(&["a"]));
    assert!(universe.pending_requests("alice").is_empty());
}

#[test]
fn capacity() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(Some(1), IDLE);

    assert!(universe.try_lock("alice", None, keys(&["a"])));
    universe.lock("bob", None, keys(&["a"]), None, 1);
    universe.lock("carol", None, keys(&["a"]), None, 2);

    assert_eq!(results(universe.take_notices()), vec![(2, Err(LockError::CapacityExceeded { max_pending: 1 }))]);
    assert!(universe.pending_requests("carol").is_empty());
    assert!(!universe.has_client("carol"), "rejected request left a client record behind");
    assert_eq!(universe.pending_len(&None), 1);
}

#[test]
fn abort_is_scoped_to_owner() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", None, keys(&["a"])));
    let id = universe.lock("bob", None, keys(&["a"]), Some(Duration::from_secs(60)), 1);

    assert!(!universe.abort("alice", None, &id));
    assert!(!universe.abort("bob", ns("other"), &id));
    assert_eq!(universe.pending_len(&None), 1);

    assert!(universe.abort("bob", None, &id));
    assert_eq!(results(universe.take_notices()), vec![(1, Err(LockError::Aborted))]);
    assert!(!universe.abort("bob", None, &id));
    assert!(universe.take_notices().is_empty());
    assert_eq!(universe.pending_len(&None), 0);
}

#[test]
fn timeout() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", None, keys(&["a"])));
    let id = universe.lock("bob", None, keys(&["a"]), Some(Duration::from_millis(100)), 1);
    let wakeup = universe.next_wakeup().expect("no wakeup for timeout");
    assert!(wakeup <= Instant::now() + Duration::from_millis(100));

    universe.fire(Instant::now() + Duration::from_secs(1));
    assert_eq!(results(universe.take_notices()), vec![(1, Err(LockError::Timeout))]);
    assert!(!universe.abort("bob", None, &id));
    assert!(universe.pending_requests("bob").is_empty());
    assert_eq!(universe.next_wakeup(), None, "locked namespace without deadlines needs no timer");
}

#[test]
fn release_client() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", None, keys(&["a", "b"])));
    assert!(universe.try_lock("alice", ns("jobs"), keys(&["x"])));
    assert!(universe.try_lock("bob", None, keys(&["c"])));
    let alice_pending = universe.lock("alice", None, keys(&["c"]), None, 1);
    let bob_pending = universe.lock("bob", None, keys(&["a"]), None, 2);

    println!("Releasing alice");
    universe.release_client("alice");
    assert!(!universe.has_client("alice"));
    assert!(!universe.is_locked(&None, "b"));
    assert!(!universe.is_locked(&ns("jobs"), "x"));
    assert!(!universe.abort("alice", None, &alice_pending));
    assert_eq!(results(universe.take_notices()), vec![(1, Err(LockError::Aborted))]);

    universe.run_deferred();
    let notices = universe.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].request_id, bob_pending);
    assert_eq!(notices[0].result, Ok(()));
    assert_eq!(universe.owned("bob", &None), keys(&["a", "c"]));

    assert!(universe.try_lock("carol", None, keys(&["b"])));
    assert!(universe.try_lock("carol", ns("jobs"), keys(&["x"])));

    universe.release_client("unknown");
}

#[test]
fn idle_namespace_is_collected() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", ns("jobs"), keys(&["a"])));
    assert_eq!(universe.next_wakeup(), None);
    assert!(universe.release("alice", ns("jobs"), keys(&["a"])));
    assert!(universe.has_namespace(&ns("jobs")));
    let wakeup = universe.next_wakeup().expect("no collection timer");

    println!("Unrelated operation keeps the armed timer");
    assert!(!universe.release("alice", ns("jobs"), keys(&["a"])));
    assert_eq!(universe.next_wakeup(), Some(wakeup));

    universe.fire(Instant::now());
    assert!(universe.has_namespace(&ns("jobs")), "collected before idle timeout");

    universe.fire(Instant::now() + IDLE + Duration::from_secs(1));
    assert!(!universe.has_namespace(&ns("jobs")));
    assert_eq!(universe.namespace_count(), 0);
    assert_eq!(universe.next_wakeup(), None);
}

#[test]
fn activity_cancels_collection() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(!universe.release("alice", None, keys(&["a"])));
    assert!(universe.has_namespace(&None));
    assert!(universe.next_wakeup().is_some());

    assert!(universe.try_lock("alice", None, keys(&["a"])));
    assert_eq!(universe.next_wakeup(), None);

    universe.fire(Instant::now() + IDLE * 2);
    assert!(universe.has_namespace(&None));
    assert!(universe.is_locked(&None, "a"));

    println!("Emptying the namespace rearms the timer");
    assert!(universe.release("alice", None, keys(&["a"])));
    let wakeup = universe.next_wakeup().expect("no collection timer");
    assert!(wakeup >= Instant::now() + IDLE - Duration::from_secs(1));

    universe.fire(wakeup);
    assert!(!universe.has_namespace(&None));
}

#[test]
fn namespace_touched_without_locking_is_collected() {
    crate::init();
    let mut universe: LockUniverse<u32> = LockUniverse::new(None, IDLE);

    assert!(universe.try_lock("alice", None, keys(&[])));
    assert!(universe.has_namespace(&None));
    universe.fire(Instant::now() + IDLE * 2);
    assert!(!universe.has_namespace(&None));
}
