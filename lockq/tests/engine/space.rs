use lockq::engine::{LockError, LockOptions, LockSpace, RequestId, ResourceSet, REQUEST_ID_LENGTH};
use std::time::Duration;
use tokio::time::Instant;

use crate::resources;

/// Requests a lock that must be queued.
fn enqueue(space: &mut LockSpace<u32>, resources: ResourceSet, tag: u32) -> RequestId {
    let (id, settled) = space.lock(resources, &LockOptions::default(), tag);
    assert!(settled.is_none(), "request {} was settled immediately", tag);
    id
}

/// Requests a lock that must be granted immediately.
fn grant(space: &mut LockSpace<u32>, resources: ResourceSet, tag: u32) -> RequestId {
    let (id, settled) = space.lock(resources, &LockOptions::default(), tag);
    let settled = settled.expect("request was not settled immediately");
    assert_eq!(settled.result, Ok(()));
    assert_eq!(settled.payload, tag);
    id
}

/// Drains the queue and returns the payloads of the granted requests.
fn drain(space: &mut LockSpace<u32>) -> Vec<u32> {
    assert!(space.needs_drain());
    space
        .drain()
        .into_iter()
        .map(|settled| {
            assert_eq!(settled.result, Ok(()));
            settled.payload
        })
        .collect()
}

#[test]
fn try_lock_is_atomic() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    assert!(space.try_lock(&resources!["a", "b"]));
    assert!(!space.try_lock(&resources!["b", "c"]));
    assert!(!space.is_locked("c"), "failed try_lock must not lock anything");
    assert_eq!(space.locked_len(), 2);

    assert!(space.try_lock(&resources!["c", "d"]));
    assert_eq!(space.locked_len(), 4);
}

#[test]
fn release() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);
    assert!(space.try_lock(&resources!["a", "b"]));

    println!("Releasing partially locked set");
    assert!(!space.release(&resources!["a", "x"]));
    assert!(!space.is_locked("a"));
    assert!(space.is_locked("b"));
    assert!(!space.needs_drain(), "drain scheduled with empty queue");

    assert!(space.release(&resources!["b"]));
    assert!(space.is_empty());
}

#[test]
fn queued_request_is_granted_after_release() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    grant(&mut space, resources!["a"], 1);
    let id = enqueue(&mut space, resources!["a"], 2);
    assert!(space.is_pending(&id));
    assert_eq!(space.pending_len(), 1);

    assert!(space.release(&resources!["a"]));
    assert!(!space.is_locked("a"), "release must not grant inline");
    assert!(space.is_pending(&id));

    assert_eq!(drain(&mut space), vec![2]);
    assert!(!space.needs_drain());
    assert!(space.is_locked("a"));
    assert!(!space.is_pending(&id));
    assert!(space.abort(&id).is_none(), "abort after grant must report not found");
}

#[test]
fn release_without_unlocking_does_not_schedule_drain() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    grant(&mut space, resources!["a"], 1);
    enqueue(&mut space, resources!["a"], 2);

    assert!(!space.release(&resources!["b"]));
    assert!(!space.needs_drain());
}

#[test]
fn drain_grants_in_arrival_order() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    grant(&mut space, resources!["a"], 1);
    enqueue(&mut space, resources!["a"], 2);
    enqueue(&mut space, resources!["a"], 3);

    space.release(&resources!["a"]);
    assert_eq!(drain(&mut space), vec![2], "resources granted in a pass count as locked");
    assert_eq!(space.pending_len(), 1);

    space.release(&resources!["a"]);
    assert_eq!(drain(&mut space), vec![3]);
    assert_eq!(space.pending_len(), 0);
}

#[test]
fn drain_skips_blocked_requests() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    grant(&mut space, resources!["a"], 1);
    grant(&mut space, resources!["b"], 2);
    enqueue(&mut space, resources!["a", "b"], 3);
    enqueue(&mut space, resources!["a"], 4);
    enqueue(&mut space, resources!["b"], 5);
    assert_eq!(space.queued_ids().count(), 3);

    println!("Releasing b");
    space.release(&resources!["b"]);
    assert_eq!(drain(&mut space), vec![5]);

    println!("Releasing a");
    space.release(&resources!["a"]);
    assert_eq!(drain(&mut space), vec![4], "blocked request must not hold up later ones");
    assert_eq!(space.pending_len(), 1);

    space.release(&resources!["a", "b"]);
    assert_eq!(drain(&mut space), vec![3]);
    assert_eq!(space.pending_len(), 0);
}

#[test]
fn single_keys_after_multi_key_lock() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    grant(&mut space, resources!["a", "b", "c", "d"], 0);
    let ids: Vec<RequestId> =
        ["a", "b", "c", "d"].iter().zip(1..).map(|(key, tag)| enqueue(&mut space, resources![key], tag)).collect();
    let order: Vec<String> = space.queued_ids().map(|id| id.to_string()).collect();
    assert_eq!(order, ids.iter().map(|id| id.to_string()).collect::<Vec<_>>());

    space.release(&resources!["a"]);
    assert_eq!(drain(&mut space), vec![1]);

    for (key, tag) in [("d", 4), ("b", 2), ("c", 3)] {
        println!("Releasing {}", key);
        space.release(&resources![key]);
        assert_eq!(drain(&mut space), vec![tag]);
    }

    assert_eq!(space.pending_len(), 0);
    assert_eq!(space.locked_len(), 4);
}

#[test]
fn capacity() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(Some(2));
    assert_eq!(space.max_pending(), Some(2));

    grant(&mut space, resources!["a"], 0);
    enqueue(&mut space, resources!["a"], 1);
    enqueue(&mut space, resources!["a"], 2);

    let (id, settled) = space.lock(resources!["a"], &LockOptions::default(), 3);
    let settled = settled.expect("request beyond capacity must be rejected immediately");
    assert_eq!(settled.id, id);
    assert_eq!(settled.result, Err(LockError::CapacityExceeded { max_pending: 2 }));
    assert_eq!(settled.payload, 3);
    assert!(!space.is_pending(&id));
    assert_eq!(space.pending_len(), 2);

    println!("Free resources are granted regardless of capacity");
    grant(&mut space, resources!["b"], 4);
}

#[test]
fn timeout() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    grant(&mut space, resources!["a"], 0);
    let (short, settled) = space.lock(resources!["a"], &LockOptions::with_timeout(Duration::from_secs(10)), 1);
    assert!(settled.is_none());
    let (long, settled) = space.lock(resources!["a"], &LockOptions::with_timeout(Duration::from_secs(60)), 2);
    assert!(settled.is_none());
    let forever = enqueue(&mut space, resources!["a"], 3);

    let deadline = space.next_deadline().expect("no deadline");
    assert!(deadline > Instant::now());
    assert!(space.expire(Instant::now()).is_empty());

    let expired = space.expire(Instant::now() + Duration::from_secs(30));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, short);
    assert_eq!(expired[0].result, Err(LockError::Timeout));
    assert!(!space.is_pending(&short));
    assert!(space.is_pending(&long));

    let expired = space.expire(Instant::now() + Duration::from_secs(120));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, long);
    assert_eq!(space.next_deadline(), None);

    assert!(space.is_pending(&forever));
    space.release(&resources!["a"]);
    assert_eq!(drain(&mut space), vec![3]);
}

#[test]
fn abort() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);

    grant(&mut space, resources!["a"], 0);
    let first = enqueue(&mut space, resources!["a"], 1);
    let (second, _) = space.lock(resources!["a"], &LockOptions::with_timeout(Duration::from_secs(10)), 2);

    let settled = space.abort(&second).expect("pending request must be abortable");
    assert_eq!(settled.result, Err(LockError::Aborted));
    assert_eq!(settled.payload, 2);
    assert_eq!(space.next_deadline(), None, "abort must clear the deadline");
    assert!(space.abort(&second).is_none());
    assert!(space.abort("unknown").is_none());

    space.release(&resources!["a"]);
    assert_eq!(drain(&mut space), vec![1]);
    assert!(space.abort(&first).is_none());
}

#[test]
fn request_ids() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);
    let options = LockOptions { id_prefix: "client_".to_string(), ..Default::default() };

    grant(&mut space, resources!["a"], 0);
    let (id1, _) = space.lock(resources!["a"], &options, 1);
    let (id2, _) = space.lock(resources!["a"], &options, 2);
    println!("Request ids: {} {}", &id1, &id2);

    for id in [&id1, &id2] {
        let suffix = id.strip_prefix("client_").expect("missing prefix");
        assert_eq!(suffix.len(), REQUEST_ID_LENGTH);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
    assert_ne!(id1, id2);
}

#[test]
fn empty() {
    crate::init();
    let mut space: LockSpace<u32> = LockSpace::new(None);
    assert!(space.is_empty());

    grant(&mut space, resources!["a"], 0);
    assert!(!space.is_empty());

    let id = enqueue(&mut space, resources!["a"], 1);
    space.release(&resources!["a"]);
    assert!(!space.is_empty(), "queued request keeps space non-empty");

    space.abort(&id);
    assert!(space.is_empty());
}
