use lockq::engine::{LockError, LockRequest, RequestId, RequestState};

use crate::resources;

#[test]
fn resolve_once() {
    crate::init();
    let mut request = LockRequest::new(RequestId::from("r1"), resources!["a", "b"], None, 7u32);
    assert_eq!(request.state(), RequestState::Pending);

    let settled = request.resolve().expect("pending request must settle");
    println!("Settled: {:?}", &settled);
    assert_eq!(settled.id.as_str(), "r1");
    assert_eq!(settled.resources, resources!["a", "b"]);
    assert_eq!(settled.result, Ok(()));
    assert_eq!(settled.payload, 7);
    assert_eq!(request.state(), RequestState::Granted);

    assert!(request.resolve().is_none());
    assert!(request.reject(LockError::Timeout).is_none());
    assert!(request.abort().is_none());
    assert_eq!(request.state(), RequestState::Granted);
}

#[test]
fn reject_once() {
    crate::init();
    let mut request = LockRequest::new(RequestId::from("r2"), resources!["a"], None, ());

    let settled = request.reject(LockError::Timeout).expect("pending request must settle");
    assert_eq!(settled.result, Err(LockError::Timeout));
    assert_eq!(request.state(), RequestState::Rejected);

    assert!(request.resolve().is_none());
    assert!(request.abort().is_none());
    assert_eq!(request.state(), RequestState::Rejected);
}

#[test]
fn abort_once() {
    crate::init();
    let deadline = tokio::time::Instant::now();
    let mut request = LockRequest::new(RequestId::from("r3"), resources!["a"], Some(deadline), ());
    assert_eq!(request.deadline(), Some(deadline));

    let settled = request.abort().expect("pending request must settle");
    assert_eq!(settled.result, Err(LockError::Aborted));
    assert_eq!(request.state(), RequestState::Aborted);
    assert_eq!(request.deadline(), None);

    assert!(request.resolve().is_none());
    assert!(request.reject(LockError::Timeout).is_none());
    assert_eq!(request.state(), RequestState::Aborted);
}

#[test]
fn request_id() {
    crate::init();
    let id = RequestId::from("client_abc".to_string());
    assert_eq!(id.as_str(), "client_abc");
    assert_eq!(id.to_string(), "client_abc");
    assert!(id.starts_with("client_"));
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"client_abc\"");
    assert_eq!(id.into_string(), "client_abc");
}

#[test]
fn lock_error_messages() {
    crate::init();
    for err in [LockError::CapacityExceeded { max_pending: 3 }, LockError::Timeout, LockError::Aborted] {
        println!("{:?}: {}", &err, &err);
        assert!(!err.to_string().is_empty());
    }
    assert!(LockError::CapacityExceeded { max_pending: 3 }.to_string().contains('3'));
}
