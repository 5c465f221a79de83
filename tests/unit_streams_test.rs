use lazulite::core::connection::StreamIdPool;
use std::collections::HashSet;

#[test]
fn test_borrowed_ids_are_unique() {
    let pool = StreamIdPool::new(128);
    let mut seen = HashSet::new();
    for _ in 0..128 {
        let id = pool.borrow().expect("pool should have free ids");
        assert!(seen.insert(id), "id {id} was handed out twice");
    }
    assert_eq!(pool.outstanding(), 128);
}

#[test]
fn test_exhausted_pool_returns_none() {
    let pool = StreamIdPool::new(4);
    let ids: Vec<i16> = (0..4).map(|_| pool.borrow().unwrap()).collect();
    assert!(pool.borrow().is_none());
    assert!(!pool.has_free());
    pool.release(ids[0]);
    assert!(pool.has_free());
    assert!(pool.borrow().is_some());
}

#[test]
fn test_outstanding_tracks_borrows_and_releases() {
    let pool = StreamIdPool::new(8);
    let a = pool.borrow().unwrap();
    let b = pool.borrow().unwrap();
    assert_eq!(pool.outstanding(), 2);
    pool.release(a);
    assert_eq!(pool.outstanding(), 1);
    pool.release(b);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.capacity(), 8);
}

#[test]
fn test_released_id_can_be_borrowed_again() {
    let pool = StreamIdPool::new(1);
    let id = pool.borrow().unwrap();
    assert!(pool.borrow().is_none());
    pool.release(id);
    assert_eq!(pool.borrow(), Some(id));
}

#[test]
fn test_ids_fit_the_wire_range() {
    let pool = StreamIdPool::new(32_768);
    for _ in 0..32_768 {
        let id = pool.borrow().unwrap();
        assert!(id >= 0);
    }
    assert!(pool.borrow().is_none());
}

#[test]
fn test_concurrent_borrow_release_keeps_bijection() {
    let pool = std::sync::Arc::new(StreamIdPool::new(64));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..1_000 {
                if let Some(id) = pool.borrow() {
                    pool.release(id);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.outstanding(), 0);
    // Every id must be back in the free list exactly once.
    let mut seen = HashSet::new();
    while let Some(id) = pool.borrow() {
        assert!(seen.insert(id));
    }
    assert_eq!(seen.len(), 64);
}
