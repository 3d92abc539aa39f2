//! Pool replacement and closed pools seen through a live stack

use std::collections::HashSet;

use pivot_netstack::pool::ConnectionPool;

use super::{eventually, syn, udp, Harness};

#[tokio::test]
async fn test_replace_pool_keeps_old_requests() {
    let pool_a = ConnectionPool::new(16);
    let h = Harness::start(16, Some(pool_a.clone()));

    h.inject(syn("10.0.0.2:40001", "198.51.100.1:80", 1));
    h.inject(syn("10.0.0.2:40002", "198.51.100.1:80", 1));
    eventually(|| pool_a.len() == 2).await;

    let pool_b = ConnectionPool::new(16);
    let previous = h.stack.replace_pool(pool_b.clone()).unwrap();
    assert!(previous.same_pool(&pool_a));

    h.inject(syn("10.0.0.2:40003", "198.51.100.1:80", 1));
    h.inject(udp("10.0.0.2:5353", "198.51.100.1:53", b"q"));
    eventually(|| pool_b.len() == 2).await;
    assert_eq!(pool_a.len(), 2);

    // The old pool still hands out its requests until its owner closes it.
    let first = pool_a.next().await.unwrap();
    assert_eq!(first.flow().source.port(), 40001);
    let rest = pool_a.close();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].flow().source.port(), 40002);
    assert!(pool_a.next().await.is_none());
}

#[tokio::test]
async fn test_closed_pool_never_surfaces_requests() {
    let pool = ConnectionPool::new(16);
    let h = Harness::start(16, Some(pool.clone()));
    pool.close();

    h.inject(syn("10.0.0.2:40000", "198.51.100.1:80", 1));
    h.inject(udp("10.0.0.2:5353", "198.51.100.1:53", b"q"));
    eventually(|| h.stack.stats().dropped_pool_closed == 2).await;

    assert!(pool.is_empty());
    assert!(pool.try_next().is_none());
}

#[tokio::test]
async fn test_every_request_lands_in_exactly_one_pool() {
    const FLOWS: u16 = 200;

    let first = ConnectionPool::new(1024);
    let h = Harness::start(1024, Some(first.clone()));
    let mut pools = vec![first];

    for port in 0..FLOWS {
        h.inject(udp(
            &format!("10.0.0.2:{}", 10_000 + port),
            "198.51.100.1:53",
            b"q",
        ));
        if port % 20 == 0 {
            let next = ConnectionPool::new(1024);
            h.stack.replace_pool(next.clone());
            pools.push(next);
            tokio::task::yield_now().await;
        }
    }
    eventually(|| h.stack.stats().frames_in == u64::from(FLOWS)).await;

    let mut seen = HashSet::new();
    for pool in &pools {
        for request in pool.close() {
            assert!(seen.insert(request.id()), "request observed twice");
        }
    }
    assert_eq!(seen.len(), usize::from(FLOWS));
    assert_eq!(h.stack.stats().udp_requests, u64::from(FLOWS));
}
