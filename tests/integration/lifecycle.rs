//! Construction and teardown

use pivot_netstack::config::StackSettings;
use pivot_netstack::error::StackError;
use pivot_netstack::link::{Link, MemoryLink};
use pivot_netstack::netstack::NetworkStack;
use pivot_netstack::pool::ConnectionPool;

use super::{syn, Harness, STEP};

#[tokio::test]
async fn test_destroy_closes_link_once() {
    let mut h = Harness::start(8, None);

    h.stack.destroy().await.unwrap();
    assert!(h.link.is_closed());
    assert_eq!(h.link.close_calls(), 1);

    // Second call is a no-op
    h.stack.destroy().await.unwrap();
    assert_eq!(h.link.close_calls(), 1);
    assert!(h.stack.is_destroyed());

    // Nothing answers any more
    h.inject(syn("10.0.0.2:40000", "198.51.100.1:80", 1));
    h.assert_silent().await;
}

#[tokio::test]
async fn test_pending_request_outlives_stack() {
    let pool = ConnectionPool::new(8);
    let h = Harness::start(8, Some(pool.clone()));

    h.inject(syn("10.0.0.2:40000", "198.51.100.1:80", 1));
    let request = tokio::time::timeout(STEP, pool.next()).await.unwrap().unwrap();
    h.stack.destroy().await.unwrap();

    let err = request.into_tcp().unwrap().accept().unwrap_err();
    assert!(matches!(err, StackError::StackStopped));
}

#[tokio::test]
async fn test_engine_released_on_destroy() {
    let pool = ConnectionPool::new(8);
    let mut h = Harness::start(8, Some(pool.clone()));

    h.inject(syn("10.0.0.2:40000", "198.51.100.1:80", 1));
    let request = tokio::time::timeout(STEP, pool.next()).await.unwrap().unwrap();
    let _conn = request.into_tcp().unwrap().accept().unwrap();
    let _syn_ack = h.recv().await;
    assert_eq!(h.stack.current_stack().lock().socket_count(), 1);

    h.stack.destroy().await.unwrap();
    assert_eq!(h.stack.current_stack().lock().socket_count(), 0);
}

#[tokio::test]
async fn test_failed_construction_releases_link() {
    let (link, _peer) = MemoryLink::pair("pivot-test", 1500);
    let mut settings = StackSettings::new("pivot-test", 8);
    settings.tcp_buffer_size = 16;

    let result = NetworkStack::with_link(&settings, link.clone(), None);
    assert!(matches!(result, Err(StackError::Config(_))));
    assert!(link.is_closed());
    assert_eq!(link.close_calls(), 1);
}

#[tokio::test]
async fn test_oversized_inflight_cap_is_a_config_error() {
    let (link, _peer) = MemoryLink::pair("pivot-test", 1500);
    let settings = StackSettings::new("pivot-test", usize::MAX);

    let result = NetworkStack::with_link(&settings, link.clone(), None);
    assert!(matches!(result, Err(StackError::Config(_))));
    assert_eq!(link.close_calls(), 1);
}

#[tokio::test]
async fn test_invalid_interface_name_rejected_before_open() {
    let settings = StackSettings::new("name/with/slash", 8);
    let err = NetworkStack::new(&settings, None).unwrap_err();
    assert!(matches!(err, StackError::Config(_)));
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN and /dev/net/tun"]
async fn test_reopen_after_destroy() {
    let settings = StackSettings::new("pivottest0", 8);

    let stack = NetworkStack::new(&settings, None).unwrap();
    stack.destroy().await.unwrap();

    let again = NetworkStack::new(&settings, None).unwrap();
    again.destroy().await.unwrap();
}
