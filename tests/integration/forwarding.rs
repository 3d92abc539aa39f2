//! Flow classification and request completion through a live stack

use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use pivot_netstack::packet::{build_echo_request, build_tcp, classify, tcp_payload, Segment, TcpFlags};
use pivot_netstack::pool::ConnectionPool;

use super::{addr, eventually, syn, udp, Harness, STEP};

fn tcp_meta(frame: &[u8]) -> pivot_netstack::packet::TcpMeta {
    match classify(frame) {
        Segment::Tcp(meta) => meta,
        other => panic!("expected a TCP segment, got {other:?}"),
    }
}

#[tokio::test]
async fn test_inflight_cap_holds_back_sixth_connection() {
    let pool = ConnectionPool::new(64);
    let mut h = Harness::start(5, Some(pool.clone()));

    for port in 8001..=8006u16 {
        h.inject(syn("10.0.0.2:40000", &format!("198.51.100.1:{port}"), 1));
    }
    eventually(|| h.stack.stats().frames_in == 6).await;
    assert_eq!(pool.len(), 5);
    assert_eq!(h.stack.stats().dropped_inflight, 1);

    // Retransmitted SYN while the cap is still reached
    h.inject(syn("10.0.0.2:40000", "198.51.100.1:8006", 1));
    eventually(|| h.stack.stats().frames_in == 7).await;
    assert_eq!(pool.len(), 5);

    let first = pool.try_next().unwrap();
    first.terminate(false);

    h.inject(syn("10.0.0.2:40000", "198.51.100.1:8006", 1));
    eventually(|| pool.len() == 5).await;

    let ports: Vec<u16> = std::iter::from_fn(|| pool.try_next())
        .map(|request| request.flow().destination.port())
        .collect();
    assert_eq!(ports, vec![8002, 8003, 8004, 8005, 8006]);

    // Nothing was ever answered
    h.assert_silent().await;
}

#[tokio::test]
async fn test_terminate_with_reset_sends_one_rst() {
    let pool = ConnectionPool::new(8);
    let mut h = Harness::start(8, Some(pool.clone()));

    h.inject(syn("10.0.0.2:41000", "203.0.113.5:443", 5000));
    let request = tokio::time::timeout(STEP, pool.next()).await.unwrap().unwrap();
    assert!(request.is_tcp());

    request.terminate(true);
    request.terminate(true);

    let meta = tcp_meta(&h.recv().await);
    assert!(meta.flags.rst && meta.flags.ack);
    assert_eq!(meta.ack_number, 5001);
    assert_eq!(meta.flow.source, addr("203.0.113.5:443"));
    assert_eq!(meta.flow.destination, addr("10.0.0.2:41000"));

    request.terminate(false);
    drop(request);
    h.assert_silent().await;
    assert_eq!(h.stack.stats().resets_sent, 1);
}

#[tokio::test]
async fn test_dropped_request_is_silent() {
    let pool = ConnectionPool::new(8);
    let mut h = Harness::start(1, Some(pool.clone()));

    h.inject(syn("10.0.0.2:41001", "203.0.113.5:22", 1));
    let request = tokio::time::timeout(STEP, pool.next()).await.unwrap().unwrap();
    drop(request);
    h.assert_silent().await;

    // The slot came back: a new attempt is queued again.
    h.inject(syn("10.0.0.2:41002", "203.0.113.5:22", 1));
    eventually(|| pool.len() == 1).await;
}

/// Accept a flow from `client` to `server` and exchange one message each way
async fn exchange_over_accepted_flow(client: &str, server: &str) {
    let pool = ConnectionPool::new(8);
    let mut h = Harness::start(8, Some(pool.clone()));

    h.inject(syn(client, server, 1000));
    let request = tokio::time::timeout(STEP, pool.next()).await.unwrap().unwrap();
    let tcp = request.into_tcp().unwrap();
    assert_eq!(tcp.flow().destination, addr(server));

    let mut conn = tcp.accept().unwrap();
    assert_eq!(conn.peer_addr(), addr(client));
    assert_eq!(conn.original_destination(), addr(server));

    let syn_ack = tcp_meta(&h.recv().await);
    assert!(syn_ack.flags.syn && syn_ack.flags.ack);
    assert_eq!(syn_ack.ack_number, 1001);
    assert_eq!(syn_ack.flow.source, addr(server));

    let push = TcpFlags {
        ack: true,
        psh: true,
        ..TcpFlags::default()
    };
    h.inject(
        build_tcp(
            addr(client),
            addr(server),
            1001,
            syn_ack.seq.wrapping_add(1),
            push,
            65_535,
            b"hello",
        )
        .unwrap(),
    );

    let mut buf = [0u8; 5];
    tokio::time::timeout(STEP, conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    conn.write_all(b"world").await.unwrap();
    let (from, payload) = loop {
        let frame = h.recv().await;
        match tcp_payload(&frame) {
            Some(data) if !data.is_empty() => break (tcp_meta(&frame).flow, data.to_vec()),
            _ => continue,
        }
    };
    assert_eq!(payload, b"world");
    assert_eq!(from.source, addr(server));
    assert_eq!(from.destination, addr(client));

    let stats = h.stack.stats();
    assert_eq!(stats.tcp_accepted, 1);
    assert_eq!(stats.resets_sent, 0);
}

#[tokio::test]
async fn test_accepted_tcp_flow_carries_data() {
    exchange_over_accepted_flow("10.0.0.2:40000", "203.0.113.10:80").await;
}

#[tokio::test]
async fn test_accepted_tcp_flow_carries_data_v6() {
    exchange_over_accepted_flow("[fd00::2]:40000", "[2001:db8::10]:80").await;
}

#[tokio::test]
async fn test_udp_flow_round_trip() {
    let pool = ConnectionPool::new(8);
    let mut h = Harness::start(8, Some(pool.clone()));
    let client = "10.0.0.2:5353";
    let resolver = "192.0.2.53:53";

    h.inject(udp(client, resolver, b"query"));
    let request = tokio::time::timeout(STEP, pool.next()).await.unwrap().unwrap();
    let mut flow = request.into_udp().unwrap().accept().unwrap();
    assert_eq!(flow.recv().await.unwrap().as_ref(), b"query");

    flow.send(&b"answer"[..]).await.unwrap();
    match classify(&h.recv().await) {
        Segment::Udp { flow: key, payload } => {
            assert_eq!(key.source, addr(resolver));
            assert_eq!(key.destination, addr(client));
            assert_eq!(payload, b"answer");
        }
        other => panic!("expected UDP, got {other:?}"),
    }

    // Later datagrams go to the accepted flow, not the pool.
    h.inject(udp(client, resolver, b"again"));
    let next = tokio::time::timeout(STEP, flow.recv()).await.unwrap().unwrap();
    assert_eq!(next.as_ref(), b"again");
    assert!(pool.is_empty());
    assert_eq!(h.stack.stats().udp_requests, 1);
}

#[tokio::test]
async fn test_echo_is_answered_without_pool_entry() {
    let pool = ConnectionPool::new(8);
    let mut h = Harness::start(8, Some(pool.clone()));

    for (from, to) in [("10.0.0.2", "198.51.100.7"), ("fd00::2", "2001:db8::7")] {
        let from: IpAddr = from.parse().unwrap();
        let to: IpAddr = to.parse().unwrap();
        h.inject(build_echo_request(from, to, 7, 1, b"ping").unwrap());

        match classify(&h.recv().await) {
            Segment::EchoReply { flow } => {
                assert_eq!(flow.source.ip(), to);
                assert_eq!(flow.destination.ip(), from);
            }
            other => panic!("expected echo reply, got {other:?}"),
        }
    }

    assert!(pool.is_empty());
    let stats = h.stack.stats();
    assert_eq!(stats.echo_replies, 2);
    assert_eq!(stats.tcp_requests + stats.udp_requests, 0);
}

#[tokio::test]
async fn test_new_flows_dropped_silently_without_pool() {
    let mut h = Harness::start(8, None);

    h.inject(syn("10.0.0.2:40000", "198.51.100.1:80", 1));
    h.inject(udp("10.0.0.2:5353", "198.51.100.1:53", b"q"));
    eventually(|| h.stack.stats().dropped_no_pool == 2).await;
    h.assert_silent().await;
}
