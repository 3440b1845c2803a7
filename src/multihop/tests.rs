// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use zerocopy::FromBytes;

use super::codec::UdpHeader;
use super::{Error, MultihopBind, MultihopTun};
use crate::packet::Ipv4Header;

fn test_tun() -> (MultihopTun, SocketAddr) {
    let local = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5));
    let remote = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
    let tun = MultihopTun::new(local, remote, 5005, 1280).unwrap();
    let endpoint = MultihopBind::parse_endpoint("1.2.3.4:5005").unwrap();
    (tun, endpoint)
}

async fn expect_soon<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), fut)
        .await
        .expect("operation timed out")
}

/// A datagram sent on the bind comes out of the tunnel read with full IPv4 + UDP
/// headers around it.
#[test_log::test(tokio::test)]
async fn v4_send_recv_round_trip() {
    let (tun, endpoint) = test_tun();
    let mut bind = tun.binder();
    let (_receiver, port) = bind.open(0).unwrap();
    assert_eq!(port & 1, 1, "random port always has the low bit set");

    let sender = tokio::spawn(async move {
        bind.send(&[1, 2, 3, 4], endpoint).await.unwrap();
    });

    let packet = expect_soon(tun.recv()).await.unwrap();
    assert_eq!(packet.len(), 32);

    let (ip, rest) = Ipv4Header::ref_from_prefix(&packet).unwrap();
    assert_eq!(ip.version(), 4);
    assert_eq!(ip.source(), Ipv4Addr::new(1, 2, 3, 5));
    assert_eq!(ip.destination(), Ipv4Addr::new(1, 2, 3, 4));

    let (udp, payload) = UdpHeader::ref_from_prefix(rest).unwrap();
    assert_eq!(udp.source_port.get(), port);
    assert_eq!(udp.destination_port.get(), 5005);
    assert_eq!(payload, &[1u8, 2, 3, 4]);

    sender.await.unwrap();
}

/// A tunnel write pairs up with a bind receive, which sees the bare UDP payload
/// and the fixed remote endpoint.
#[test_log::test(tokio::test)]
async fn write_pairs_with_receive() {
    let (tun, endpoint) = test_tun();
    let mut bind = tun.binder();
    let (mut receiver, _port) = bind.open(51821).unwrap();

    // First build a valid datagram by sending through the bind.
    let sender = tokio::spawn(async move {
        bind.send(b"general kenobi", endpoint).await.unwrap();
    });
    let datagram = expect_soon(tun.recv()).await.unwrap();
    sender.await.unwrap();

    // Now write it to the tunnel and receive it on the bind side.
    let reader = tokio::spawn(async move {
        let mut out = [0u8; 1500];
        let (size, from) = receiver.recv(&mut out).await.unwrap();
        (out[..size].to_vec(), from)
    });

    let consumed = expect_soon(tun.send(datagram)).await.unwrap();
    let (payload, from) = reader.await.unwrap();
    assert_eq!(consumed, b"general kenobi".len());
    assert_eq!(payload, b"general kenobi");
    assert_eq!(from, endpoint);
}

/// Closing the tunnel releases a blocked read and makes all later operations fail
/// immediately.
#[test_log::test(tokio::test)]
async fn close_unblocks_blocked_read() {
    let (tun, endpoint) = test_tun();
    let mut bind = tun.binder();
    let (mut receiver, _port) = bind.open(51821).unwrap();

    let tun = std::sync::Arc::new(tun);
    let blocked = tokio::spawn({
        let tun = std::sync::Arc::clone(&tun);
        async move { tun.recv().await.map(|_| ()) }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    tun.close();
    tun.close(); // close is idempotent

    assert!(matches!(
        expect_soon(blocked).await.unwrap(),
        Err(Error::Closed)
    ));

    // All surfaces are now terminally closed.
    assert!(matches!(tun.recv().await, Err(Error::Closed)));
    assert!(matches!(
        bind.send(&[1], endpoint).await,
        Err(Error::Closed)
    ));
    let mut out = [0u8; 64];
    assert!(matches!(receiver.recv(&mut out).await, Err(Error::Closed)));
}

/// Closing the bind view leaves the tunnel alone, and re-opening the bind yields a
/// working socket again.
#[test_log::test(tokio::test)]
async fn bind_can_be_cycled() {
    let (tun, endpoint) = test_tun();
    let mut bind = tun.binder();
    let (mut old_receiver, _port) = bind.open(51821).unwrap();

    bind.close();
    bind.close(); // close is idempotent

    let mut out = [0u8; 64];
    assert!(matches!(
        old_receiver.recv(&mut out).await,
        Err(Error::Closed)
    ));
    assert!(matches!(
        bind.send(&[1], endpoint).await,
        Err(Error::Closed)
    ));

    // Re-open and run a fresh datagram through; the old latch must not interfere.
    let (_receiver, port) = bind.open(51822).unwrap();
    assert_eq!(port, 51822);

    let sender = tokio::spawn(async move {
        bind.send(&[9, 9, 9], endpoint).await.unwrap();
    });
    let packet = expect_soon(tun.recv()).await.unwrap();
    assert_eq!(packet.len(), 31);
    sender.await.unwrap();
}

/// The bind view must not keep the tunnel alive.
#[test_log::test(tokio::test)]
async fn bind_outliving_tun_is_closed() {
    let (tun, endpoint) = test_tun();
    let mut bind = tun.binder();
    drop(tun);

    assert!(matches!(bind.open(0), Err(Error::Closed)));
    assert!(matches!(
        bind.send(&[1], endpoint).await,
        Err(Error::Closed)
    ));
}
