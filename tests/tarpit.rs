use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    time::Duration,
};

use ssh_tarpit::{Config, Endpoint, Tarpit, listener};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

const SILENCE: Duration = Duration::from_millis(300);
const PATIENCE: Duration = Duration::from_secs(5);

/// Starts a tarpit on loopback ephemeral ports, one per banner, and returns
/// their addresses in the same order.
fn spawn_tarpit(banners: &[&[u8]], capacity: usize) -> Vec<SocketAddr> {
    let config = Config {
        endpoints: banners.iter().map(|b| Endpoint::new(0, b)).collect(),
        bind_addrs: vec![Ipv4Addr::LOCALHOST.into()],
        max_clients: NonZeroUsize::new(capacity).unwrap(),
        ..Config::default()
    };
    config.validate().unwrap();
    let listeners = listener::bind(&config).unwrap().register().unwrap();
    let addrs = listeners.local_addrs();
    let tarpit = Tarpit::new(listeners, config.max_clients).with_poll_timeout(Duration::from_millis(100));
    tokio::spawn(tarpit.run());
    addrs
}

async fn connect_and_read_banner(addr: SocketAddr, banner: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = vec![0; banner.len()];
    timeout(PATIENCE, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, banner);
    stream
}

async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0; 64];
    match timeout(SILENCE, stream.read(&mut buf)).await {
        Err(_elapsed) => {}
        Ok(result) => panic!("expected silence, got {result:?}"),
    }
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0; 64];
    match timeout(PATIENCE, stream.read(&mut buf)).await.unwrap() {
        Ok(0) => {}
        Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn each_port_sends_its_own_banner_and_nothing_else() {
    let banners: [&[u8]; 3] = [
        b"SSH-2.0-OpenSSH_4.5p1 FreeBSD-20061110\n",
        b"SSH-2.0-OpenSSH_5.4p1 Debian-5\n",
        b"SSH-2.0-OpenSSH_5.3\n",
    ];
    let addrs = spawn_tarpit(&banners, 10);

    let mut streams = Vec::new();
    for (addr, banner) in addrs.iter().zip(banners) {
        streams.push(connect_and_read_banner(*addr, banner).await);
    }
    for stream in &mut streams {
        assert_silent(stream).await;
    }
}

#[tokio::test]
async fn oldest_peer_is_evicted_when_full() {
    let banner: &[u8] = b"SSH-2.0-OpenSSH_5.3\r\n";
    let addr = spawn_tarpit(&[banner], 2)[0];

    let mut first = connect_and_read_banner(addr, banner).await;
    let mut second = connect_and_read_banner(addr, banner).await;
    assert_silent(&mut first).await;

    let mut third = connect_and_read_banner(addr, banner).await;
    assert_closed(&mut first).await;
    assert_silent(&mut second).await;
    assert_silent(&mut third).await;
}

#[tokio::test]
async fn sending_data_never_gets_a_reply_or_a_close() {
    let banner: &[u8] = b"SSH-2.0-OpenSSH_5.3\r\n";
    let addr = spawn_tarpit(&[banner], 4)[0];

    let mut peer = connect_and_read_banner(addr, banner).await;
    peer.write_all(b"SSH-2.0-Scanner_1.0\r\n").await.unwrap();
    peer.write_all(&[0xa5; 64 * 1024]).await.unwrap();
    assert_silent(&mut peer).await;

    peer.write_all(b"still here").await.unwrap();
    assert_silent(&mut peer).await;
}

#[tokio::test]
async fn half_close_after_payload_is_handled() {
    let banner: &[u8] = b"SSH-2.0-OpenSSH_5.3\r\n";
    let addr = spawn_tarpit(&[banner], 4)[0];

    let mut peer = connect_and_read_banner(addr, banner).await;
    peer.write_all(&[b'z'; 5000]).await.unwrap();
    peer.shutdown().await.unwrap();

    // The end of stream counts as a disconnect; no data comes back before the close.
    assert_closed(&mut peer).await;
    drop(peer);

    // The loop survived and keeps serving.
    let mut next = connect_and_read_banner(addr, banner).await;
    assert_silent(&mut next).await;
}

#[tokio::test]
async fn eviction_follows_admission_order_not_free_slots() {
    let banner: &[u8] = b"SSH-2.0-OpenSSH_5.3\r\n";
    let addr = spawn_tarpit(&[banner], 2)[0];

    let mut kept = connect_and_read_banner(addr, banner).await;
    let leaving = connect_and_read_banner(addr, banner).await;
    drop(leaving);
    tokio::time::sleep(SILENCE).await;

    // Capacity 2 with one live peer: a newcomer takes slot 0 and evicts `kept`,
    // since eviction follows admission order rather than free slots.
    let mut newcomer = connect_and_read_banner(addr, banner).await;
    assert_closed(&mut kept).await;

    // The next one lands in the slot the leaver freed and evicts nobody.
    let mut last = connect_and_read_banner(addr, banner).await;
    assert_silent(&mut newcomer).await;
    assert_silent(&mut last).await;
}
