use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use quictun::{
    Endpoint, Key, Session,
    client::{Client, ClientOptions, ForwardSpec},
    codec::{ControlMessage, Direction},
    forward::{Forwarder, ForwardingOptions, pump},
    server::{Server, ServerOptions, ServiceMode},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{Mutex, oneshot},
    time::{sleep, timeout},
};

mod common;
use common::{MemorySession, SETUP};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

async fn connect_when_ready(addr: SocketAddr) -> TcpStream {
    timeout(Duration::from_secs(5), async {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return stream,
                Err(_) => sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("forwarding listener never came up")
}

/// Accept one connection, read everything, then send it all back.
fn echo_once(listener: TcpListener) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        stream.write_all(&received).await.unwrap();
        stream.shutdown().await.unwrap();
        received
    })
}

async fn exchange(source: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut stream = connect_when_ready(source).await;
    let (mut read, mut write) = stream.split();
    let mut back = Vec::new();
    let (sent, got) = tokio::join!(
        async {
            write.write_all(data).await?;
            write.shutdown().await
        },
        read.read_to_end(&mut back),
    );
    sent.unwrap();
    got.unwrap();
    back
}

struct Running {
    server: Server,
    addr: SocketAddr,
}

fn start_server() -> Running {
    let endpoint = Endpoint::new("127.0.0.1:0", Key::generate().unwrap(), Default::default()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    let server = Server::new(endpoint, ServerOptions::default());
    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    Running { server, addr }
}

#[tokio::test]
async fn local_forwarding_end_to_end() {
    *SETUP;

    let destination = TcpListener::bind((LOCALHOST, 43333)).await.unwrap();
    let echo = echo_once(destination);
    let running = start_server();

    let end = Endpoint::new("127.0.0.1:0", Key::generate().unwrap(), Default::default()).unwrap();
    let client = Client::connect(
        &end,
        running.addr,
        ClientOptions {
            forward_only: true,
            local_forward: Some(ForwardSpec {
                local_port: 42222,
                remote_port: 43333,
                remote_ip: LOCALHOST,
            }),
            forwarding: ForwardingOptions {
                listen_ip: LOCALHOST,
                ..Default::default()
            },
            ..Default::default()
        },
        |_, _| true,
    )
    .await
    .unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let session = client.session().clone();
    let run = tokio::spawn(client.run(tokio::io::empty(), tokio::io::sink(), async move {
        stopped.await.ok();
    }));

    let data = payload(1024 * 1024);
    let back = exchange((LOCALHOST, 42222).into(), &data).await;
    assert_eq!(echo.await.unwrap(), data);
    assert_eq!(back, data);

    stop.send(()).unwrap();
    timeout(Duration::from_secs(5), run)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    session.closed().await.unwrap();

    // the listener went away with the session
    sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect((LOCALHOST, 42222)).await.is_err());
    running.server.endpoint().close(0, b"");
}

#[tokio::test]
async fn remote_forwarding_end_to_end() {
    *SETUP;

    let destination = TcpListener::bind((LOCALHOST, 43334)).await.unwrap();
    let echo = echo_once(destination);
    let running = start_server();

    let end = Endpoint::new("127.0.0.1:0", Key::generate().unwrap(), Default::default()).unwrap();
    let client = Client::connect(
        &end,
        running.addr,
        ClientOptions {
            forward_only: true,
            remote_forward: Some(ForwardSpec {
                local_port: 42223,
                remote_port: 43334,
                remote_ip: LOCALHOST,
            }),
            ..Default::default()
        },
        |_, _| true,
    )
    .await
    .unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let run = tokio::spawn(client.run(tokio::io::empty(), tokio::io::sink(), async move {
        stopped.await.ok();
    }));

    let data = payload(256 * 1024);
    let back = exchange((LOCALHOST, 42223).into(), &data).await;
    assert_eq!(echo.await.unwrap(), data);
    assert_eq!(back, data);

    stop.send(()).unwrap();
    timeout(Duration::from_secs(5), run)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    running.server.endpoint().close(0, b"");
}

#[tokio::test]
async fn forwarder_pair_in_memory() {
    *SETUP;

    let (a, b) = MemorySession::pair((None, None));
    let source = Forwarder::new(
        a,
        ForwardingOptions {
            listen_ip: LOCALHOST,
            ..Default::default()
        },
    );
    let destination = Forwarder::new(
        b,
        ForwardingOptions {
            serving: true,
            ..Default::default()
        },
    );
    tokio::spawn({
        let destination = destination.clone();
        async move { destination.run_as_destination().await }
    });

    let target = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    let echo = echo_once(target);

    let listening = source
        .start_source(0, target_port, LOCALHOST)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source.listeners(), vec![listening]);

    let back = exchange(listening, b"through the tunnel").await;
    assert_eq!(back, b"through the tunnel");
    assert_eq!(echo.await.unwrap(), b"through the tunnel");

    source.close_listeners();
    assert!(source.listeners().is_empty());
    sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(listening).await.is_err());
}

#[tokio::test]
async fn busy_port_is_reported_when_serving() {
    *SETUP;

    let (a, b) = MemorySession::pair((None, None));
    let (notices, _) = a.open_stream().await.unwrap();
    let (_, peer_recv) = b.accept_stream().await.unwrap();

    let forwarder = Forwarder::new(
        a,
        ForwardingOptions {
            serving: true,
            listen_ip: LOCALHOST,
            ..Default::default()
        },
    )
    .with_notices(Arc::new(Mutex::new(notices)));

    let busy = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = busy.local_addr().unwrap().port();
    assert_eq!(forwarder.start_source(port, 80, LOCALHOST).await.unwrap(), None);

    let mut line = String::new();
    BufReader::new(peer_recv).read_line(&mut line).await.unwrap();
    assert_eq!(
        line,
        "Error with port forwarding. Maybe chosen port is already used\n"
    );
}

#[tokio::test]
async fn busy_port_fails_when_not_serving() {
    *SETUP;

    let (a, _b) = MemorySession::pair((None, None));
    let forwarder = Forwarder::new(
        a,
        ForwardingOptions {
            listen_ip: LOCALHOST,
            ..Default::default()
        },
    );

    let busy = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = busy.local_addr().unwrap().port();
    assert!(forwarder.start_source(port, 80, LOCALHOST).await.is_err());
}

#[tokio::test]
async fn remote_request_refused_when_not_serving() {
    *SETUP;

    let (a, b) = MemorySession::pair((None, None));
    let client = Forwarder::new(b, ForwardingOptions::default());
    tokio::spawn({
        let client = client.clone();
        async move { client.run_as_destination().await }
    });

    let free = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = free.local_addr().unwrap().port();
    drop(free);

    let request = ControlMessage {
        direction: Direction::Remote,
        local_port: port,
        remote_port: 80,
        remote_ip: LOCALHOST,
    };
    let (mut send, mut recv) = a.open_stream().await.unwrap();
    send.write_all(&request.encode()).await.unwrap();

    // the stream is closed without listening
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), recv.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    assert!(client.listeners().is_empty());
    assert!(TcpStream::connect((LOCALHOST, port)).await.is_err());
}

#[tokio::test]
async fn bad_request_is_reported() {
    *SETUP;

    let (a, b) = MemorySession::pair((None, None));
    let (notices, _) = b.open_stream().await.unwrap();
    let (_, notices_recv) = a.accept_stream().await.unwrap();

    let destination = Forwarder::new(
        b,
        ForwardingOptions {
            serving: true,
            ..Default::default()
        },
    )
    .with_notices(Arc::new(Mutex::new(notices)));
    tokio::spawn(async move { destination.run_as_destination().await });

    let (mut send, _recv) = a.open_stream().await.unwrap();
    send.write_all(&[0x09, 19, 0, 80]).await.unwrap();

    let mut line = String::new();
    timeout(
        Duration::from_secs(5),
        BufReader::new(notices_recv).read_line(&mut line),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        line,
        "Error with port forwarding. A problem appeared when reading control informations about port forwarding.\n"
    );
}

#[tokio::test]
async fn pump_copies_and_half_closes() {
    *SETUP;

    let data = payload(100_000);
    let (mut client, server) = tokio::io::duplex(4096);
    let (out_write, mut out_read) = tokio::io::duplex(4096);

    let copier = tokio::spawn(pump(server, out_write, 1024));
    let reader = tokio::spawn(async move {
        let mut got = Vec::new();
        out_read.read_to_end(&mut got).await.unwrap();
        got
    });

    client.write_all(&data).await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(copier.await.unwrap().unwrap(), data.len() as u64);
    assert_eq!(reader.await.unwrap(), data);
}

#[test]
fn forward_only_mode() {
    let mut options = ClientOptions::default();
    assert_eq!(options.mode(), ServiceMode::RemoteLogin);

    options.local_forward = Some(ForwardSpec {
        local_port: 1,
        remote_port: 2,
        remote_ip: LOCALHOST,
    });
    assert_eq!(options.mode(), ServiceMode::Both);

    options.forward_only = true;
    assert_eq!(options.mode(), ServiceMode::PortForwarding);
}
