mod common;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use common::{FakeLauncher, ECHO_HOST, FAKE_DNS_ANSWER};
use hickory_proto::{
    op::{Message, Query, ResponseCode},
    rr::{rdata::A, Name, RData, RecordType},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::mpsc::{channel, Sender},
};
use tor_router::{
    ConfigOption, ConnectionRouter, InstanceDefinition, InstancePool, Proto, ProxyByName,
    ProxyByNameMode, TorRouter,
};

struct Harness {
    socks: SocketAddr,
    http: SocketAddr,
    dns: SocketAddr,
    pool: Arc<InstancePool>,
    router: Arc<ConnectionRouter>,
    close: Sender<()>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(definitions: Vec<InstanceDefinition>, by_name: Option<ProxyByName>) -> Harness {
        common::init_log();
        let dir = tempfile::tempdir().unwrap();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let count = definitions.len();
        let option = ConfigOption::builder()
            .socks_port(any)
            .http_port(any)
            .dns_port(any)
            .control_port(None)
            .definitions(definitions)
            .parent_data_directory(dir.path())
            .proxy_by_name(by_name)
            .dns_timeout(Duration::from_secs(2))
            .into_value()
            .unwrap();
        let mut app = TorRouter::with_launcher(option, FakeLauncher::new());
        app.ready_serve().await.unwrap();
        let socks = app.socks_listener.as_ref().unwrap().local_addr().unwrap();
        let http = app.http_listener.as_ref().unwrap().local_addr().unwrap();
        let dns = app.dns_socket.as_ref().unwrap().local_addr().unwrap();
        let pool = app.pool().clone();
        let router = app.router().clone();
        let (close, receiver) = channel(1);
        tokio::spawn(async move {
            let _ = app.run_serve(receiver).await;
        });

        for _ in 0..200 {
            if pool.len() == count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(pool.len(), count);
        Harness {
            socks,
            http,
            dns,
            pool,
            router,
            close,
            _dir: dir,
        }
    }

    async fn stop(self) {
        let _ = self.close.send(()).await;
        for _ in 0..200 {
            if self.pool.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn connect_request(host: &str, port: u16) -> Vec<u8> {
    let mut req = vec![5, 1, 0, 3, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    req
}

/// 完成socks5握手, 返回连接及认证结果
async fn socks_handshake(addr: SocketAddr, user: Option<&str>) -> (TcpStream, bool) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    match user {
        Some(_) => stream.write_all(&[5, 2, 0, 2]).await.unwrap(),
        None => stream.write_all(&[5, 1, 0]).await.unwrap(),
    }
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method[0], 5);
    if method[1] == 2 {
        let user = user.unwrap_or_default();
        let mut auth = vec![1, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.extend_from_slice(&[1, b'x']);
        stream.write_all(&auth).await.unwrap();
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.unwrap();
        return (stream, status[1] == 0);
    }
    (stream, method[1] == 0)
}

async fn read_reply(stream: &mut TcpStream) -> u8 {
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    reply[1]
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut data = vec![];
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        data.push(byte[0]);
    }
    String::from_utf8_lossy(&data).to_string()
}

#[tokio::test]
async fn socks_by_name_routes_to_named_instance() {
    let harness = Harness::start(
        vec![
            InstanceDefinition::named("alpha"),
            InstanceDefinition::named("beta"),
        ],
        Some(ProxyByName::new(ProxyByNameMode::Individual, false)),
    )
    .await;
    let mut events = harness.router.subscribe();

    for _ in 0..3 {
        let (mut stream, ok) = socks_handshake(harness.socks, Some("beta")).await;
        assert!(ok);
        stream.write_all(&connect_request(ECHO_HOST, 7)).await.unwrap();
        assert_eq!(read_reply(&mut stream).await, 0);
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let event = events.recv().await.unwrap();
        assert!(event.by_name);
        assert_eq!(event.proto, Proto::Socks);
        assert_eq!(event.instance.name().as_deref(), Some("beta"));
    }

    // 未知用户按匿名处理
    let (mut stream, ok) = socks_handshake(harness.socks, Some("nobody")).await;
    assert!(ok);
    stream.write_all(&connect_request(ECHO_HOST, 7)).await.unwrap();
    assert_eq!(read_reply(&mut stream).await, 0);
    let event = events.recv().await.unwrap();
    assert!(!event.by_name);
    harness.stop().await;
}

#[tokio::test]
async fn socks_denies_unidentified_users() {
    let harness = Harness::start(
        vec![InstanceDefinition::named("alpha").with_group("eu")],
        Some(ProxyByName::new(ProxyByNameMode::Group, true)),
    )
    .await;

    let (_stream, ok) = socks_handshake(harness.socks, Some("us")).await;
    assert!(!ok);

    let (mut stream, ok) = socks_handshake(harness.socks, Some("eu")).await;
    assert!(ok);
    stream.write_all(&connect_request(ECHO_HOST, 7)).await.unwrap();
    assert_eq!(read_reply(&mut stream).await, 0);

    // 不提供用户名同样拒绝
    let (mut stream, ok) = socks_handshake(harness.socks, None).await;
    assert!(ok);
    stream.write_all(&connect_request(ECHO_HOST, 7)).await.unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x02);
    harness.stop().await;
}

#[tokio::test]
async fn deferred_connection_served_after_first_instance() {
    let harness = Harness::start(vec![], None).await;
    let (mut stream, ok) = socks_handshake(harness.socks, None).await;
    assert!(ok);
    // 实例还不存在时就发出请求及数据
    let mut req = connect_request(ECHO_HOST, 7);
    req.extend_from_slice(b"early");
    stream.write_all(&req).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let pool = harness.pool.clone();
    tokio::spawn(async move {
        pool.create_count(1).await.unwrap();
    });

    let reply = tokio::time::timeout(Duration::from_secs(10), read_reply(&mut stream))
        .await
        .unwrap();
    assert_eq!(reply, 0);
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"early");
    harness.stop().await;
}

#[tokio::test]
async fn deferred_connection_dropped_when_client_leaves() {
    let harness = Harness::start(vec![], None).await;
    let mut events = harness.router.subscribe();
    let (mut stream, ok) = socks_handshake(harness.socks, None).await;
    assert!(ok);
    stream.write_all(&connect_request(ECHO_HOST, 7)).await.unwrap();

    let waiting = |count: usize| {
        let pool = harness.pool.clone();
        async move {
            for _ in 0..200 {
                if pool.waiting_count() == count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("waiting count never reached {}", count);
        }
    };
    waiting(1).await;
    drop(stream);
    waiting(0).await;

    harness.pool.create_count(1).await.unwrap();
    let event = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(event.is_err(), "closed connection was routed");
    harness.stop().await;
}

#[tokio::test]
async fn socks_rejects_bind_command() {
    let harness = Harness::start(vec![InstanceDefinition::new()], None).await;
    let (mut stream, ok) = socks_handshake(harness.socks, None).await;
    assert!(ok);
    stream
        .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x07);
    harness.stop().await;
}

#[tokio::test]
async fn http_connect_and_forward() {
    let harness = Harness::start(vec![InstanceDefinition::named("one")], None).await;

    let mut stream = TcpStream::connect(harness.http).await.unwrap();
    stream
        .write_all(format!("CONNECT {ECHO_HOST}:443 HTTP/1.1\r\nHost: {ECHO_HOST}:443\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    stream.write_all(b"tunnel").await.unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel");

    // 普通请求转成origin-form发往目标
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let served = tokio::spawn(async move {
        let (mut conn, _) = origin.accept().await.unwrap();
        let head = read_head(&mut conn).await;
        conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        head
    });
    let mut stream = TcpStream::connect(harness.http).await.unwrap();
    stream
        .write_all(
            format!(
                "GET http://{origin_addr}/path?q=1 HTTP/1.1\r\nHost: {origin_addr}\r\nProxy-Connection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = vec![];
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with("ok"));

    let head = served.await.unwrap();
    assert!(head.starts_with("GET /path?q=1 HTTP/1.1\r\n"), "{}", head);
    assert!(head.contains("Connection: close\r\n"));
    assert!(!head.contains("Proxy-Connection"));
    harness.stop().await;
}

#[tokio::test]
async fn http_pipelined_requests_each_rewritten() {
    let harness = Harness::start(vec![InstanceDefinition::named("one")], None).await;
    let mut events = harness.router.subscribe();

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let served = tokio::spawn(async move {
        let mut heads = vec![];
        for body in ["first", "second"] {
            let (mut conn, _) = origin.accept().await.unwrap();
            let head = read_head(&mut conn).await;
            if head.starts_with("POST") {
                let mut data = [0u8; 3];
                conn.read_exact(&mut data).await.unwrap();
                assert_eq!(&data, b"abc");
            }
            conn.write_all(
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            heads.push(head);
        }
        heads
    });

    // "alpha:pw"
    let auth = "Proxy-Authorization: Basic YWxwaGE6cHc=\r\n";
    let mut stream = TcpStream::connect(harness.http).await.unwrap();
    stream
        .write_all(
            format!(
                "POST http://{origin_addr}/one HTTP/1.1\r\nHost: {origin_addr}\r\n{auth}Content-Length: 3\r\n\r\nabc\
                 GET http://{origin_addr}/two HTTP/1.1\r\nHost: {origin_addr}\r\n{auth}Proxy-Connection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = vec![];
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("Connection: keep-alive\r\n\r\nfirst"), "{}", response);
    assert!(response.ends_with("Connection: close\r\n\r\nsecond"), "{}", response);

    let heads = served.await.unwrap();
    assert!(heads[0].starts_with("POST /one HTTP/1.1\r\n"), "{}", heads[0]);
    assert!(heads[1].starts_with("GET /two HTTP/1.1\r\n"), "{}", heads[1]);
    for head in &heads {
        assert!(!head.contains("Proxy-Authorization"), "{}", head);
        assert!(!head.contains("http://"), "{}", head);
    }
    for _ in 0..2 {
        assert_eq!(events.recv().await.unwrap().proto, Proto::Http);
    }
    harness.stop().await;
}

#[tokio::test]
async fn http_requires_credentials_when_denying() {
    let harness = Harness::start(
        vec![InstanceDefinition::named("alpha")],
        Some(ProxyByName::new(ProxyByNameMode::Individual, true)),
    )
    .await;
    let mut stream = TcpStream::connect(harness.http).await.unwrap();
    stream
        .write_all(b"CONNECT echo.test:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
    assert!(head.contains("Proxy-Authenticate: Basic"));

    let mut stream = TcpStream::connect(harness.http).await.unwrap();
    // "alpha:pw"
    stream
        .write_all(b"CONNECT echo.test:443 HTTP/1.1\r\nProxy-Authorization: Basic YWxwaGE6cHc=\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    harness.stop().await;
}

#[tokio::test]
async fn dns_query_through_instance() {
    let harness = Harness::start(vec![InstanceDefinition::new()], None).await;
    let mut events = harness.router.subscribe();

    let mut query = Message::new();
    query
        .set_id(4242)
        .set_recursion_desired(true)
        .add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&query.to_vec().unwrap(), harness.dns)
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Message::from_vec(&buf[..n]).unwrap();
    assert_eq!(response.id(), 4242);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].data(), Some(&RData::A(A(FAKE_DNS_ANSWER))));

    let event = events.recv().await.unwrap();
    assert_eq!(event.proto, Proto::Dns);
    assert!(!event.by_name);
    harness.stop().await;
}
