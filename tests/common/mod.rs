#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType},
    rr::{rdata::A, RData, Record},
};
use tokio::{
    io::{copy_bidirectional, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, UdpSocket},
    process::Command,
};
use tor_router::{Launcher, ProxyResult};

/// 返回给DNS请求的固定地址
pub const FAKE_DNS_ANSWER: Ipv4Addr = Ipv4Addr::new(10, 9, 8, 7);
/// 模拟的出口对该域名做回显
pub const ECHO_HOST: &str = "echo.test";
/// 实例配置中带有该项时输出[err]且不会就绪
pub const FAIL_WITH_ERR: &str = "FakeFail";
/// 实例配置中带有该项时向stderr输出且不会就绪
pub const FAIL_WITH_STDERR: &str = "FakeStderr";
/// 控制端口收到该信号时不回复
pub const HANG_SIGNAL: &str = "HANG";
/// 脚本进程号写入数据目录中的该文件
pub const PID_FILE: &str = "fake.pid";

/// 绕过实例直接结束脚本进程
pub fn kill_process(data_directory: &Path) {
    let pid = std::fs::read_to_string(data_directory.join(PID_FILE)).unwrap();
    let status = std::process::Command::new("kill")
        .arg("-KILL")
        .arg(pid.trim())
        .status()
        .unwrap();
    assert!(status.success());
}

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct FakeState {
    /// 按控制端口记录SETCONF的值
    pub config: HashMap<u16, HashMap<String, String>>,
    /// 按控制端口记录收到的SIGNAL
    pub signals: Vec<(u16, String)>,
}

/// 用sh脚本模拟tor的输出, 控制端口/socks/dns均在测试进程内模拟
#[derive(Clone, Default)]
pub struct FakeLauncher {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<FakeLauncher> {
        Arc::new(FakeLauncher::default())
    }

    pub fn signals(&self, control_port: u16) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .signals
            .iter()
            .filter(|(p, _)| *p == control_port)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

fn addr_of(torrc: &str, key: &str) -> SocketAddr {
    torrc
        .lines()
        .find_map(|l| l.strip_prefix(key).map(|v| v.trim().to_string()))
        .unwrap()
        .parse()
        .unwrap()
}

fn unquote(value: &str) -> String {
    value
        .trim()
        .trim_matches('"')
        .replace("\\\"", "\"")
        .replace("\\\\", "\\")
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn hash_secret(&self, _secret: &str) -> ProxyResult<String> {
        Ok("16:FAKE".to_string())
    }

    async fn command(&self, torrc: &Path) -> ProxyResult<Command> {
        let text = tokio::fs::read_to_string(torrc).await?;
        let socks = addr_of(&text, "SocksPort ");
        let dns = addr_of(&text, "DNSPort ");
        let control = addr_of(&text, "ControlPort ");

        let mut config = HashMap::new();
        for line in text.lines() {
            if let Some((k, v)) = line.split_once(' ') {
                config.insert(k.to_string(), v.to_string());
            }
        }
        self.state
            .lock()
            .unwrap()
            .config
            .insert(control.port(), config);

        let control_listener = TcpListener::bind(control).await?;
        let socks_listener = TcpListener::bind(socks).await?;
        let dns_socket = UdpSocket::bind(dns).await?;
        let pid_file = torrc.parent().unwrap().join(PID_FILE);
        tokio::spawn(fake_control(
            control_listener,
            self.state.clone(),
            pid_file.clone(),
        ));
        tokio::spawn(fake_socks(socks_listener));
        tokio::spawn(fake_dns(dns_socket));

        let has_key = |key: &str| text.lines().any(|l| l.starts_with(&format!("{} ", key)));
        let pid_file = pid_file.display();
        let script = if has_key(FAIL_WITH_ERR) {
            format!(
                "echo $$ > '{pid_file}'; \
                 echo 'Mar 11 10:00:00.000 [notice] Tor 0.4.8 running on Linux.'; \
                 echo 'Mar 11 10:00:00.000 [err] Reading config failed--see warnings above.'; \
                 exec sleep 3600"
            )
        } else if has_key(FAIL_WITH_STDERR) {
            format!("echo $$ > '{pid_file}'; echo 'cannot open torrc' 1>&2; exec sleep 3600")
        } else {
            format!(
            "echo $$ > '{pid_file}'; \
             echo 'Mar 11 10:00:00.000 [notice] Tor 0.4.8 running on Linux.'; \
             echo 'Mar 11 10:00:00.000 [notice] Opening Socks listener on {socks}'; \
             echo 'Mar 11 10:00:00.000 [notice] Opened Socks listener connection (ready) on {socks}'; \
             echo 'Mar 11 10:00:00.000 [notice] Opening DNS listener on {dns}'; \
             echo 'Mar 11 10:00:00.000 [notice] Opening Control listener on {control}'; \
             echo 'Mar 11 10:00:00.000 [notice] Opened Control listener connection (ready) on {control}'; \
             echo 'Mar 11 10:00:01.000 [notice] Bootstrapped 100% (done): Done'; \
             exec sleep 3600"
            )
        };
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        Ok(command)
    }
}

async fn fake_control(listener: TcpListener, state: Arc<Mutex<FakeState>>, pid_file: PathBuf) {
    let port = listener.local_addr().unwrap().port();
    while let Ok((stream, _)) = listener.accept().await {
        let state = state.clone();
        let pid_file = pid_file.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = if line.starts_with("AUTHENTICATE ") {
                    "250 OK".to_string()
                } else if let Some(key) = line.strip_prefix("GETCONF ") {
                    let state = state.lock().unwrap();
                    match state.config.get(&port).and_then(|c| c.get(key)) {
                        Some(value) => format!("250 {}={}", key, value),
                        None => format!("250 {}", key),
                    }
                } else if let Some(rest) = line.strip_prefix("SETCONF ") {
                    match rest.split_once('=') {
                        Some((k, v)) => {
                            let mut state = state.lock().unwrap();
                            state
                                .config
                                .entry(port)
                                .or_default()
                                .insert(k.to_string(), unquote(v));
                            "250 OK".to_string()
                        }
                        None => "552 Unrecognized option".to_string(),
                    }
                } else if let Some(signal) = line.strip_prefix("SIGNAL ") {
                    state.lock().unwrap().signals.push((port, signal.to_string()));
                    if signal == HANG_SIGNAL {
                        continue;
                    }
                    if signal == "SHUTDOWN" {
                        if let Ok(pid) = tokio::fs::read_to_string(&pid_file).await {
                            let _ = Command::new("kill")
                                .arg("-TERM")
                                .arg(pid.trim())
                                .status()
                                .await;
                        }
                    }
                    "250 OK".to_string()
                } else {
                    format!("510 Unrecognized command \"{}\"", line)
                };
                if writer
                    .write_all(format!("{}\r\n", reply).as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

async fn fake_socks(listener: TcpListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let _ = fake_socks_conn(stream).await;
        });
    }
}

async fn fake_socks_conn(mut stream: TcpStream) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[5, 0]).await?;

    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    let target = match req[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            format!("{}:{}", Ipv4Addr::from(ip), port)
        }
        3 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            format!("{}:{}", String::from_utf8_lossy(&name), port)
        }
        _ => {
            stream.write_all(&[5, 8, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
            return Ok(());
        }
    };

    if target.starts_with(ECHO_HOST) {
        stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        let (mut reader, mut writer) = stream.split();
        tokio::io::copy(&mut reader, &mut writer).await?;
        return Ok(());
    }
    match TcpStream::connect(&target).await {
        Ok(mut outbound) => {
            stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
            copy_bidirectional(&mut stream, &mut outbound).await?;
        }
        Err(_) => {
            stream.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        }
    }
    Ok(())
}

async fn fake_dns(socket: UdpSocket) {
    let mut buf = vec![0u8; 4096];
    while let Ok((n, source)) = socket.recv_from(&mut buf).await {
        let request = match Message::from_vec(&buf[..n]) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .add_queries(request.queries().to_vec());
        for query in request.queries() {
            response.add_answer(Record::from_rdata(
                query.name().clone(),
                60,
                RData::A(A(FAKE_DNS_ANSWER)),
            ));
        }
        if let Ok(data) = response.to_vec() {
            let _ = socket.send_to(&data, source).await;
        }
    }
}
