use std::{fmt::Write as _, io, net::SocketAddr, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    router::{ConnectionRouter, ConnectionState, Proto, Session},
    socks5::TargetAddr,
    ProxyError, ProxyResult,
};

/// 请求头最大长度
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// 转发给实例前去掉的逐跳头
const HOP_HEADERS: [&str; 5] = [
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
    "te",
];

/// 请求体的长度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
}

fn find_header<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| &v[..])
}

/// 逗号分隔的头部值中是否包含`token`
fn has_token(value: &[u8], token: &str) -> bool {
    std::str::from_utf8(value)
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

fn put_headers(buf: &mut BytesMut, headers: &[(String, Vec<u8>)]) {
    for (name, value) in headers {
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value);
        buf.put_slice(b"\r\n");
    }
}

/// 忽略大小写去掉前缀
fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|p| p.eq_ignore_ascii_case(prefix))
        .map(|_| &value[prefix.len()..])
}

/// 解析后的请求头, 不再借用读缓存
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    /// 客户端是否希望在响应后继续使用该连接
    pub fn keep_alive(&self) -> bool {
        let value = self
            .header("proxy-connection")
            .or_else(|| self.header("connection"));
        match value {
            Some(v) if has_token(v, "close") => false,
            Some(v) if has_token(v, "keep-alive") => true,
            _ => self.version >= 1,
        }
    }

    /// Proxy-Authorization: Basic中的用户名
    pub fn proxy_username(&self) -> Option<String> {
        let value = std::str::from_utf8(self.header("proxy-authorization")?).ok()?;
        let (scheme, token) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(token.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let user = match decoded.split_once(':') {
            Some((user, _)) => user,
            None => &decoded,
        };
        Some(user.to_string())
    }

    pub fn body_length(&self) -> ProxyResult<BodyLength> {
        if let Some(value) = self.header("transfer-encoding") {
            let value = std::str::from_utf8(value).map_err(|_| ProxyError::ProtErr)?;
            if value.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyLength::Chunked);
            }
            return Err(ProxyError::ProtNoSupport);
        }
        match self.header("content-length") {
            Some(value) => {
                let len = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or(ProxyError::ProtErr)?;
                Ok(if len == 0 {
                    BodyLength::Empty
                } else {
                    BodyLength::Fixed(len)
                })
            }
            None => Ok(BodyLength::Empty),
        }
    }

    /// 普通请求的目标地址及origin-form的路径
    pub fn forward_target(&self) -> ProxyResult<(TargetAddr, String)> {
        if let Some(rest) = strip_prefix_ignore_case(&self.target, "http://") {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            // 去掉userinfo部分
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            return Ok((TargetAddr::parse(authority, 80)?, path.to_string()));
        }
        if self.target.starts_with('/') {
            let host = self.header("host").ok_or(ProxyError::ProtErr)?;
            let host = std::str::from_utf8(host).map_err(|_| ProxyError::ProtErr)?;
            return Ok((TargetAddr::parse(host.trim(), 80)?, self.target.clone()));
        }
        Err(ProxyError::ProtNoSupport)
    }

    /// 生成转发给实例的请求头, 每个上游连接只承载一个请求
    pub fn encode_forward(&self, target: &TargetAddr, path: &str) -> BytesMut {
        let mut head = String::new();
        let _ = write!(head, "{} {} HTTP/1.{}\r\n", self.method, path, self.version);
        if self.header("host").is_none() {
            let _ = write!(head, "Host: {}\r\n", target);
        }
        let mut buf = BytesMut::with_capacity(head.len() + 512);
        buf.put_slice(head.as_bytes());
        put_headers(&mut buf, &self.headers);
        buf.put_slice(b"Connection: close\r\n\r\n");
        buf
    }
}

/// 上游返回的响应头
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ResponseHead {
    pub fn parse(buffer: &[u8]) -> ProxyResult<Option<(ResponseHead, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buffer) {
            Ok(httparse::Status::Complete(len)) => {
                let head = ResponseHead {
                    code: res.code.unwrap_or(502),
                    reason: res.reason.unwrap_or("").to_string(),
                    headers: res
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), h.value.to_vec()))
                        .collect(),
                };
                Ok(Some((head, len)))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(_) => Err(ProxyError::ProtErr),
        }
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    /// 响应体长度是否明确, 否则只能以关闭连接表示结束
    pub fn is_delimited(&self, method: &str) -> bool {
        if method.eq_ignore_ascii_case("HEAD") || self.code == 204 || self.code == 304 {
            return true;
        }
        if self.code < 200 {
            return false;
        }
        self.header("content-length").is_some()
            || self
                .header("transfer-encoding")
                .map(|v| has_token(v, "chunked"))
                .unwrap_or(false)
    }

    /// 返回给客户端的响应头, 连接是否保持由代理决定
    pub fn encode(&self, keep_alive: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.code, self.reason).as_bytes());
        put_headers(&mut buf, &self.headers);
        if keep_alive {
            buf.put_slice(b"Connection: keep-alive\r\n\r\n");
        } else {
            buf.put_slice(b"Connection: close\r\n\r\n");
        }
        buf
    }
}

pub struct ProxyHttp {
    router: Arc<ConnectionRouter>,
}

impl ProxyHttp {
    pub fn new(router: Arc<ConnectionRouter>) -> Self {
        Self { router }
    }

    /// 解析缓存中的请求头, 数据不足时返回None
    pub fn parse_head(buffer: &BytesMut) -> ProxyResult<Option<(RequestHead, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buffer) {
            Ok(httparse::Status::Complete(len)) => {
                let head = RequestHead {
                    method: req.method.unwrap_or("").to_string(),
                    target: req.path.unwrap_or("").to_string(),
                    version: req.version.unwrap_or(1),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), h.value.to_vec()))
                        .collect(),
                };
                Ok(Some((head, len)))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(_) => Err(ProxyError::ProtErr),
        }
    }

    /// 读取一个完整的请求头并从缓存中移除, 连接在请求之间关闭时返回None
    async fn read_head(
        stream: &mut TcpStream,
        buffer: &mut BytesMut,
    ) -> ProxyResult<Option<RequestHead>> {
        loop {
            if let Some((head, len)) = Self::parse_head(buffer)? {
                let _ = buffer.split_to(len);
                return Ok(Some(head));
            }
            if buffer.len() >= MAX_HEAD_SIZE {
                return Err(ProxyError::ProtErr);
            }
            buffer.reserve(4096);
            if stream.read_buf(buffer).await? == 0 {
                if buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Self::unexpected_eof());
            }
        }
    }

    fn unexpected_eof() -> ProxyError {
        ProxyError::IoError(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed in the middle of a request",
        ))
    }

    /// 读取一行, 包括结尾的换行
    async fn read_line(stream: &mut TcpStream, buffer: &mut BytesMut) -> ProxyResult<BytesMut> {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                return Ok(buffer.split_to(pos + 1));
            }
            if buffer.len() >= MAX_HEAD_SIZE {
                return Err(ProxyError::ProtErr);
            }
            buffer.reserve(4096);
            if stream.read_buf(buffer).await? == 0 {
                return Err(Self::unexpected_eof());
            }
        }
    }

    /// 先消耗缓存再从客户端读取, 共转发`left`字节
    async fn copy_exact(
        stream: &mut TcpStream,
        outbound: &mut TcpStream,
        buffer: &mut BytesMut,
        mut left: u64,
    ) -> ProxyResult<()> {
        while left > 0 {
            if buffer.is_empty() {
                buffer.reserve(4096);
                if stream.read_buf(buffer).await? == 0 {
                    return Err(Self::unexpected_eof());
                }
            }
            let n = buffer
                .len()
                .min(usize::try_from(left).unwrap_or(usize::MAX));
            let chunk = buffer.split_to(n);
            outbound.write_all(&chunk).await?;
            left -= n as u64;
        }
        Ok(())
    }

    /// 按请求头中的长度转发请求体, 缓存中剩余的数据属于下一个请求
    async fn forward_body(
        stream: &mut TcpStream,
        outbound: &mut TcpStream,
        buffer: &mut BytesMut,
        length: BodyLength,
    ) -> ProxyResult<()> {
        match length {
            BodyLength::Empty => Ok(()),
            BodyLength::Fixed(len) => Self::copy_exact(stream, outbound, buffer, len).await,
            BodyLength::Chunked => loop {
                let line = Self::read_line(stream, buffer).await?;
                outbound.write_all(&line).await?;
                let size = std::str::from_utf8(&line)
                    .ok()
                    .map(|l| l.split(';').next().unwrap_or_default().trim())
                    .and_then(|l| u64::from_str_radix(l, 16).ok())
                    .ok_or(ProxyError::ProtErr)?;
                if size == 0 {
                    // trailer部分以空行结束
                    loop {
                        let line = Self::read_line(stream, buffer).await?;
                        outbound.write_all(&line).await?;
                        if line.iter().all(|b| b.is_ascii_whitespace()) {
                            return Ok(());
                        }
                    }
                }
                // 数据后的CRLF
                let len = size.checked_add(2).ok_or(ProxyError::ProtErr)?;
                Self::copy_exact(stream, outbound, buffer, len).await?;
            },
        }
    }

    async fn write_status(stream: &mut TcpStream, code: u16, reason: &str, extra: &str) {
        let text = format!(
            "HTTP/1.1 {} {}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
            code, reason, extra
        );
        let _ = stream.write_all(text.as_bytes()).await;
    }

    async fn write_error(stream: &mut TcpStream, err: &ProxyError) {
        match err {
            ProxyError::VerifyFail => {
                Self::write_status(
                    stream,
                    407,
                    "Proxy Authentication Required",
                    "Proxy-Authenticate: Basic realm=\"tor-router\"\r\n",
                )
                .await
            }
            ProxyError::ProtErr | ProxyError::ProtNoSupport => {
                Self::write_status(stream, 400, "Bad Request", "").await
            }
            _ => Self::write_status(stream, 502, "Bad Gateway", "").await,
        }
    }

    /// 读取上游的响应头, 返回响应头及其后已读到的数据
    async fn read_response(outbound: &mut TcpStream) -> ProxyResult<(ResponseHead, BytesMut)> {
        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            if let Some((head, len)) = ResponseHead::parse(&buffer)? {
                let _ = buffer.split_to(len);
                return Ok((head, buffer));
            }
            if buffer.len() >= MAX_HEAD_SIZE {
                return Err(ProxyError::ProtErr);
            }
            buffer.reserve(4096);
            if outbound.read_buf(&mut buffer).await? == 0 {
                return Err(ProxyError::UpstreamUnavailable);
            }
        }
    }

    /// 普通请求逐个处理, 每个请求单独选择实例; 遇到CONNECT后转为隧道
    pub async fn process(&self, mut stream: TcpStream, source: SocketAddr) -> ProxyResult<()> {
        let mut buffer = BytesMut::with_capacity(4096);
        let mut served = 0usize;
        loop {
            let head = match Self::read_head(&mut stream, &mut buffer).await {
                Ok(Some(head)) => head,
                Ok(None) if served > 0 => return Ok(()),
                Ok(None) => return Err(ProxyError::Extension("empty")),
                Err(ProxyError::ProtErr) => {
                    Self::write_status(&mut stream, 400, "Bad Request", "").await;
                    return Err(ProxyError::ProtErr);
                }
                Err(e) => return Err(e),
            };
            log::trace!("[http] {} {} {}", source, head.method, head.target);
            if head.is_connect() {
                return self.process_connect(stream, source, head, buffer).await;
            }
            let keep_alive = self
                .forward_request(&mut stream, source, head, &mut buffer)
                .await?;
            served += 1;
            if !keep_alive {
                return Ok(());
            }
        }
    }

    async fn process_connect(
        &self,
        mut stream: TcpStream,
        source: SocketAddr,
        head: RequestHead,
        mut pending: BytesMut,
    ) -> ProxyResult<()> {
        let mut session = Session::new(source, Proto::HttpConnect);
        let target = match TargetAddr::parse(&head.target, 443) {
            Ok(target) => target,
            Err(e) => {
                Self::write_error(&mut stream, &e).await;
                session.fail(&e);
                return Err(e);
            }
        };
        let identity = head.proxy_username();
        let instance = match self
            .router
            .route(
                source,
                Proto::HttpConnect,
                identity.as_deref(),
                Some(&mut stream),
                &mut pending,
            )
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                log::info!("[http] {} 无法选择实例: {}", source, e);
                Self::write_error(&mut stream, &e).await;
                session.fail(&e);
                return Err(e);
            }
        };
        session.advance(ConnectionState::InstanceSelected);

        session.advance(ConnectionState::UpstreamConnecting);
        let mut outbound = match self.router.open_upstream(&instance, &target).await {
            Ok(outbound) => outbound,
            Err(e) => {
                log::info!("[http] {} 连接{}失败: {}", source, target, e);
                Self::write_error(&mut stream, &e).await;
                session.fail(&e);
                return Err(e);
            }
        };
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        session.advance(ConnectionState::Relaying);
        let (up, down) = ConnectionRouter::relay(&mut stream, &mut outbound, &pending).await?;
        log::trace!("[http-connect] {} -> {} 完成, 上行{}字节 下行{}字节", source, target, up, down);
        Ok(())
    }

    /// 转发一个普通请求, 上游以Connection: close返回, 读到结束即为完整响应
    ///
    /// 返回客户端连接能否继续处理下一个请求
    async fn forward_request(
        &self,
        stream: &mut TcpStream,
        source: SocketAddr,
        head: RequestHead,
        buffer: &mut BytesMut,
    ) -> ProxyResult<bool> {
        let mut session = Session::new(source, Proto::Http);
        let prepared = head
            .forward_target()
            .and_then(|(target, path)| Ok((target, path, head.body_length()?)));
        let (target, path, length) = match prepared {
            Ok(v) => v,
            Err(e) => {
                Self::write_error(stream, &e).await;
                session.fail(&e);
                return Err(e);
            }
        };
        let identity = head.proxy_username();

        let instance = match self
            .router
            .route(
                source,
                Proto::Http,
                identity.as_deref(),
                Some(&mut *stream),
                buffer,
            )
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                log::info!("[http] {} 无法选择实例: {}", source, e);
                Self::write_error(stream, &e).await;
                session.fail(&e);
                return Err(e);
            }
        };
        session.advance(ConnectionState::InstanceSelected);

        session.advance(ConnectionState::UpstreamConnecting);
        let mut outbound = match self.router.open_upstream(&instance, &target).await {
            Ok(outbound) => outbound,
            Err(e) => {
                log::info!("[http] {} 连接{}失败: {}", source, target, e);
                Self::write_error(stream, &e).await;
                session.fail(&e);
                return Err(e);
            }
        };

        session.advance(ConnectionState::Relaying);
        outbound
            .write_all(&head.encode_forward(&target, &path))
            .await?;
        if let Err(e) = Self::forward_body(stream, &mut outbound, buffer, length).await {
            session.fail(&e);
            return Err(e);
        }
        let (response, rest) = match Self::read_response(&mut outbound).await {
            Ok(v) => v,
            Err(e) => {
                log::info!("[http] {} 读取{}的响应失败: {}", source, target, e);
                Self::write_status(stream, 502, "Bad Gateway", "").await;
                session.fail(&e);
                return Err(e);
            }
        };
        let keep_alive = head.keep_alive() && response.is_delimited(&head.method);
        stream.write_all(&response.encode(keep_alive)).await?;
        stream.write_all(&rest).await?;
        let down = tokio::io::copy(&mut outbound, stream).await? + rest.len() as u64;
        log::trace!(
            "[http] {} {} {} {} 完成, 下行{}字节",
            source,
            head.method,
            target,
            response.code,
            down
        );
        Ok(keep_alive)
    }
}
