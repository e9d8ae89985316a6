use std::{
    fmt::Display,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    router::{ConnectionRouter, ConnectionState, Proto, Session},
    ProxyError, ProxyResult,
};

pub const SOCK_CONNECT: u8 = 0x01u8;
pub const SOCK_BIND: u8 = 0x02u8;
pub const SOCK_UDP: u8 = 0x03u8;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

pub const SOCKS5_AUTH_NONE: u8 = 0x00;
pub const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
pub const SOCKS5_AUTH_UNACCEPTABLE: u8 = 0xFF;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// 请求的目标地址, 域名不在本地解析, 交给实例解析
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// 解析"host:port", ipv6需带中括号
    pub fn parse(host: &str, default_port: u16) -> ProxyResult<TargetAddr> {
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(TargetAddr::Ip(addr));
        }
        let (name, port) = if let Some(rest) = host.strip_prefix('[') {
            let (name, tail) = rest.split_once(']').ok_or(ProxyError::ProtErr)?;
            match tail.strip_prefix(':') {
                Some(port) => (name, port.parse::<u16>().map_err(|_| ProxyError::ProtErr)?),
                None if tail.is_empty() => (name, default_port),
                None => return Err(ProxyError::ProtErr),
            }
        } else {
            match host.split_once(':') {
                // 不带中括号的ipv6地址
                Some(_) if host.matches(':').count() > 1 => (host, default_port),
                Some((name, port)) => {
                    (name, port.parse::<u16>().map_err(|_| ProxyError::ProtErr)?)
                }
                None => (host, default_port),
            }
        };
        if name.is_empty() {
            return Err(ProxyError::ProtErr);
        }
        match name.parse::<IpAddr>() {
            Ok(ip) => Ok(TargetAddr::Ip(SocketAddr::new(ip, port))),
            Err(_) => Ok(TargetAddr::Domain(name.to_string(), port)),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// +------+----------+----------+
    /// | ATYP | DST.ADDR | DST.PORT |
    /// +------+----------+----------+
    /// |  1   | Variable |    2     |
    /// +------+----------+----------+
    /// 将地址转化成二进制流
    pub fn encode(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(sock)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&sock.ip().octets());
                buf.put_u16(sock.port());
            }
            TargetAddr::Ip(SocketAddr::V6(sock)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&sock.ip().octets());
                buf.put_u16(sock.port());
            }
            TargetAddr::Domain(name, port) => {
                if name.len() > 255 {
                    return Err(ProxyError::ProtErr);
                }
                buf.put_u8(SOCKS5_ADDR_TYPE_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

pub struct ProxySocks5 {
    router: Arc<ConnectionRouter>,
}

impl ProxySocks5 {
    pub fn new(router: Arc<ConnectionRouter>) -> Self {
        Self { router }
    }

    /// 读取客户端支持的认证方法, 并返回选择的方法
    ///
    /// 按名称选择实例时优先用户名密码认证, 否则优先无需认证
    pub async fn read_head_len<T>(&self, stream: &mut T, buffer: &mut BytesMut) -> ProxyResult<u8>
    where
        T: AsyncRead + Unpin,
    {
        Self::read_len(stream, buffer, 2).await?;
        if buffer.get_u8() != SOCKS5_VERSION {
            return Err(ProxyError::ProtErr);
        }
        let len = buffer.get_u8() as usize;
        Self::read_len(stream, buffer, len).await?;
        let methods = buffer.split_to(len);
        let has = |m: u8| methods.contains(&m);
        let verify = if self.router.wants_identity() && has(SOCKS5_AUTH_PASSWORD) {
            SOCKS5_AUTH_PASSWORD
        } else if has(SOCKS5_AUTH_NONE) {
            SOCKS5_AUTH_NONE
        } else if has(SOCKS5_AUTH_PASSWORD) {
            SOCKS5_AUTH_PASSWORD
        } else {
            SOCKS5_AUTH_UNACCEPTABLE
        };
        Ok(verify)
    }

    /// +----+------+----------+------+----------+
    /// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    /// +----+------+----------+------+----------+
    /// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    /// +----+------+----------+------+----------+
    /// 读取用户名, 密码不做校验
    pub async fn read_verify<T>(stream: &mut T, buffer: &mut BytesMut) -> ProxyResult<String>
    where
        T: AsyncRead + Unpin,
    {
        Self::read_len(stream, buffer, 2).await?;
        if buffer.get_u8() != 1 {
            return Err(ProxyError::ProtErr);
        }
        let user_len = buffer.get_u8() as usize;
        Self::read_len(stream, buffer, user_len + 1).await?;
        let username = String::from_utf8_lossy(&buffer.split_to(user_len)).to_string();
        let pass_len = buffer.get_u8() as usize;
        Self::read_len(stream, buffer, pass_len).await?;
        buffer.advance(pass_len);
        Ok(username)
    }

    /// 读取至少长度为size的大小的字节数, 如果足够则返回Ok(())
    pub async fn read_len<T>(stream: &mut T, buffer: &mut BytesMut, size: usize) -> ProxyResult<()>
    where
        T: AsyncRead + Unpin,
    {
        while buffer.len() < size {
            buffer.reserve(size - buffer.len());
            let n = stream.read_buf(buffer).await?;
            if n == 0 {
                return Err(ProxyError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "socks5 stream closed",
                )));
            }
        }
        Ok(())
    }

    /// +------+----------+----------+
    /// | ATYP | DST.ADDR | DST.PORT |
    /// +------+----------+----------+
    /// |  1   | Variable |    2     |
    /// +------+----------+----------+
    /// 读取通用地址格式，包含V4/V6/Doamin三种格式
    pub async fn read_addr<T>(stream: &mut T, buffer: &mut BytesMut) -> ProxyResult<TargetAddr>
    where
        T: AsyncRead + Unpin,
    {
        Self::read_len(stream, buffer, 1).await?;
        let atyp = buffer.get_u8();
        let addr = match atyp {
            SOCKS5_ADDR_TYPE_IPV4 => {
                Self::read_len(stream, buffer, 6).await?;
                let ip = Ipv4Addr::new(
                    buffer.get_u8(),
                    buffer.get_u8(),
                    buffer.get_u8(),
                    buffer.get_u8(),
                );
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), buffer.get_u16()))
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                Self::read_len(stream, buffer, 1).await?;
                let len = buffer.get_u8() as usize;
                Self::read_len(stream, buffer, len + 2).await?;
                let name = String::from_utf8_lossy(&buffer.split_to(len)).to_string();
                TargetAddr::Domain(name, buffer.get_u16())
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                Self::read_len(stream, buffer, 18).await?;
                let ip = Ipv6Addr::from(buffer.get_u128());
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), buffer.get_u16()))
            }
            _ => return Err(ProxyError::ProtErr),
        };
        Ok(addr)
    }

    /// +----+-----+-------+------+----------+----------+
    /// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    /// +----+-----+-------+------+----------+----------+
    /// | 1  |  1  | X'00' |  1   | Variable |    2     |
    /// +----+-----+-------+------+----------+----------+
    /// 解析request
    pub async fn tcp_read_request<T>(
        stream: &mut T,
        buffer: &mut BytesMut,
    ) -> ProxyResult<(u8, TargetAddr)>
    where
        T: AsyncRead + Unpin,
    {
        Self::read_len(stream, buffer, 3).await?;
        if buffer.get_u8() != SOCKS5_VERSION {
            return Err(ProxyError::ProtErr);
        }
        let cmd = buffer.get_u8();
        if buffer.get_u8() != 0 {
            return Err(ProxyError::ProtErr);
        }
        let addr = Self::read_addr(stream, buffer).await?;
        Ok((cmd, addr))
    }

    /// +----+-----+-------+------+----------+----------+
    /// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    /// +----+-----+-------+------+----------+----------+
    /// | 1  |  1  | X'00' |  1   | Variable |    2     |
    /// +----+-----+-------+------+----------+----------+
    /// https://datatracker.ietf.org/doc/html/rfc1928#section-6
    pub async fn tcp_write_reply<T>(stream: &mut T, rep: u8) -> ProxyResult<()>
    where
        T: AsyncWrite + Unpin,
    {
        stream
            .write_all(&[SOCKS5_VERSION, rep, 0x00, SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0])
            .await?;
        Ok(())
    }

    /// 错误对应的回复码
    pub fn reply_code(err: &ProxyError) -> u8 {
        match err {
            ProxyError::VerifyFail => REPLY_NOT_ALLOWED,
            ProxyError::ProtNoSupport => REPLY_COMMAND_NOT_SUPPORTED,
            ProxyError::UpstreamRefused(code) => *code,
            ProxyError::UpstreamUnavailable | ProxyError::IoError(_) => REPLY_CONNECTION_REFUSED,
            _ => REPLY_GENERAL_FAILURE,
        }
    }

    pub async fn process(&self, mut stream: TcpStream, source: SocketAddr) -> ProxyResult<()> {
        let mut session = Session::new(source, Proto::Socks);
        let mut buffer = BytesMut::with_capacity(512);
        let verify = self.read_head_len(&mut stream, &mut buffer).await?;
        stream.write_all(&[SOCKS5_VERSION, verify]).await?;
        if verify == SOCKS5_AUTH_UNACCEPTABLE {
            return Err(ProxyError::VerifyFail);
        }

        let mut identity = None;
        if verify == SOCKS5_AUTH_PASSWORD {
            let username = Self::read_verify(&mut stream, &mut buffer).await?;
            let name = Some(username.as_str()).filter(|_| self.router.wants_identity());
            if !self.router.accepts_identity(name) {
                stream.write_all(&[0x01_u8, 0x01]).await?;
                return Err(ProxyError::VerifyFail);
            }
            stream.write_all(&[0x01_u8, 0x00]).await?;
            identity = Some(username);
        }

        let (cmd, addr) = Self::tcp_read_request(&mut stream, &mut buffer).await?;
        if cmd != SOCK_CONNECT {
            // 不支持bind及udp指令
            log::debug!("[socks] {} 不支持的指令 {}", source, cmd);
            let code = if cmd == SOCK_BIND || cmd == SOCK_UDP {
                REPLY_COMMAND_NOT_SUPPORTED
            } else {
                REPLY_GENERAL_FAILURE
            };
            Self::tcp_write_reply(&mut stream, code).await?;
            return Err(ProxyError::ProtNoSupport);
        }

        let instance = match self
            .router
            .route(source, Proto::Socks, identity.as_deref(), Some(&mut stream), &mut buffer)
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                log::info!("[socks] {} 无法选择实例: {}", source, e);
                let _ = Self::tcp_write_reply(&mut stream, Self::reply_code(&e)).await;
                session.fail(&e);
                return Err(e);
            }
        };
        session.advance(ConnectionState::InstanceSelected);

        session.advance(ConnectionState::UpstreamConnecting);
        let mut outbound = match self.router.open_upstream(&instance, &addr).await {
            Ok(outbound) => outbound,
            Err(e) => {
                log::info!("[socks] {} 连接{}失败: {}", source, addr, e);
                Self::tcp_write_reply(&mut stream, Self::reply_code(&e)).await?;
                session.fail(&e);
                return Err(e);
            }
        };
        Self::tcp_write_reply(&mut stream, REPLY_SUCCEEDED).await?;

        session.advance(ConnectionState::Relaying);
        let (up, down) = ConnectionRouter::relay(&mut stream, &mut outbound, &buffer).await?;
        log::trace!("[socks] {} -> {} 完成, 上行{}字节 下行{}字节", source, addr, up, down);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target() {
        assert_eq!(
            TargetAddr::parse("example.com:8080", 80).unwrap(),
            TargetAddr::Domain("example.com".to_string(), 8080)
        );
        assert_eq!(
            TargetAddr::parse("example.com", 80).unwrap(),
            TargetAddr::Domain("example.com".to_string(), 80)
        );
        assert_eq!(
            TargetAddr::parse("1.2.3.4:443", 80).unwrap(),
            TargetAddr::Ip("1.2.3.4:443".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse("[::1]:22", 80).unwrap(),
            TargetAddr::Ip("[::1]:22".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse("[::1]", 80).unwrap(),
            TargetAddr::Ip("[::1]:80".parse().unwrap())
        );
        assert!(TargetAddr::parse("example.com:http", 80).is_err());
    }

    #[tokio::test]
    async fn read_domain_request() {
        let mut input: &[u8] = &[
            5, 1, 0, 3, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm', 0x01,
            0xbb, b'G', b'E', b'T',
        ];
        let mut buffer = BytesMut::new();
        let (cmd, addr) = ProxySocks5::tcp_read_request(&mut input, &mut buffer)
            .await
            .unwrap();
        assert_eq!(cmd, SOCK_CONNECT);
        assert_eq!(addr, TargetAddr::Domain("example.com".to_string(), 443));
        // 请求之后多读到的数据保留在buffer中, 不会丢失
        let mut rest = buffer.to_vec();
        rest.extend_from_slice(input);
        assert_eq!(&rest[..], b"GET");
    }

    #[test]
    fn encode_domain() {
        let mut buf = BytesMut::new();
        TargetAddr::Domain("a.io".to_string(), 80)
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[3, 4, b'a', b'.', b'i', b'o', 0, 80]);
    }
}
