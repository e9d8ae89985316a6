use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    socks5::{
        TargetAddr, SOCK_CONNECT, SOCKS5_ADDR_TYPE_DOMAIN, SOCKS5_ADDR_TYPE_IPV4,
        SOCKS5_ADDR_TYPE_IPV6, SOCKS5_VERSION,
    },
    ProxyError, ProxyResult,
};

/// 作为socks5客户端连接实例的代理端口, 由实例解析域名
///
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
pub async fn connect_socks5(proxy: SocketAddr, target: &TargetAddr) -> ProxyResult<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.set_nodelay(true)?;
    stream.write_all(&[SOCKS5_VERSION, 1, 0x00]).await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [SOCKS5_VERSION, 0x00] {
        return Err(ProxyError::ProtErr);
    }

    let mut request = BytesMut::with_capacity(300);
    request.put_slice(&[SOCKS5_VERSION, SOCK_CONNECT, 0x00]);
    target.encode(&mut request)?;
    stream.write_all(&request).await?;

    // 回复后可能紧跟着目标发来的数据, 这里只按长度精确读取
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(ProxyError::ProtErr);
    }
    if head[1] != 0 {
        return Err(ProxyError::UpstreamRefused(head[1]));
    }
    let len = match head[3] {
        SOCKS5_ADDR_TYPE_IPV4 => 4 + 2,
        SOCKS5_ADDR_TYPE_IPV6 => 16 + 2,
        SOCKS5_ADDR_TYPE_DOMAIN => stream.read_u8().await? as usize + 2,
        _ => return Err(ProxyError::ProtErr),
    };
    let mut bind = vec![0u8; len];
    stream.read_exact(&mut bind).await?;
    Ok(stream)
}
