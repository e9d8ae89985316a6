// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/03/07 10:40:26

use std::{
    collections::HashSet,
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::{Mutex, OnceLock},
};

use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};
use rand::{distributions::Alphanumeric, Rng};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::{ConfigOption, ProxyError, ProxyResult};

static LOG4RS_HANDLE: OnceLock<log4rs::Handle> = OnceLock::new();

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {m}{n}";

pub struct Helper;

impl Helper {
    #[cfg(not(target_os = "windows"))]
    fn set_reuse_port(socket: &Socket, reuse: bool) -> io::Result<()> {
        socket.set_reuse_port(reuse)?;
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn set_reuse_port(_socket: &Socket, _reuse: bool) -> io::Result<()> {
        Ok(())
    }

    fn domain_of(addr: &SocketAddr) -> Domain {
        if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        }
    }

    /// 可端口复用的绑定方式, 重启时不会因TIME_WAIT而绑定失败
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            let socket = Socket::new(Self::domain_of(&addr), Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            socket.set_reuse_address(true)?;
            Self::set_reuse_port(&socket, true)?;
            socket.bind(&addr.into())?;
            match socket.listen(128) {
                Ok(_) => {
                    let listener: std::net::TcpListener = socket.into();
                    return TcpListener::from_std(listener);
                }
                Err(e) => {
                    log::info!("绑定端口地址失败，原因： {:?}", addr);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    pub async fn bind_udp<A: ToSocketAddrs>(addr: A) -> io::Result<UdpSocket> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            let socket = Socket::new(Self::domain_of(&addr), Type::DGRAM, None)?;
            socket.set_nonblocking(true)?;
            socket.set_reuse_address(true)?;
            match socket.bind(&addr.into()) {
                Ok(_) => {
                    let socket: std::net::UdpSocket = socket.into();
                    return UdpSocket::from_std(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    /// 向系统申请一个空闲的本地端口, 申请后立即释放
    pub fn free_port(udp: bool) -> io::Result<u16> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        if udp {
            Ok(std::net::UdpSocket::bind(addr)?.local_addr()?.port())
        } else {
            Ok(std::net::TcpListener::bind(addr)?.local_addr()?.port())
        }
    }

    /// 随机生成url安全的标识
    pub fn random_id(len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    pub fn try_init_log(option: &ConfigOption) -> ProxyResult<()> {
        let mut log_config = log4rs::config::Config::builder();
        let mut root = Root::builder();
        if let Some(path) = &option.log_file {
            let appender = FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                .build(path)?;
            log_config = log_config.appender(Appender::builder().build("file", Box::new(appender)));
            root = root.appender("file");
        }

        if !option.disable_stdout {
            let stdout = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                .build();
            log_config = log_config.appender(Appender::builder().build("stdout", Box::new(stdout)));
            root = root.appender("stdout");
        }

        let log_config = log_config
            .build(root.build(option.log_level))
            .map_err(|e| ProxyError::ConfigError(format!("log: {}", e)))?;
        if let Some(handle) = LOG4RS_HANDLE.get() {
            handle.set_config(log_config);
        } else {
            let handle = log4rs::init_config(log_config)
                .map_err(|e| ProxyError::ConfigError(format!("log: {}", e)))?;
            let _ = LOG4RS_HANDLE.set(handle);
        }
        Ok(())
    }
}

/// 已分配给实例的端口, 保证同一进程内不会重复分配
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

const PORT_RETRY: usize = 32;

static PORT_ALLOCATOR: OnceLock<PortAllocator> = OnceLock::new();

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程内共享, 多个实例池之间也不会分到相同的端口
    pub fn global() -> &'static PortAllocator {
        PORT_ALLOCATOR.get_or_init(PortAllocator::new)
    }

    /// 申请`count`个互不相同的端口, udp表示该位置的端口需要udp可用
    pub fn allocate(&self, kinds: &[bool]) -> ProxyResult<Vec<u16>> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| ProxyError::extension("port allocator poisoned"))?;
        let mut ports = Vec::with_capacity(kinds.len());
        for udp in kinds {
            let mut found = None;
            for _ in 0..PORT_RETRY {
                let port = Helper::free_port(*udp)?;
                if !reserved.contains(&port) && !ports.contains(&port) {
                    found = Some(port);
                    break;
                }
            }
            match found {
                Some(port) => ports.push(port),
                None => return Err(ProxyError::PortExhausted),
            }
        }
        reserved.extend(ports.iter().copied());
        Ok(ports)
    }

    pub fn release(&self, ports: &[u16]) {
        if let Ok(mut reserved) = self.reserved.lock() {
            for p in ports {
                reserved.remove(p);
            }
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .map(|r| r.contains(&port))
            .unwrap_or(false)
    }
}
