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
// Created Date: 2024/03/11 10:05:44

mod connect;

use std::{
    fmt::Display,
    future::Future,
    io,
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::broadcast::{self, error::RecvError},
};

pub use self::connect::connect_socks5;

use crate::{backend::BackendProcess, pool::InstancePool, socks5::TargetAddr, ProxyError, ProxyResult};

/// 等待实例时最多缓存的客户端数据
const MAX_PENDING: usize = 1024 * 1024;

/// 通过用户名选择实例的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyByNameMode {
    /// 用户名为实例名称
    Individual,
    /// 用户名为分组名称
    Group,
}

impl FromStr for ProxyByNameMode {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &*s.to_ascii_lowercase() {
            "individual" => Ok(ProxyByNameMode::Individual),
            "group" => Ok(ProxyByNameMode::Group),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown proxy by name mode {}", s),
            )),
        }
    }
}

impl Display for ProxyByNameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyByNameMode::Individual => f.write_str("individual"),
            ProxyByNameMode::Group => f.write_str("group"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyByName {
    pub mode: ProxyByNameMode,
    /// 无法识别的用户直接拒绝, 否则按匿名用户处理
    #[serde(default)]
    pub deny_unidentified_users: bool,
}

impl ProxyByName {
    pub fn new(mode: ProxyByNameMode, deny_unidentified_users: bool) -> Self {
        Self {
            mode,
            deny_unidentified_users,
        }
    }
}

/// 连接的来源协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Proto {
    #[serde(rename = "socks")]
    Socks,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "http-connect")]
    HttpConnect,
    #[serde(rename = "dns")]
    Dns,
}

impl Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proto::Socks => f.write_str("socks"),
            Proto::Http => f.write_str("http"),
            Proto::HttpConnect => f.write_str("http-connect"),
            Proto::Dns => f.write_str("dns"),
        }
    }
}

/// 每次将连接交给实例时产生的事件
#[derive(Clone)]
pub struct InstanceConnection {
    pub instance: Arc<BackendProcess>,
    pub source: SocketAddr,
    pub proto: Proto,
    pub by_name: bool,
}

/// 连接的处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Accepted,
    InstanceSelected,
    UpstreamConnecting,
    Relaying,
    Closed,
    /// 出错后不再推进, 释放时也保持该状态
    Error,
}

/// 记录单条连接的阶段, 释放时记为closed
pub struct Session {
    source: SocketAddr,
    proto: Proto,
    state: ConnectionState,
}

impl Session {
    pub fn new(source: SocketAddr, proto: Proto) -> Self {
        log::trace!("[{}] {} 已接收", proto, source);
        Self {
            source,
            proto,
            state: ConnectionState::Accepted,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_proto(&mut self, proto: Proto) {
        self.proto = proto;
    }

    pub fn fail(&mut self, err: &ProxyError) {
        log::debug!("[{}] {} {:?} 出错: {}", self.proto, self.source, self.state, err);
        self.state = ConnectionState::Error;
    }

    pub fn advance(&mut self, state: ConnectionState) {
        if state > self.state {
            log::trace!("[{}] {} {:?} -> {:?}", self.proto, self.source, self.state, state);
            self.state = state;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.advance(ConnectionState::Closed);
    }
}

enum Target {
    Named(Arc<BackendProcess>),
    Group(String),
    Default,
}

/// 连接路由, 为每个连接选择实例并转发数据
pub struct ConnectionRouter {
    pool: Arc<InstancePool>,
    proxy_by_name: Option<ProxyByName>,
    events: broadcast::Sender<InstanceConnection>,
}

impl ConnectionRouter {
    pub fn new(pool: Arc<InstancePool>, proxy_by_name: Option<ProxyByName>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            pool,
            proxy_by_name,
            events,
        })
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn proxy_by_name(&self) -> Option<&ProxyByName> {
        self.proxy_by_name.as_ref()
    }

    /// 是否需要客户端提供用户名
    pub fn wants_identity(&self) -> bool {
        self.proxy_by_name.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceConnection> {
        self.events.subscribe()
    }

    fn resolve(&self, identity: Option<&str>) -> ProxyResult<Target> {
        let config = match &self.proxy_by_name {
            Some(config) => config,
            None => return Ok(Target::Default),
        };
        let identity = identity.filter(|s| !s.is_empty());
        let target = match (identity, config.mode) {
            (Some(name), ProxyByNameMode::Individual) => {
                self.pool.find_by_name(name).map(Target::Named)
            }
            (Some(group), ProxyByNameMode::Group) => {
                if self.pool.instances_by_group(group).is_empty() {
                    None
                } else {
                    Some(Target::Group(group.to_string()))
                }
            }
            (None, _) => None,
        };
        match target {
            Some(target) => Ok(target),
            None if config.deny_unidentified_users => {
                log::info!("拒绝无法识别的用户: {:?}", identity);
                Err(ProxyError::VerifyFail)
            }
            None => Ok(Target::Default),
        }
    }

    /// 认证阶段用于提前拒绝
    pub fn accepts_identity(&self, identity: Option<&str>) -> bool {
        self.resolve(identity).is_ok()
    }

    /// 等待`fut`完成, 期间将客户端发来的数据按顺序缓存, 客户端断开则取消等待
    async fn wait_buffered<F, R, T>(
        fut: F,
        inbound: Option<&mut R>,
        pending: &mut BytesMut,
    ) -> ProxyResult<T>
    where
        F: Future<Output = ProxyResult<T>>,
        R: AsyncRead + Unpin,
    {
        tokio::pin!(fut);
        let inbound = match inbound {
            Some(inbound) => inbound,
            None => return fut.await,
        };
        loop {
            if pending.len() >= MAX_PENDING {
                return fut.await;
            }
            pending.reserve(4096);
            tokio::select! {
                r = &mut fut => return r,
                n = inbound.read_buf(pending) => {
                    match n {
                        Ok(0) => {
                            return Err(ProxyError::IoError(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "client closed while waiting for instance",
                            )))
                        }
                        Ok(_) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn wait_created(
        mut created: broadcast::Receiver<Arc<BackendProcess>>,
    ) -> ProxyResult<()> {
        match created.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => Ok(()),
            Err(RecvError::Closed) => Err(ProxyError::UpstreamUnavailable),
        }
    }

    /// 选择实例, 没有可用实例时等待新实例就绪后重试一次
    pub async fn select<R>(
        &self,
        identity: Option<&str>,
        inbound: Option<&mut R>,
        pending: &mut BytesMut,
    ) -> ProxyResult<(Arc<BackendProcess>, bool)>
    where
        R: AsyncRead + Unpin,
    {
        match self.resolve(identity)? {
            Target::Named(instance) => {
                if !instance.is_ready() {
                    log::debug!("实例{}未就绪, 等待中", instance.id());
                    let wait = async {
                        instance
                            .wait_ready()
                            .await
                            .map_err(|_| ProxyError::UpstreamUnavailable)
                    };
                    Self::wait_buffered(wait, inbound, pending).await?;
                }
                Ok((instance, true))
            }
            Target::Group(group) => Ok((self.pool.next_by_group(&group)?, true)),
            Target::Default => {
                // 先订阅再检查, 避免错过检查后就绪的实例
                let created = self.pool.subscribe_created();
                if let Some(instance) = self.pool.next() {
                    return Ok((instance, false));
                }
                log::debug!(
                    "当前没有可用实例, 等待实例就绪, 共{}个连接等待中",
                    self.pool.waiting_count()
                );
                Self::wait_buffered(Self::wait_created(created), inbound, pending).await?;
                self.pool
                    .next()
                    .map(|i| (i, false))
                    .ok_or(ProxyError::UpstreamUnavailable)
            }
        }
    }

    /// 选择实例并广播该次连接
    pub async fn route<R>(
        &self,
        source: SocketAddr,
        proto: Proto,
        identity: Option<&str>,
        inbound: Option<&mut R>,
        pending: &mut BytesMut,
    ) -> ProxyResult<Arc<BackendProcess>>
    where
        R: AsyncRead + Unpin,
    {
        let (instance, by_name) = self.select(identity, inbound, pending).await?;
        log::info!(
            "[{}] {} -> {}{}",
            proto,
            source,
            instance.name().unwrap_or_else(|| instance.id().to_string()),
            if by_name { " (by name)" } else { "" }
        );
        let _ = self.events.send(InstanceConnection {
            instance: instance.clone(),
            source,
            proto,
            by_name,
        });
        Ok(instance)
    }

    /// 通过实例的代理端口连接目标地址
    pub async fn open_upstream(
        &self,
        instance: &BackendProcess,
        target: &TargetAddr,
    ) -> ProxyResult<TcpStream> {
        if instance.is_exited() {
            return Err(ProxyError::UpstreamUnavailable);
        }
        match connect_socks5(instance.ports().proxy_addr(), target).await {
            Err(ProxyError::IoError(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(ProxyError::UpstreamUnavailable)
            }
            r => r,
        }
    }

    /// 先发送等待期间缓存的数据, 再双向转发直到任意一方关闭
    pub async fn relay<T>(
        inbound: &mut T,
        outbound: &mut TcpStream,
        pending: &[u8],
    ) -> ProxyResult<(u64, u64)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if !pending.is_empty() {
            outbound.write_all(pending).await?;
        }
        let (up, down) = copy_bidirectional(inbound, outbound).await?;
        Ok((up + pending.len() as u64, down))
    }
}
