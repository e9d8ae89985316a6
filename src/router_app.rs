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
// Created Date: 2024/03/14 09:50:21

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::mpsc::{channel, Receiver, Sender},
    task::JoinHandle,
};

use crate::{
    backend::{Launcher, TorLauncher},
    pool::InstancePool,
    router::ConnectionRouter,
    ConfigOption, ControlServer, Helper, ProxyDns, ProxyHttp, ProxyResult, ProxySocks5,
};

/// 整个服务的运行时, 负责监听端口及实例池的生命周期
pub struct TorRouter {
    option: ConfigOption,
    pool: Arc<InstancePool>,
    router: Arc<ConnectionRouter>,
    pub socks_listener: Option<TcpListener>,
    pub http_listener: Option<TcpListener>,
    pub dns_socket: Option<Arc<UdpSocket>>,
    pub control_listener: Option<TcpListener>,
}

impl TorRouter {
    pub fn new(option: ConfigOption) -> TorRouter {
        let launcher = Arc::new(TorLauncher::new(option.tor_path.clone()));
        Self::with_launcher(option, launcher)
    }

    pub fn with_launcher(option: ConfigOption, launcher: Arc<dyn Launcher>) -> TorRouter {
        let pool = InstancePool::new(
            launcher,
            option.data_directory(),
            option.tor_config.clone(),
            option.load_balance_method,
        );
        let router = ConnectionRouter::new(pool.clone(), option.proxy_by_name.clone());
        Self {
            option,
            pool,
            router,
            socks_listener: None,
            http_listener: None,
            dns_socket: None,
            control_listener: None,
        }
    }

    pub fn option(&self) -> &ConfigOption {
        &self.option
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    /// 绑定所有配置的端口, 绑定失败直接返回错误
    pub async fn ready_serve(&mut self) -> ProxyResult<()> {
        if let Some(addr) = self.option.socks_port {
            let listener = Helper::bind(addr.0).await?;
            log::info!("[socks] 监听 {}", listener.local_addr()?);
            self.socks_listener = Some(listener);
        }
        if let Some(addr) = self.option.http_port {
            let listener = Helper::bind(addr.0).await?;
            log::info!("[http] 监听 {}", listener.local_addr()?);
            self.http_listener = Some(listener);
        }
        if let Some(addr) = self.option.dns_port {
            let socket = Helper::bind_udp(addr.0).await?;
            log::info!("[dns] 监听 {}", socket.local_addr()?);
            self.dns_socket = Some(Arc::new(socket));
        }
        if let Some(addr) = self.option.control_addr() {
            let listener = Helper::bind(addr).await?;
            log::info!("[control] 监听 {}", listener.local_addr()?);
            self.control_listener = Some(listener);
        }
        Ok(())
    }

    /// 后台创建启动时配置的实例, 不阻塞端口的监听
    pub fn start_instances(&self) -> Option<JoinHandle<()>> {
        let definitions = self.option.definitions();
        if definitions.is_empty() {
            return None;
        }
        let pool = self.pool.clone();
        Some(tokio::spawn(async move {
            let count = definitions.len();
            log::info!("正在启动{}个实例", count);
            match pool.create(definitions).await {
                Ok(list) => log::info!("{}个实例已就绪", list.len()),
                Err(e) => log::error!("启动实例失败: {}", e),
            }
        }))
    }

    pub async fn run_serve(&mut self, mut receiver_close: Receiver<()>) -> ProxyResult<()> {
        async fn tcp_listen_work(listen: &Option<TcpListener>) -> Option<(TcpStream, SocketAddr)> {
            if let Some(listen) = listen {
                match listen.accept().await {
                    Ok((tcp, addr)) => Some((tcp, addr)),
                    Err(e) => {
                        log::warn!("接收连接失败: {}", e);
                        None
                    }
                }
            } else {
                let pend = std::future::pending();
                let () = pend.await;
                None
            }
        }

        let mut dns_task = None;
        if let Some(socket) = self.dns_socket.clone() {
            let dns = Arc::new(ProxyDns::new(self.router.clone(), self.option.dns_timeout.0));
            dns_task = Some(tokio::spawn(dns.serve(socket)));
        }

        let mut control_close: Option<Sender<()>> = None;
        if let Some(listener) = self.control_listener.take() {
            let (sender, receiver) = channel::<()>(1);
            let server = Arc::new(ControlServer::new(self.pool.clone()));
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener, receiver).await {
                    log::warn!("[control] 管理接口退出: {}", e);
                }
            });
            control_close = Some(sender);
        }

        let instances_task = self.start_instances();
        let socks5 = Arc::new(ProxySocks5::new(self.router.clone()));
        let http = Arc::new(ProxyHttp::new(self.router.clone()));

        loop {
            tokio::select! {
                Some((inbound, addr)) = tcp_listen_work(&self.socks_listener) => {
                    let socks5 = socks5.clone();
                    tokio::spawn(async move {
                        let _ = inbound.set_nodelay(true);
                        if let Err(e) = socks5.process(inbound, addr).await {
                            log::debug!("[socks] {} 连接结束: {}", addr, e);
                        }
                    });
                }
                Some((inbound, addr)) = tcp_listen_work(&self.http_listener) => {
                    let http = http.clone();
                    tokio::spawn(async move {
                        let _ = inbound.set_nodelay(true);
                        if let Err(e) = http.process(inbound, addr).await {
                            log::debug!("[http] {} 连接结束: {}", addr, e);
                        }
                    });
                }
                _ = receiver_close.recv() => {
                    log::info!("收到关闭信号, 正在退出");
                    break;
                }
            }
        }

        if let Some(task) = instances_task {
            task.abort();
        }
        if let Some(task) = dns_task {
            task.abort();
        }
        if let Some(sender) = control_close {
            let _ = sender.send(()).await;
        }
        self.pool.exit().await;
        // 未指定父目录时为本进程的临时目录
        if self.option.parent_data_directory.is_none() {
            match tokio::fs::remove_dir_all(self.pool.parent_data_directory()).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("删除数据目录失败: {}", e),
            }
        }
        Ok(())
    }
}
