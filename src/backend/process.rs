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
// Created Date: 2024/03/07 14:22:40

use std::{
    fmt::Write as _,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::Child,
    sync::{broadcast, oneshot, watch},
};

use super::{
    control::{ControlReply, TorControl},
    launcher::Launcher,
    state::{BackendState, Lifecycle, Marker, OutputMatcher, Severity},
};
use crate::{
    pool::{InstanceDefinition, TorConfig},
    Helper, ProxyError, ProxyResult,
};

/// 控制端口未能立即连上时的重试
const CONTROL_CONNECT_RETRY: usize = 20;
const CONTROL_CONNECT_INTERVAL: Duration = Duration::from_millis(100);
/// 通过控制端口请求关闭后等待进程退出的时间
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// 由配置生成, 不允许通过实例配置覆盖的项
const RESERVED_KEYS: [&str; 5] = [
    "SocksPort",
    "DNSPort",
    "ControlPort",
    "DataDirectory",
    "HashedControlPassword",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendPorts {
    pub proxy_port: u16,
    pub dns_port: u16,
    pub control_port: u16,
}

impl BackendPorts {
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.proxy_port))
    }

    pub fn dns_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.dns_port))
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.control_port))
    }

    pub fn as_vec(&self) -> Vec<u16> {
        vec![self.proxy_port, self.dns_port, self.control_port]
    }
}

/// 进程运行中产生的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    ControlListening,
    ControllerReady,
    ProxyListening,
    DnsListening,
    Ready,
    Error(String),
    Exited,
}

/// 查询接口返回的实例信息
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub name: Option<String>,
    pub group: Vec<String>,
    pub weight: u32,
    pub socks_port: u16,
    pub dns_port: u16,
    pub control_port: u16,
    pub state: BackendState,
    pub error: Option<String>,
}

/// 进程退出后, 状态变为exited之前执行
type ExitHook = Box<dyn FnOnce(&BackendProcess) + Send>;

pub struct BackendProcess {
    id: String,
    definition: RwLock<InstanceDefinition>,
    ports: BackendPorts,
    secret: String,
    data_directory: PathBuf,
    lifecycle: watch::Sender<Lifecycle>,
    events: broadcast::Sender<BackendEvent>,
    control: tokio::sync::Mutex<Option<TorControl>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    /// 已执行过时为None
    exit_hooks: Mutex<Option<Vec<ExitHook>>>,
}

impl BackendProcess {
    /// 启动进程, 返回时进程已存在, 就绪需等待`wait_ready`
    pub async fn create(
        launcher: &dyn Launcher,
        definition: InstanceDefinition,
        default_config: &TorConfig,
        parent_data_directory: &Path,
        ports: BackendPorts,
    ) -> ProxyResult<Arc<BackendProcess>> {
        let id = Helper::random_id(21);
        let secret = {
            let mut bytes = [0u8; 128];
            rand::thread_rng().fill_bytes(&mut bytes);
            STANDARD.encode(bytes)
        };
        let anonymous = definition.name().is_none();
        let dir_name = definition.name().unwrap_or(id.as_str()).to_string();
        let data_directory = parent_data_directory.join(dir_name);
        tokio::fs::create_dir_all(&data_directory).await?;

        let spawned = async {
            let hashed = launcher.hash_secret(&secret).await?;
            let config = definition.merged_config(default_config);
            let torrc = data_directory.join("torrc");
            tokio::fs::write(
                &torrc,
                Self::render_config(&config, &ports, &data_directory, &hashed),
            )
            .await?;

            let mut command = launcher.command(&torrc).await?;
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            command
                .spawn()
                .map_err(|e| ProxyError::CreationError(format!("spawn failed: {}", e)))
        }
        .await;
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if anonymous {
                    let _ = tokio::fs::remove_dir_all(&data_directory).await;
                }
                return Err(e);
            }
        };

        let (lifecycle, _) = watch::channel(Lifecycle::new());
        let (events, _) = broadcast::channel(16);
        let (kill_sender, kill_receiver) = oneshot::channel();
        let process = Arc::new(BackendProcess {
            id,
            definition: RwLock::new(definition),
            ports,
            secret,
            data_directory,
            lifecycle,
            events,
            control: tokio::sync::Mutex::new(None),
            kill: Mutex::new(Some(kill_sender)),
            exit_hooks: Mutex::new(Some(vec![])),
        });
        log::info!(
            "[{}] 启动进程 pid={:?} socks={} dns={} control={}",
            process.tag(),
            child.id(),
            ports.proxy_port,
            ports.dns_port,
            ports.control_port
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::watch_stdout(process.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::watch_stderr(process.clone(), stderr));
        }
        tokio::spawn(Self::watch_exit(process.clone(), child, kill_receiver));
        Ok(process)
    }

    /// 生成配置文件内容, 每行"Key Value"
    pub fn render_config(
        config: &TorConfig,
        ports: &BackendPorts,
        data_directory: &Path,
        hashed_password: &str,
    ) -> String {
        let mut text = String::new();
        let mut has_log = false;
        for (key, value) in config {
            if RESERVED_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
                continue;
            }
            if key.eq_ignore_ascii_case("Log") {
                has_log = true;
            }
            // 配置值不允许换行, 否则会注入额外的配置
            let value = value.replace(['\r', '\n'], " ");
            let _ = writeln!(text, "{} {}", key, value);
        }
        // 就绪状态依赖标准输出中的日志
        if !has_log {
            let _ = writeln!(text, "Log notice stdout");
        }
        let _ = writeln!(text, "SocksPort {}", ports.proxy_addr());
        let _ = writeln!(text, "DNSPort {}", ports.dns_addr());
        let _ = writeln!(text, "ControlPort {}", ports.control_addr());
        let _ = writeln!(text, "DataDirectory {}", data_directory.display());
        let _ = writeln!(text, "HashedControlPassword {}", hashed_password);
        text
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<String> {
        self.definition().name().map(|s| s.to_string())
    }

    /// 日志中的前缀
    fn tag(&self) -> String {
        format!("tor-{}", self.name().unwrap_or_else(|| self.id.clone()))
    }

    pub fn definition(&self) -> InstanceDefinition {
        match self.definition.read() {
            Ok(d) => d.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update_definition<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&mut InstanceDefinition) -> R,
    {
        match self.definition.write() {
            Ok(mut d) => func(&mut d),
            Err(poisoned) => func(&mut poisoned.into_inner()),
        }
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.definition().in_group(group)
    }

    pub fn weight(&self) -> u32 {
        self.definition().weight()
    }

    pub fn ports(&self) -> BackendPorts {
        self.ports
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }

    pub fn state(&self) -> BackendState {
        self.lifecycle.borrow().state()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.borrow().is_ready()
    }

    pub fn is_exited(&self) -> bool {
        self.lifecycle.borrow().is_exited()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    pub fn watch_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn info(&self) -> BackendInfo {
        let definition = self.definition();
        let lifecycle = self.lifecycle();
        BackendInfo {
            id: self.id.clone(),
            name: definition.name().map(|s| s.to_string()),
            weight: definition.weight(),
            group: definition.group,
            socks_port: self.ports.proxy_port,
            dns_port: self.ports.dns_port,
            control_port: self.ports.control_port,
            state: lifecycle.state(),
            error: lifecycle.error().map(|s| s.to_string()),
        }
    }

    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    /// 等待进入ready, 就绪前出错或者退出均返回错误
    pub async fn wait_ready(&self) -> ProxyResult<()> {
        let mut receiver = self.lifecycle.subscribe();
        loop {
            {
                let life = receiver.borrow_and_update();
                if life.is_ready() {
                    return Ok(());
                }
                if life.is_exited() {
                    return Err(ProxyError::CreationError(format!(
                        "{} exited before ready",
                        self.tag()
                    )));
                }
                if let Some(err) = life.error() {
                    return Err(ProxyError::CreationError(format!("{}: {}", self.tag(), err)));
                }
            }
            if receiver.changed().await.is_err() {
                return Err(ProxyError::CreationError(format!("{} dropped", self.tag())));
            }
        }
    }

    /// 注册退出回调, 进程已退出时立即执行
    pub fn on_exit<F>(&self, func: F)
    where
        F: FnOnce(&BackendProcess) + Send + 'static,
    {
        let mut hooks = match self.exit_hooks.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        match hooks.as_mut() {
            Some(list) => list.push(Box::new(func)),
            None => {
                drop(hooks);
                func(self);
            }
        }
    }

    /// 进程是否已经结束, 此时状态可能还未变为exited
    pub fn is_exiting(&self) -> bool {
        match self.exit_hooks.lock() {
            Ok(h) => h.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    fn run_exit_hooks(&self) {
        let hooks = match self.exit_hooks.lock() {
            Ok(mut h) => h.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        for hook in hooks.into_iter().flatten() {
            hook(self);
        }
    }

    /// 等待进程真正退出
    pub async fn wait_exit(&self) {
        let mut receiver = self.lifecycle.subscribe();
        let _ = receiver.wait_for(|life| life.is_exited()).await;
    }

    /// 结束进程并等待其退出, 可重复调用
    pub async fn exit(&self) {
        let kill = match self.kill.lock() {
            Ok(mut k) => k.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(kill) = kill {
            log::debug!("[{}] 正在关闭进程", self.tag());
            let _ = kill.send(());
        }
        self.wait_exit().await;
    }

    async fn watch_stdout<R>(process: Arc<BackendProcess>, stdout: R)
    where
        R: AsyncRead + Unpin,
    {
        let matcher = OutputMatcher::tor();
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = matcher.classify(&line);
            match line.severity {
                Severity::Err => {
                    log::error!("[{}] {}", process.tag(), line.body);
                    process.raise(line.body.clone());
                }
                Severity::Warn => log::warn!("[{}] {}", process.tag(), line.body),
                Severity::Notice => log::debug!("[{}] {}", process.tag(), line.body),
                _ => log::trace!("[{}] {}", process.tag(), line.body),
            }
            match line.marker {
                Some(Marker::ControlListener) => {
                    let mut first = false;
                    process.lifecycle.send_if_modified(|life| {
                        first = life.on_control_listening();
                        first
                    });
                    if first {
                        process.emit(BackendEvent::ControlListening);
                        tokio::spawn(Self::connect_controller(process.clone()));
                    }
                }
                Some(Marker::ProxyListener) => {
                    process.lifecycle.send_modify(|life| life.on_proxy_listening());
                    process.emit(BackendEvent::ProxyListening);
                }
                Some(Marker::DnsListener) => {
                    process.lifecycle.send_modify(|life| life.on_dns_listening());
                    process.emit(BackendEvent::DnsListening);
                }
                Some(Marker::Bootstrapped) => {
                    let mut ready = false;
                    process.lifecycle.send_modify(|life| ready = life.on_bootstrapped());
                    if ready {
                        process.on_ready();
                    }
                }
                None => {}
            }
        }
    }

    async fn watch_stderr<R>(process: Arc<BackendProcess>, mut stderr: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 4096];
        while let Ok(n) = stderr.read(&mut buf).await {
            if n == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
            if text.is_empty() {
                continue;
            }
            log::error!("[{}] stderr: {}", process.tag(), text);
            process.raise(text);
        }
    }

    fn raise(&self, error: String) {
        self.lifecycle.send_modify(|life| life.raise(error.clone()));
        self.emit(BackendEvent::Error(error));
    }

    fn on_ready(&self) {
        log::info!("[{}] 已就绪", self.tag());
        self.emit(BackendEvent::Ready);
    }

    async fn connect_controller(process: Arc<BackendProcess>) {
        let addr = process.ports.control_addr();
        let mut last_err = None;
        for _ in 0..CONTROL_CONNECT_RETRY {
            if process.is_exited() {
                return;
            }
            match TorControl::connect(addr).await {
                Ok(mut control) => {
                    if let Err(e) = control.authenticate(&process.secret).await {
                        log::error!("[{}] 控制端口认证失败: {}", process.tag(), e);
                        process.raise(format!("control authenticate failed: {}", e));
                        return;
                    }
                    *process.control.lock().await = Some(control);
                    let mut ready = false;
                    process.lifecycle.send_modify(|life| ready = life.on_authenticated());
                    log::debug!("[{}] 控制端口认证成功", process.tag());
                    process.emit(BackendEvent::ControllerReady);
                    if ready {
                        process.on_ready();
                    }
                    return;
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(CONTROL_CONNECT_INTERVAL).await;
                }
            }
        }
        let err = last_err.map(|e| e.to_string()).unwrap_or_default();
        log::error!("[{}] 无法连接控制端口 {}: {}", process.tag(), addr, err);
        process.raise(format!("control connect failed: {}", err));
    }

    async fn watch_exit(
        process: Arc<BackendProcess>,
        mut child: Child,
        kill: oneshot::Receiver<()>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill => Self::shutdown(&process, &mut child).await,
        };
        match &status {
            Ok(s) => log::info!("[{}] 进程已退出: {}", process.tag(), s),
            Err(e) => log::warn!("[{}] 等待进程退出失败: {}", process.tag(), e),
        }
        process.run_exit_hooks();
        // 未命名的实例数据目录为临时目录
        if process.definition().name().is_none() {
            if let Err(e) = tokio::fs::remove_dir_all(&process.data_directory).await {
                log::warn!(
                    "[{}] 删除数据目录{}失败: {}",
                    process.tag(),
                    process.data_directory.display(),
                    e
                );
            }
        }
        process.lifecycle.send_modify(|life| {
            life.on_exit();
        });
        process.emit(BackendEvent::Exited);
    }

    /// 先通过控制端口请求关闭, 无法请求或者超时后强制结束
    async fn shutdown(process: &BackendProcess, child: &mut Child) -> io::Result<ExitStatus> {
        if process.request_shutdown().await {
            match tokio::time::timeout(SHUTDOWN_WAIT, child.wait()).await {
                Ok(status) => return status,
                Err(_) => log::warn!("[{}] 等待进程关闭超时, 强制结束", process.tag()),
            }
        }
        let _ = child.kill().await;
        child.wait().await
    }

    /// 控制连接正被占用时不等待
    async fn request_shutdown(&self) -> bool {
        let mut guard = match self.control.try_lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let mut control = match guard.take() {
            Some(control) => control,
            None => return false,
        };
        log::debug!("[{}] 请求进程关闭", self.tag());
        let command = TorControl::signal_command("SHUTDOWN");
        // 进程关闭时可能来不及回复, 只要没有超时就认为已经送达
        tokio::time::timeout(SHUTDOWN_REQUEST_TIMEOUT, control.request(&command))
            .await
            .is_ok()
    }

    /// 发送控制命令, 进程退出时立即返回错误
    async fn control_request(&self, command: String) -> ProxyResult<ControlReply> {
        let mut exited = self.lifecycle.subscribe();
        if exited.borrow().is_exited() {
            return Err(ProxyError::ControllerNotConnected);
        }
        let mut guard = self.control.lock().await;
        let control = guard.as_mut().ok_or(ProxyError::ControllerNotConnected)?;
        tokio::select! {
            reply = control.request(&command) => reply,
            _ = exited.wait_for(|life| life.is_exited()) => Err(ProxyError::ControllerNotConnected),
        }
    }

    pub async fn get_config(&self, key: &str) -> ProxyResult<Vec<String>> {
        let reply = self
            .control_request(TorControl::getconf_command(key))
            .await?;
        Ok(reply.conf_values(key))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> ProxyResult<()> {
        self.control_request(TorControl::setconf_command(key, value))
            .await?;
        Ok(())
    }

    pub async fn signal(&self, signal: &str) -> ProxyResult<()> {
        self.control_request(TorControl::signal_command(signal))
            .await?;
        Ok(())
    }

    pub async fn new_identity(&self) -> ProxyResult<()> {
        log::info!("[{}] 请求新的身份", self.tag());
        self.control_request(TorControl::new_identity_command())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_keeps_generated_keys() {
        let mut config = TorConfig::new();
        config.insert("NewCircuitPeriod".to_string(), "10".to_string());
        config.insert("SocksPort".to_string(), "9050".to_string());
        config.insert("ExitNodes".to_string(), "{us}\nControlPort 1".to_string());
        let ports = BackendPorts {
            proxy_port: 1001,
            dns_port: 1002,
            control_port: 1003,
        };
        let text =
            BackendProcess::render_config(&config, &ports, Path::new("/tmp/a"), "16:ABCD");
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"NewCircuitPeriod 10"));
        assert!(lines.contains(&"Log notice stdout"));
        assert!(lines.contains(&"SocksPort 127.0.0.1:1001"));
        assert!(lines.contains(&"DNSPort 127.0.0.1:1002"));
        assert!(lines.contains(&"ControlPort 127.0.0.1:1003"));
        assert!(lines.contains(&"HashedControlPassword 16:ABCD"));
        assert!(lines.contains(&"ExitNodes {us} ControlPort 1"));
        assert!(!lines.contains(&"SocksPort 9050"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("ControlPort")).count(), 1);
    }
}
