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
// Created Date: 2024/03/07 09:12:55

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{ProxyError, ProxyResult};

/// 负责启动后端进程, 测试中可替换为模拟的实现
#[async_trait]
pub trait Launcher: Send + Sync {
    /// 生成控制端口密码的哈希, 写入配置中的HashedControlPassword
    async fn hash_secret(&self, secret: &str) -> ProxyResult<String>;

    /// 根据已生成的配置文件构造启动命令, 标准输入输出由调用方设置
    async fn command(&self, torrc: &Path) -> ProxyResult<Command>;
}

pub struct TorLauncher {
    tor_path: PathBuf,
}

impl TorLauncher {
    pub fn new<P: Into<PathBuf>>(tor_path: P) -> Self {
        Self {
            tor_path: tor_path.into(),
        }
    }

    pub fn tor_path(&self) -> &Path {
        &self.tor_path
    }
}

#[async_trait]
impl Launcher for TorLauncher {
    async fn hash_secret(&self, secret: &str) -> ProxyResult<String> {
        let output = Command::new(&self.tor_path)
            .arg("--quiet")
            .arg("--hash-password")
            .arg(secret)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProxyError::CreationError(format!(
                    "can't run {}: {}",
                    self.tor_path.display(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(ProxyError::CreationError(format!(
                "hash password failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // 旧版本会在前面输出日志, 取最后一个哈希行
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim())
            .filter(|l| l.starts_with("16:"))
            .last()
            .map(|l| l.to_string())
            .ok_or_else(|| ProxyError::CreationError("hash password has no output".to_string()))
    }

    async fn command(&self, torrc: &Path) -> ProxyResult<Command> {
        let mut command = Command::new(&self.tor_path);
        command.arg("-f").arg(torrc);
        Ok(command)
    }
}
