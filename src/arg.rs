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
// Created Date: 2024/01/16 10:59:37

use std::{
    fmt::Display,
    fs::File,
    io::Read,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use bpaf::*;
use log::LevelFilter;

use crate::{
    option::InstancesOption,
    pool::LoadBalanceMethod,
    router::{ProxyByName, ProxyByNameMode},
    ConfigOption, ProxyError, ProxyResult,
};

/// 监听地址, 支持":9050", "9050"及完整的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapAddr(pub SocketAddr);

impl FromStr for WrapAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with(':') {
            let addr = format!("127.0.0.1{s}").parse::<SocketAddr>()?;
            Ok(WrapAddr(addr))
        } else if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            let addr = format!("127.0.0.1:{s}").parse::<SocketAddr>()?;
            Ok(WrapAddr(addr))
        } else {
            let addr = s.parse::<SocketAddr>()?;
            Ok(WrapAddr(addr))
        }
    }
}

impl Display for WrapAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// 命令行参数, 每个参数同时可以从环境变量读取
#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version)]
pub struct RouterArgs {
    /// 配置文件路径, 支持yaml/toml/json
    #[bpaf(short('f'), long("config"), env("TOR_ROUTER_CONFIG"), argument("PATH"))]
    pub config: Option<String>,
    /// 启动时创建的实例数量
    #[bpaf(short('j'), long("instances"), env("TOR_ROUTER_INSTANCES"), argument("NUM"))]
    pub instances: Option<usize>,
    /// SOCKS5代理监听地址, 如 :9050
    #[bpaf(short('s'), long("socks-port"), env("TOR_ROUTER_SOCKS_PORT"), argument("ADDR"))]
    pub socks_port: Option<WrapAddr>,
    /// DNS监听地址, 如 :9053
    #[bpaf(short('d'), long("dns-port"), env("TOR_ROUTER_DNS_PORT"), argument("ADDR"))]
    pub dns_port: Option<WrapAddr>,
    /// HTTP代理监听地址, 如 :9080
    #[bpaf(short('H'), long("http-port"), env("TOR_ROUTER_HTTP_PORT"), argument("ADDR"))]
    pub http_port: Option<WrapAddr>,
    /// 管理接口监听地址, 默认 :9077
    #[bpaf(short('c'), long("control-port"), env("TOR_ROUTER_CONTROL_PORT"), argument("ADDR"))]
    pub control_port: Option<WrapAddr>,
    /// 日志等级 error|warn|info|debug|trace|off
    #[bpaf(short('l'), long("log-level"), env("TOR_ROUTER_LOG_LEVEL"), argument("LEVEL"))]
    pub log_level: Option<LevelFilter>,
    /// 日志文件路径
    #[bpaf(long("log-file"), env("TOR_ROUTER_LOG_FILE"), argument("PATH"))]
    pub log_file: Option<String>,
    /// 实例数据目录的父目录
    #[bpaf(
        short('p'),
        long("parent-data-directory"),
        env("TOR_ROUTER_PARENT_DATA_DIRECTORY"),
        argument("DIR")
    )]
    pub parent_data_directory: Option<PathBuf>,
    /// 负载均衡方式 round_robin|weighted
    #[bpaf(
        short('b'),
        long("load-balance-method"),
        env("TOR_ROUTER_LOAD_BALANCE_METHOD"),
        argument("METHOD")
    )]
    pub load_balance_method: Option<LoadBalanceMethod>,
    /// tor可执行文件路径
    #[bpaf(short('t'), long("tor-path"), env("TOR_ROUTER_TOR_PATH"), argument("PATH"))]
    pub tor_path: Option<String>,
    /// 通过用户名选择实例 individual|group
    #[bpaf(long("proxy-by-name"), env("TOR_ROUTER_PROXY_BY_NAME"), argument("MODE"))]
    pub proxy_by_name: Option<ProxyByNameMode>,
    /// 拒绝无法识别的用户
    #[bpaf(long("deny-unidentified-users"), env("TOR_ROUTER_DENY_UNIDENTIFIED_USERS"))]
    pub deny_unidentified_users: bool,
    /// 禁用默认输出
    #[bpaf(long("disable-stdout"), env("TOR_ROUTER_DISABLE_STDOUT"))]
    pub disable_stdout: bool,
    /// 禁用管理接口
    #[bpaf(long("disable-control"), env("TOR_ROUTER_DISABLE_CONTROL"))]
    pub disable_control: bool,
}

impl RouterArgs {
    /// 命令行优先于配置文件, 配置文件优先于默认值
    pub fn into_option(self) -> ProxyResult<ConfigOption> {
        let mut option = match &self.config {
            Some(path) => read_config_from_path(path)?,
            None => ConfigOption::default(),
        };
        if let Some(count) = self.instances {
            option.instances = InstancesOption::Count(count);
        }
        if self.socks_port.is_some() {
            option.socks_port = self.socks_port;
        }
        if self.dns_port.is_some() {
            option.dns_port = self.dns_port;
        }
        if self.http_port.is_some() {
            option.http_port = self.http_port;
        }
        if self.control_port.is_some() {
            option.control_port = self.control_port;
        }
        if let Some(level) = self.log_level {
            option.log_level = level;
        }
        if self.log_file.is_some() {
            option.log_file = self.log_file;
        }
        if self.parent_data_directory.is_some() {
            option.parent_data_directory = self.parent_data_directory;
        }
        if let Some(method) = self.load_balance_method {
            option.load_balance_method = method;
        }
        if let Some(path) = self.tor_path {
            option.tor_path = path;
        }
        if let Some(mode) = self.proxy_by_name {
            option.proxy_by_name = Some(ProxyByName::new(mode, self.deny_unidentified_users));
        } else if let Some(by_name) = option.proxy_by_name.as_mut() {
            by_name.deny_unidentified_users |= self.deny_unidentified_users;
        }
        option.disable_stdout |= self.disable_stdout;
        option.disable_control |= self.disable_control;
        option.after_load_option()?;
        Ok(option)
    }
}

pub fn read_config_from_path(path: &str) -> ProxyResult<ConfigOption> {
    let path = PathBuf::from(path);
    let mut file = File::open(&path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let option = match &*extension {
        "yaml" | "yml" => serde_yaml::from_str::<ConfigOption>(&contents)?,
        "toml" => toml::from_str::<ConfigOption>(&contents)?,
        "json" => serde_json::from_str::<ConfigOption>(&contents)?,
        _ => {
            return Err(ProxyError::ConfigError(format!(
                "unknow config format {}",
                path.display()
            )))
        }
    };
    Ok(option)
}

pub fn parse_env() -> ProxyResult<ConfigOption> {
    router_args().run().into_option()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_addr_forms() {
        assert_eq!(
            ":9050".parse::<WrapAddr>().unwrap().0,
            "127.0.0.1:9050".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            "9053".parse::<WrapAddr>().unwrap().0,
            "127.0.0.1:9053".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            "0.0.0.0:80".parse::<WrapAddr>().unwrap().0,
            "0.0.0.0:80".parse::<SocketAddr>().unwrap()
        );
        assert!("localhost".parse::<WrapAddr>().is_err());
    }

    #[test]
    fn cli_overrides() {
        let args = router_args()
            .run_inner(&[
                "-j",
                "3",
                "-s",
                ":9050",
                "-H",
                "9080",
                "-b",
                "weighted",
                "--proxy-by-name",
                "group",
                "--deny-unidentified-users",
            ])
            .unwrap();
        let option = args.into_option().unwrap();
        assert!(matches!(option.instances, InstancesOption::Count(3)));
        assert_eq!(option.socks_port.unwrap().0.port(), 9050);
        assert_eq!(option.http_port.unwrap().0.port(), 9080);
        assert!(option.dns_port.is_none());
        assert_eq!(option.control_port.unwrap().0.port(), 9077);
        assert_eq!(option.load_balance_method, LoadBalanceMethod::Weighted);
        assert_eq!(
            option.proxy_by_name,
            Some(ProxyByName::new(ProxyByNameMode::Group, true))
        );
    }

    #[test]
    fn read_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.yaml");
        std::fs::write(
            &path,
            "socks_port: 9050\ninstances:\n  - Name: a\n    Group: g\n  - Name: b\n    Weight: 2\ndns_timeout: 2s\nlog_level: debug\n",
        )
        .unwrap();
        let option = read_config_from_path(&path.to_string_lossy()).unwrap();
        assert_eq!(option.socks_port.unwrap().0.port(), 9050);
        assert_eq!(option.definitions().len(), 2);
        assert_eq!(option.definitions()[1].weight(), 2);
        assert_eq!(option.dns_timeout.0, std::time::Duration::from_secs(2));
        assert_eq!(option.log_level, LevelFilter::Debug);

        let path = dir.path().join("router.ini");
        std::fs::write(&path, "").unwrap();
        assert!(read_config_from_path(&path.to_string_lossy()).is_err());
    }
}
