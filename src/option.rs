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
// Created Date: 2023/09/25 10:42:02

use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    config::{ConfigDuration, DisplayFromStrOrNumber},
    pool::{InstanceDefinition, LoadBalanceMethod, TorConfig},
    router::ProxyByName,
    ProxyError, ProxyResult, WrapAddr,
};

/// 启动时创建的实例, 可以是数量或者实例定义的列表
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstancesOption {
    Count(usize),
    List(Vec<InstanceDefinition>),
}

impl Default for InstancesOption {
    fn default() -> Self {
        InstancesOption::Count(0)
    }
}

impl InstancesOption {
    pub fn definitions(&self) -> Vec<InstanceDefinition> {
        match self {
            InstancesOption::Count(count) => vec![InstanceDefinition::new(); *count],
            InstancesOption::List(list) => list.clone(),
        }
    }
}

pub struct Builder {
    inner: ProxyResult<ConfigOption>,
}

impl Builder {
    #[inline]
    pub fn new() -> Builder {
        Builder {
            inner: Ok(ConfigOption::default()),
        }
    }

    pub fn socks_port(self, addr: SocketAddr) -> Builder {
        self.and_then(|mut option| {
            option.socks_port = Some(WrapAddr(addr));
            Ok(option)
        })
    }

    pub fn http_port(self, addr: SocketAddr) -> Builder {
        self.and_then(|mut option| {
            option.http_port = Some(WrapAddr(addr));
            Ok(option)
        })
    }

    pub fn dns_port(self, addr: SocketAddr) -> Builder {
        self.and_then(|mut option| {
            option.dns_port = Some(WrapAddr(addr));
            Ok(option)
        })
    }

    pub fn control_port(self, addr: Option<SocketAddr>) -> Builder {
        self.and_then(|mut option| {
            option.control_port = addr.map(WrapAddr);
            Ok(option)
        })
    }

    pub fn instances(self, count: usize) -> Builder {
        self.and_then(|mut option| {
            option.instances = InstancesOption::Count(count);
            Ok(option)
        })
    }

    pub fn definitions(self, definitions: Vec<InstanceDefinition>) -> Builder {
        self.and_then(|mut option| {
            option.instances = InstancesOption::List(definitions);
            Ok(option)
        })
    }

    pub fn tor_path<S: Into<String>>(self, path: S) -> Builder {
        self.and_then(|mut option| {
            option.tor_path = path.into();
            Ok(option)
        })
    }

    pub fn parent_data_directory<P: Into<PathBuf>>(self, path: P) -> Builder {
        self.and_then(|mut option| {
            option.parent_data_directory = Some(path.into());
            Ok(option)
        })
    }

    pub fn tor_config<K: Into<String>, V: Into<String>>(self, key: K, value: V) -> Builder {
        self.and_then(|mut option| {
            option.tor_config.insert(key.into(), value.into());
            Ok(option)
        })
    }

    pub fn load_balance_method(self, method: LoadBalanceMethod) -> Builder {
        self.and_then(|mut option| {
            option.load_balance_method = method;
            Ok(option)
        })
    }

    pub fn proxy_by_name(self, proxy_by_name: Option<ProxyByName>) -> Builder {
        self.and_then(|mut option| {
            option.proxy_by_name = proxy_by_name;
            Ok(option)
        })
    }

    pub fn dns_timeout(self, timeout: Duration) -> Builder {
        self.and_then(|mut option| {
            option.dns_timeout = ConfigDuration::new(timeout);
            Ok(option)
        })
    }

    pub fn log_level(self, level: LevelFilter) -> Builder {
        self.and_then(|mut option| {
            option.log_level = level;
            Ok(option)
        })
    }

    fn and_then<F>(self, func: F) -> Self
    where
        F: FnOnce(ConfigOption) -> ProxyResult<ConfigOption>,
    {
        Builder {
            inner: self.inner.and_then(func),
        }
    }

    pub fn into_value(self) -> ProxyResult<ConfigOption> {
        let mut option = self.inner?;
        option.after_load_option()?;
        Ok(option)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_control_port() -> Option<WrapAddr> {
    Some(WrapAddr(SocketAddr::from((Ipv4Addr::LOCALHOST, 9077))))
}

fn default_tor_path() -> String {
    "tor".to_string()
}

pub fn default_tor_config() -> TorConfig {
    let mut config = BTreeMap::new();
    config.insert("Log".to_string(), "notice stdout".to_string());
    config.insert("NewCircuitPeriod".to_string(), "10".to_string());
    config
}

fn default_dns_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(10)
}

fn default_log_level() -> LevelFilter {
    LevelFilter::Info
}

#[serde_as]
/// 启动配置, 可由配置文件及命令行共同生成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOption {
    /// SOCKS5代理的监听地址
    #[serde_as(as = "Option<DisplayFromStrOrNumber>")]
    #[serde(default)]
    pub socks_port: Option<WrapAddr>,
    /// HTTP代理的监听地址
    #[serde_as(as = "Option<DisplayFromStrOrNumber>")]
    #[serde(default)]
    pub http_port: Option<WrapAddr>,
    /// DNS的监听地址
    #[serde_as(as = "Option<DisplayFromStrOrNumber>")]
    #[serde(default)]
    pub dns_port: Option<WrapAddr>,
    /// 管理接口的监听地址
    #[serde_as(as = "Option<DisplayFromStrOrNumber>")]
    #[serde(default = "default_control_port")]
    pub control_port: Option<WrapAddr>,
    #[serde(default)]
    pub disable_control: bool,
    #[serde(default)]
    pub instances: InstancesOption,
    #[serde(default = "default_tor_path")]
    pub tor_path: String,
    /// 为空时使用系统临时目录
    #[serde(default)]
    pub parent_data_directory: Option<PathBuf>,
    /// 所有实例的默认配置
    #[serde_as(as = "BTreeMap<_, DisplayFromStrOrNumber>")]
    #[serde(default = "default_tor_config")]
    pub tor_config: TorConfig,
    #[serde(default)]
    pub load_balance_method: LoadBalanceMethod,
    #[serde(default)]
    pub proxy_by_name: Option<ProxyByName>,
    #[serde_as(as = "DisplayFromStrOrNumber")]
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout: ConfigDuration,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_log_level")]
    pub log_level: LevelFilter,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub disable_stdout: bool,
}

impl Default for ConfigOption {
    fn default() -> Self {
        Self {
            socks_port: None,
            http_port: None,
            dns_port: None,
            control_port: default_control_port(),
            disable_control: false,
            instances: InstancesOption::default(),
            tor_path: default_tor_path(),
            parent_data_directory: None,
            tor_config: default_tor_config(),
            load_balance_method: LoadBalanceMethod::default(),
            proxy_by_name: None,
            dns_timeout: default_dns_timeout(),
            log_level: default_log_level(),
            log_file: None,
            disable_stdout: false,
        }
    }
}

impl ConfigOption {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn definitions(&self) -> Vec<InstanceDefinition> {
        self.instances.definitions()
    }

    /// 实例数据目录的父目录, 未配置时按进程号放在临时目录下
    pub fn data_directory(&self) -> PathBuf {
        match &self.parent_data_directory {
            Some(path) => path.clone(),
            None => std::env::temp_dir().join(format!("tor-router-{}", std::process::id())),
        }
    }

    /// 管理接口地址, 禁用时为空
    pub fn control_addr(&self) -> Option<SocketAddr> {
        if self.disable_control {
            None
        } else {
            self.control_port.map(|a| a.0)
        }
    }

    pub fn after_load_option(&mut self) -> ProxyResult<()> {
        if self.tor_path.trim().is_empty() {
            return Err(ProxyError::ConfigError("tor_path is empty".to_string()));
        }
        let mut names = std::collections::HashSet::new();
        for def in self.instances.definitions() {
            def.validate()?;
            if let Some(name) = def.name() {
                if !names.insert(name.to_string()) {
                    return Err(ProxyError::DuplicateName(name.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let option: ConfigOption = toml::from_str("").unwrap();
        assert_eq!(option.control_addr().unwrap().port(), 9077);
        assert_eq!(option.tor_config.get("Log").map(|s| s.as_str()), Some("notice stdout"));
        assert_eq!(option.dns_timeout.0, Duration::from_secs(10));
        assert_eq!(option.log_level, LevelFilter::Info);
        assert_eq!(option.tor_path, "tor");
        assert!(option.definitions().is_empty());
    }

    #[test]
    fn json_instances_and_ports() {
        let option: ConfigOption = serde_json::from_str(
            r#"{"http_port": ":9080", "instances": 2, "tor_config": {"NewCircuitPeriod": 30}, "proxy_by_name": {"mode": "individual"}}"#,
        )
        .unwrap();
        assert_eq!(option.http_port.unwrap().0.port(), 9080);
        assert_eq!(option.definitions().len(), 2);
        assert_eq!(option.tor_config.get("NewCircuitPeriod").map(|s| s.as_str()), Some("30"));
        assert!(!option.proxy_by_name.unwrap().deny_unidentified_users);
    }

    #[test]
    fn builder_rejects_duplicate_names() {
        let result = ConfigOption::builder()
            .definitions(vec![
                InstanceDefinition::named("a"),
                InstanceDefinition::named("a"),
            ])
            .into_value();
        assert!(matches!(result, Err(ProxyError::DuplicateName(_))));
        let result = ConfigOption::builder()
            .definitions(vec![InstanceDefinition::named("a").with_weight(0)])
            .into_value();
        assert!(matches!(result, Err(ProxyError::ConfigError(_))));
        let option = ConfigOption::builder()
            .instances(2)
            .control_port(None)
            .into_value()
            .unwrap();
        assert!(option.control_addr().is_none());
    }
}
