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
// Created Date: 2024/03/04 10:12:45

use std::{
    error::Error,
    fmt::{self, Debug, Display},
    io,
};

use hickory_proto::error::ProtoError;
use rand::distributions::WeightedError;

pub enum ProxyError {
    IoError(io::Error),
    DnsError(ProtoError),
    ConfigError(String),
    /// 实例创建失败, 进程启动或者控制端口认证失败
    CreationError(String),
    /// 实例名称已存在
    DuplicateName(String),
    InstanceNotFound(String),
    GroupNotFound(String),
    /// 控制端口还未认证成功或者已断开
    ControllerNotConnected,
    /// 控制端口返回的错误码及信息
    ControlError(String),
    /// 无可用的端口
    PortExhausted,
    /// 无可用的实例
    UpstreamUnavailable,
    /// 上游socks5返回的错误码
    UpstreamRefused(u8),
    VerifyFail,
    ProtErr,
    ProtNoSupport,
    /// 批量操作时每个实例的错误信息
    Batch(Vec<(String, ProxyError)>),
    Extension(&'static str),
}

impl ProxyError {
    pub fn extension(value: &'static str) -> ProxyError {
        ProxyError::Extension(value)
    }

    pub fn is_io_error(&self) -> bool {
        matches!(self, ProxyError::IoError(_))
    }

    /// 将批量结果聚合, 只要有一个失败则返回Batch
    pub fn collect_batch<T>(results: Vec<(String, ProxyResult<T>)>) -> ProxyResult<Vec<T>> {
        let mut values = vec![];
        let mut errors = vec![];
        for (id, r) in results {
            match r {
                Ok(v) => values.push(v),
                Err(e) => errors.push((id, e)),
            }
        }
        if errors.is_empty() {
            Ok(values)
        } else {
            Err(ProxyError::Batch(errors))
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        ProxyError::IoError(value)
    }
}

impl From<ProtoError> for ProxyError {
    fn from(value: ProtoError) -> Self {
        ProxyError::DnsError(value)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(value: serde_json::Error) -> Self {
        ProxyError::ConfigError(format!("json: {}", value))
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(value: serde_yaml::Error) -> Self {
        ProxyError::ConfigError(format!("yaml: {}", value))
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(value: toml::de::Error) -> Self {
        ProxyError::ConfigError(format!("toml: {}", value))
    }
}

impl From<WeightedError> for ProxyError {
    fn from(_: WeightedError) -> Self {
        ProxyError::UpstreamUnavailable
    }
}

impl Debug for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(arg0) => f.debug_tuple("IoError").field(arg0).finish(),
            Self::DnsError(arg0) => f.debug_tuple("DnsError").field(arg0).finish(),
            Self::ConfigError(arg0) => f.debug_tuple("ConfigError").field(arg0).finish(),
            Self::CreationError(arg0) => f.debug_tuple("CreationError").field(arg0).finish(),
            Self::DuplicateName(arg0) => f.debug_tuple("DuplicateName").field(arg0).finish(),
            Self::InstanceNotFound(arg0) => {
                f.debug_tuple("InstanceNotFound").field(arg0).finish()
            }
            Self::GroupNotFound(arg0) => f.debug_tuple("GroupNotFound").field(arg0).finish(),
            Self::ControllerNotConnected => write!(f, "ControllerNotConnected"),
            Self::ControlError(arg0) => f.debug_tuple("ControlError").field(arg0).finish(),
            Self::PortExhausted => write!(f, "PortExhausted"),
            Self::UpstreamUnavailable => write!(f, "UpstreamUnavailable"),
            Self::UpstreamRefused(arg0) => f.debug_tuple("UpstreamRefused").field(arg0).finish(),
            Self::VerifyFail => write!(f, "VerifyFail"),
            Self::ProtErr => write!(f, "ProtErr"),
            Self::ProtNoSupport => write!(f, "ProtNoSupport"),
            Self::Batch(arg0) => f.debug_tuple("Batch").field(arg0).finish(),
            Self::Extension(arg0) => f.debug_tuple("Extension").field(arg0).finish(),
        }
    }
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "io error: {}", e),
            Self::DnsError(e) => write!(f, "dns error: {}", e),
            Self::ConfigError(e) => write!(f, "config error: {}", e),
            Self::CreationError(e) => write!(f, "instance creation failed: {}", e),
            Self::DuplicateName(name) => write!(f, "instance named {} already exists", name),
            Self::InstanceNotFound(key) => write!(f, "instance {} not found", key),
            Self::GroupNotFound(group) => write!(f, "group {} has no instances", group),
            Self::ControllerNotConnected => write!(f, "control port not connected"),
            Self::ControlError(e) => write!(f, "control error: {}", e),
            Self::PortExhausted => write!(f, "no free local port"),
            Self::UpstreamUnavailable => write!(f, "no instance available"),
            Self::UpstreamRefused(code) => write!(f, "upstream refused with code {}", code),
            Self::VerifyFail => write!(f, "verify fail"),
            Self::ProtErr => write!(f, "protocol error"),
            Self::ProtNoSupport => write!(f, "protocol not support"),
            Self::Batch(errors) => {
                write!(f, "{} instance(s) failed:", errors.len())?;
                for (id, e) in errors {
                    write!(f, " [{}: {}]", id, e)?;
                }
                Ok(())
            }
            Self::Extension(e) => write!(f, "{}", e),
        }
    }
}

impl Error for ProxyError {}
