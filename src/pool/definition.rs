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
// Created Date: 2024/03/05 09:40:11

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::{formats::PreferMany, serde_as, OneOrMany};

use crate::{config::DisplayFromStrOrNumber, ProxyError, ProxyResult};

/// 实例的配置项, 值统一按字符串存储
pub type TorConfig = BTreeMap<String, String>;

/// 创建实例的蓝图, 字段名与管理接口保持一致 {"Name", "Group", "Config", "Weight"}
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDefinition {
    /// 实例名称, 在整个实例池中唯一
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 所属分组, 可以是单个字符串或者字符串数组
    #[serde(rename = "Group", default)]
    #[serde_as(as = "OneOrMany<_, PreferMany>")]
    pub group: Vec<String>,
    /// 覆盖默认配置的项
    #[serde(rename = "Config", default)]
    #[serde_as(as = "BTreeMap<_, DisplayFromStrOrNumber>")]
    pub config: TorConfig,
    /// 权重, 仅在weighted负载均衡时生效
    #[serde(rename = "Weight", default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl InstanceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.add_group(group);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_config<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// 空字符串的名称视为未命名
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }

    pub fn weight(&self) -> u32 {
        self.weight.unwrap_or(1)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.group.iter().any(|g| g == group)
    }

    /// 分组为集合语义, 已存在时返回false
    pub fn add_group<S: Into<String>>(&mut self, group: S) -> bool {
        let group = group.into();
        if self.in_group(&group) {
            return false;
        }
        self.group.push(group);
        true
    }

    pub fn remove_group(&mut self, group: &str) -> bool {
        let len = self.group.len();
        self.group.retain(|g| g != group);
        len != self.group.len()
    }

    /// 权重必须为正数
    pub fn validate(&self) -> ProxyResult<()> {
        if self.weight == Some(0) {
            return Err(ProxyError::ConfigError(format!(
                "Weight of instance {} must be positive",
                self.name().unwrap_or("<anonymous>")
            )));
        }
        Ok(())
    }

    /// 以`base`为底, 自身的配置覆盖其上
    pub fn merged_config(&self, base: &TorConfig) -> TorConfig {
        let mut config = base.clone();
        for (k, v) in &self.config {
            config.insert(k.clone(), v.clone());
        }
        config
    }
}
