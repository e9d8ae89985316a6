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
// Created Date: 2024/03/05 10:21:47

use std::{fmt::Display, io, str::FromStr};

use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use serde::{Deserialize, Serialize};

use crate::ProxyResult;

/// 负载均衡的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceMethod {
    /// 轮询
    #[default]
    RoundRobin,
    /// 按权重随机
    Weighted,
}

impl FromStr for LoadBalanceMethod {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &*s.to_ascii_lowercase() {
            "round_robin" | "roundrobin" => Ok(LoadBalanceMethod::RoundRobin),
            "weighted" => Ok(LoadBalanceMethod::Weighted),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown load balance method {}", s),
            )),
        }
    }
}

impl Display for LoadBalanceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceMethod::RoundRobin => f.write_str("round_robin"),
            LoadBalanceMethod::Weighted => f.write_str("weighted"),
        }
    }
}

/// 按权重选取的缓存, 实例结构变化时必须丢弃重建
#[derive(Debug, Clone)]
pub struct WeightedCache {
    ids: Vec<String>,
    index: WeightedIndex<u32>,
}

impl WeightedCache {
    /// 权重为0的实例永远不会被选中, 全部为0时返回错误
    pub fn build<I>(weights: I) -> ProxyResult<Self>
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let (ids, weights): (Vec<String>, Vec<u32>) = weights.into_iter().unzip();
        let index = WeightedIndex::new(weights)?;
        Ok(Self { ids, index })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        &self.ids[self.index.sample(rng)]
    }
}
