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
// Created Date: 2024/03/04 11:02:10

use std::{fmt::Display, io, str::FromStr, time::Duration};

/// 配置时长, 如 "500ms" "10s" "2min" "1h", 纯数字表示秒
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn new(dur: Duration) -> Self {
        Self(dur)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }
}

impl From<Duration> for ConfigDuration {
    fn from(value: Duration) -> Self {
        ConfigDuration(value)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(value: ConfigDuration) -> Duration {
        value.0
    }
}

impl FromStr for ConfigDuration {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // "min"要先于"s"判断, "ms"要先于"s"判断
        let (num, unit) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1u64)
        } else if let Some(v) = s.strip_suffix("min") {
            (v, 60_000)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1000)
        } else {
            (s, 1000)
        };
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid duration: {:?}", s),
            )
        };
        let value = num.trim().parse::<u64>().map_err(|_| invalid())?;
        let millis = value.checked_mul(unit).ok_or_else(invalid)?;
        Ok(ConfigDuration(Duration::from_millis(millis)))
    }
}

impl Display for ConfigDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = self.0.as_millis();
        if ms % 1000 != 0 {
            write!(f, "{}ms", ms)
        } else {
            let s = ms / 1000;
            if s >= 3600 && s % 3600 == 0 {
                write!(f, "{}h", s / 3600)
            } else if s >= 60 && s % 60 == 0 {
                write!(f, "{}min", s / 60)
            } else {
                write!(f, "{}s", s)
            }
        }
    }
}
