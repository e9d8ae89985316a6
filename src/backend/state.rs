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
// Created Date: 2024/03/06 14:05:32

use std::fmt::Display;

use regex::Regex;
use serde::Serialize;

/// 后端进程的生命周期, 只能单向推进
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    #[default]
    Starting,
    ControlListening,
    ControlAuthenticated,
    Ready,
    Exited,
}

impl Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendState::Starting => "starting",
            BackendState::ControlListening => "control_listening",
            BackendState::ControlAuthenticated => "control_authenticated",
            BackendState::Ready => "ready",
            BackendState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// 日志等级, 对应输出中的 [notice] [warn] 等标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warn,
    Err,
}

/// 输出中能推进状态的关键行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    ControlListener,
    ProxyListener,
    DnsListener,
    Bootstrapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub severity: Severity,
    pub body: String,
    pub marker: Option<Marker>,
}

/// 逐行解析进程的标准输出
pub struct OutputMatcher {
    severity: Regex,
    rules: Vec<(Regex, Marker)>,
}

impl OutputMatcher {
    pub fn new(severity: Regex, rules: Vec<(Regex, Marker)>) -> Self {
        Self { severity, rules }
    }

    /// tor的输出格式, 如 "Mar 06 14:05:32.000 [notice] Bootstrapped 100% (done): Done"
    pub fn tor() -> Self {
        let rule = |s: &str| Regex::new(s).expect("valid builtin pattern");
        Self {
            severity: rule(r"\[(debug|info|notice|warn|err)\]\s*(.*)$"),
            rules: vec![
                (rule(r"(?i)open(ing|ed) control listener"), Marker::ControlListener),
                (rule(r"(?i)open(ing|ed) socks listener"), Marker::ProxyListener),
                (rule(r"(?i)open(ing|ed) dns listener"), Marker::DnsListener),
                (rule(r"(?i)bootstrapped 100%"), Marker::Bootstrapped),
            ],
        }
    }

    pub fn classify(&self, line: &str) -> OutputLine {
        let line = line.trim_end();
        let (severity, body) = match self.severity.captures(line) {
            Some(caps) => {
                let severity = match caps.get(1).map(|m| m.as_str()) {
                    Some("debug") => Severity::Debug,
                    Some("info") => Severity::Info,
                    Some("warn") => Severity::Warn,
                    Some("err") => Severity::Err,
                    _ => Severity::Notice,
                };
                let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                (severity, body.to_string())
            }
            None => (Severity::Info, line.to_string()),
        };
        let marker = self
            .rules
            .iter()
            .find(|(re, _)| re.is_match(&body))
            .map(|(_, m)| *m);
        OutputLine {
            severity,
            body,
            marker,
        }
    }
}

impl Default for OutputMatcher {
    fn default() -> Self {
        Self::tor()
    }
}

/// 状态机, 错误为正交的标记, 可在任意状态下触发
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lifecycle {
    state: BackendState,
    bootstrapped: bool,
    proxy_listening: bool,
    dns_listening: bool,
    error: Option<String>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BackendState::Ready
    }

    pub fn is_exited(&self) -> bool {
        self.state() == BackendState::Exited
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn proxy_listening(&self) -> bool {
        self.proxy_listening
    }

    pub fn dns_listening(&self) -> bool {
        self.dns_listening
    }

    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// 仅首次从starting进入时返回true, 调用方此时发起控制连接
    pub fn on_control_listening(&mut self) -> bool {
        if self.state() != BackendState::Starting {
            return false;
        }
        self.state = BackendState::ControlListening;
        true
    }

    /// 返回true表示进入了ready
    pub fn on_authenticated(&mut self) -> bool {
        if self.state() != BackendState::ControlListening {
            return false;
        }
        self.state = BackendState::ControlAuthenticated;
        self.try_ready()
    }

    /// 返回true表示进入了ready
    pub fn on_bootstrapped(&mut self) -> bool {
        if self.is_exited() {
            return false;
        }
        self.bootstrapped = true;
        self.try_ready()
    }

    pub fn on_proxy_listening(&mut self) {
        self.proxy_listening = true;
    }

    pub fn on_dns_listening(&mut self) {
        self.dns_listening = true;
    }

    pub fn raise(&mut self, error: String) {
        self.error = Some(error);
    }

    /// 返回false表示已经退出过
    pub fn on_exit(&mut self) -> bool {
        if self.is_exited() {
            return false;
        }
        self.state = BackendState::Exited;
        true
    }

    fn try_ready(&mut self) -> bool {
        if self.bootstrapped && self.state() == BackendState::ControlAuthenticated {
            self.state = BackendState::Ready;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_tor_lines() {
        let matcher = OutputMatcher::tor();
        let line = matcher.classify(
            "Mar 06 14:05:32.000 [notice] Opening Control listener on 127.0.0.1:40123\n",
        );
        assert_eq!(line.severity, Severity::Notice);
        assert_eq!(line.marker, Some(Marker::ControlListener));
        assert_eq!(line.body, "Opening Control listener on 127.0.0.1:40123");

        let line = matcher.classify(
            "Mar 06 14:05:32.000 [notice] Opened Control listener connection (ready) on 127.0.0.1:40123",
        );
        assert_eq!(line.marker, Some(Marker::ControlListener));

        let line = matcher.classify("Mar 06 [notice] Opening Socks listener on 127.0.0.1:1");
        assert_eq!(line.marker, Some(Marker::ProxyListener));
        let line = matcher.classify("Mar 06 [notice] Opening DNS listener on 127.0.0.1:2");
        assert_eq!(line.marker, Some(Marker::DnsListener));
        let line = matcher.classify("Mar 06 [notice] Bootstrapped 100% (done): Done");
        assert_eq!(line.marker, Some(Marker::Bootstrapped));
        let line = matcher.classify("Mar 06 [notice] Bootstrapped 45% (requesting_descriptors)");
        assert_eq!(line.marker, None);

        let line = matcher.classify("Mar 06 [err] Reading config failed--see warnings above.");
        assert_eq!(line.severity, Severity::Err);
        assert_eq!(line.marker, None);

        let line = matcher.classify("no severity here");
        assert_eq!(line.severity, Severity::Info);
        assert_eq!(line.body, "no severity here");
    }

    #[test]
    fn ready_needs_auth_and_bootstrap() {
        let mut life = Lifecycle::new();
        assert_eq!(life.state(), BackendState::default());
        assert_eq!(life.state(), BackendState::Starting);
        assert!(!life.on_bootstrapped());
        assert!(life.on_control_listening());
        assert!(!life.on_control_listening());
        assert!(life.on_authenticated());
        assert!(life.is_ready());
    }

    #[test]
    fn bootstrap_after_auth() {
        let mut life = Lifecycle::new();
        life.on_control_listening();
        assert!(!life.on_authenticated());
        assert_eq!(life.state(), BackendState::ControlAuthenticated);
        assert!(life.on_bootstrapped());
        assert!(life.is_ready());
    }

    #[test]
    fn error_is_orthogonal() {
        let mut life = Lifecycle::new();
        life.on_control_listening();
        life.raise("boom".to_string());
        assert_eq!(life.state(), BackendState::ControlListening);
        assert_eq!(life.error(), Some("boom"));
    }

    #[test]
    fn exited_is_terminal() {
        let mut life = Lifecycle::new();
        assert!(life.on_exit());
        assert!(!life.on_exit());
        assert!(!life.on_control_listening());
        assert!(!life.on_bootstrapped());
        assert!(life.is_exited());
    }
}
