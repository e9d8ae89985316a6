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
// Created Date: 2024/03/06 16:31:08

use std::net::SocketAddr;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

use crate::{ProxyError, ProxyResult};

/// 控制端口的一次完整回复
///
/// ```text
/// 250-SocksPort=127.0.0.1:9050
/// 250 Log=notice stdout
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl ControlReply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 解析GETCONF的返回值, 无`=`的行表示该项为默认值
    pub fn conf_values(&self, key: &str) -> Vec<String> {
        let mut values = vec![];
        for line in &self.lines {
            match line.split_once('=') {
                Some((k, v)) if k.eq_ignore_ascii_case(key) => values.push(unquote(v)),
                _ => {}
            }
        }
        values
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let mut result = String::with_capacity(value.len());
        let mut chars = value[1..value.len() - 1].chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(n) = chars.next() {
                    result.push(n);
                }
            } else {
                result.push(c);
            }
        }
        result
    } else {
        value.to_string()
    }
}

fn quote(value: &str) -> String {
    let mut result = String::with_capacity(value.len() + 2);
    result.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            result.push('\\');
        }
        result.push(c);
    }
    result.push('"');
    result
}

/// 控制端口的客户端, 按行收发, 一问一答
pub struct TorControl {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TorControl {
    pub async fn connect(addr: SocketAddr) -> ProxyResult<TorControl> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(TorControl {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn authenticate(&mut self, secret: &str) -> ProxyResult<()> {
        self.request(&format!("AUTHENTICATE {}", quote(secret)))
            .await
            .map(|_| ())
    }

    pub fn getconf_command(key: &str) -> String {
        format!("GETCONF {}", key)
    }

    pub fn setconf_command(key: &str, value: &str) -> String {
        format!("SETCONF {}={}", key, quote(value))
    }

    pub fn signal_command(signal: &str) -> String {
        format!("SIGNAL {}", signal.to_ascii_uppercase())
    }

    /// 换一个新的身份, 即新的线路
    pub fn new_identity_command() -> String {
        Self::signal_command("NEWNYM")
    }

    /// 发送一条命令并读取完整的回复, 4xx及5xx转成错误
    pub async fn request(&mut self, command: &str) -> ProxyResult<ControlReply> {
        if command.contains(['\r', '\n']) {
            return Err(ProxyError::ControlError(
                "command can't contain line breaks".to_string(),
            ));
        }
        self.writer
            .write_all(format!("{}\r\n", command).as_bytes())
            .await?;
        self.writer.flush().await?;
        let reply = self.read_reply().await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ProxyError::ControlError(format!(
                "{} {}",
                reply.code,
                reply.lines.join(" ")
            )))
        }
    }

    async fn read_line(&mut self) -> ProxyResult<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProxyError::ControllerNotConnected);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> ProxyResult<ControlReply> {
        let mut lines = vec![];
        loop {
            let line = self.read_line().await?;
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(ProxyError::ControlError(format!("bad reply line {:?}", line)));
            }
            let code = line[..3]
                .parse::<u16>()
                .map_err(|_| ProxyError::ControlError(format!("bad reply line {:?}", line)))?;
            // 650 为异步事件, 未订阅时不应出现, 直接跳过
            if code == 650 {
                continue;
            }
            let sep = line.as_bytes().get(3).copied().unwrap_or(b' ');
            let text = line.get(4..).unwrap_or_default().to_string();
            match sep {
                b'-' => lines.push(text),
                b'+' => {
                    let mut data = text;
                    loop {
                        let l = self.read_line().await?;
                        if l == "." {
                            break;
                        }
                        data.push('\n');
                        data.push_str(l.strip_prefix('.').unwrap_or(&l));
                    }
                    lines.push(data);
                }
                _ => {
                    lines.push(text);
                    return Ok(ControlReply { code, lines });
                }
            }
        }
    }
}
