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
// Created Date: 2024/03/13 11:02:37

use std::{fmt::Display, str::FromStr, sync::Arc};

use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc::Receiver,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::{
    pool::{InstanceDefinition, InstancePool, LoadBalanceMethod, TorConfig},
    ProxyError, ProxyResult,
};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const POOL_ERROR: i64 = -32000;

/// 单行请求的最大长度
const MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new<S: Into<String>>(code: i64, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params<S: Display>(message: S) -> Self {
        Self::new(INVALID_PARAMS, message.to_string())
    }
}

impl From<ProxyError> for RpcError {
    fn from(value: ProxyError) -> Self {
        RpcError::new(POOL_ERROR, value.to_string())
    }
}

type RpcResult = Result<Value, RpcError>;

fn to_value<T: Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| RpcError::new(POOL_ERROR, e.to_string()))
}

/// 配置值统一转为字符串
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        v => v.to_string(),
    }
}

/// 按位置取参数
struct Params<'a>(&'a [Value]);

impl<'a> Params<'a> {
    fn get(&self, idx: usize) -> Result<&'a Value, RpcError> {
        self.0
            .get(idx)
            .ok_or_else(|| RpcError::invalid_params(format!("missing param #{}", idx)))
    }

    fn string(&self, idx: usize) -> Result<String, RpcError> {
        match self.get(idx)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(RpcError::invalid_params(format!("param #{} must be a string", idx))),
        }
    }

    fn index(&self, idx: usize) -> Result<usize, RpcError> {
        self.get(idx)?
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| RpcError::invalid_params(format!("param #{} must be an index", idx)))
    }

    fn parse<T>(&self, idx: usize) -> Result<T, RpcError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(idx)?.parse::<T>().map_err(RpcError::invalid_params)
    }

    fn config(&self, idx: usize) -> Result<TorConfig, RpcError> {
        match self.get(idx)? {
            Value::Object(map) => Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect()),
            _ => Err(RpcError::invalid_params(format!("param #{} must be an object", idx))),
        }
    }

    /// 实例数量或者实例定义的数组
    fn definitions(&self, idx: usize) -> Result<Vec<InstanceDefinition>, RpcError> {
        let value = self.get(idx)?;
        if let Some(count) = value.as_u64() {
            return Ok(vec![InstanceDefinition::new(); count as usize]);
        }
        serde_json::from_value::<Vec<InstanceDefinition>>(value.clone())
            .map_err(RpcError::invalid_params)
    }
}

/// 管理接口, 每行一个JSON-RPC 2.0请求, 参数按位置传递
pub struct ControlServer {
    pool: Arc<InstancePool>,
}

impl ControlServer {
    pub fn new(pool: Arc<InstancePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    fn infos(list: Vec<Arc<crate::backend::BackendProcess>>) -> RpcResult {
        to_value(list.iter().map(|p| p.info()).collect::<Vec<_>>())
    }

    pub async fn dispatch(&self, method: &str, params: &[Value]) -> RpcResult {
        let p = Params(params);
        let pool = &self.pool;
        let ok = Ok(Value::Null);
        match method {
            "queryInstances" => Self::infos(pool.instances()),
            "queryInstanceNames" => to_value(pool.instance_names()),
            "queryGroupNames" => to_value(pool.group_names()),
            "queryInstancesByGroup" => Self::infos(pool.instances_by_group(&p.string(0)?)),
            "queryInstanceByName" => to_value(pool.instance_by_name(&p.string(0)?).map(|i| i.info())),
            "queryInstanceAt" => to_value(pool.instance_at(p.index(0)?).map(|i| i.info())),
            "createInstances" | "addInstances" => {
                let created = pool.create(p.definitions(0)?).await?;
                Self::infos(created)
            }
            "removeInstances" => {
                pool.remove(p.index(0)?).await?;
                ok
            }
            "removeInstanceAt" => {
                pool.remove_at(p.index(0)?).await?;
                ok
            }
            "removeInstanceByName" => {
                pool.remove_by_name(&p.string(0)?).await?;
                ok
            }
            "newIdentites" => {
                pool.new_identites().await?;
                ok
            }
            "newIdentityAt" => {
                pool.new_identity_at(p.index(0)?).await?;
                ok
            }
            "newIdentityByName" => {
                pool.new_identity_by_name(&p.string(0)?).await?;
                ok
            }
            "newIdentitiesByGroup" => {
                pool.new_identities_by_group(&p.string(0)?).await?;
                ok
            }
            "nextInstance" => to_value(pool.next().map(|i| i.info())),
            "nextInstanceByGroup" => to_value(pool.next_by_group(&p.string(0)?)?.info()),
            "closeInstances" => {
                pool.exit().await;
                ok
            }
            "setTorConfig" => {
                pool.set_tor_config(&p.config(0)?).await?;
                ok
            }
            "setTorConfigByGroup" => {
                pool.set_tor_config_by_group(&p.string(0)?, &p.config(1)?)
                    .await?;
                ok
            }
            "getDefaultTorConfig" => to_value(pool.default_config()),
            "setDefaultTorConfig" => {
                pool.set_default_config(p.config(0)?);
                ok
            }
            "getLoadBalanceMethod" => to_value(pool.load_balance_method()),
            "setLoadBalanceMethod" => {
                pool.set_load_balance_method(p.parse::<LoadBalanceMethod>(0)?);
                ok
            }
            "getInstanceConfigByName" => {
                to_value(pool.get_config_by_name(&p.string(0)?, &p.string(1)?).await?)
            }
            "getInstanceConfigAt" => {
                to_value(pool.get_config_at(p.index(0)?, &p.string(1)?).await?)
            }
            "setInstanceConfigByName" => {
                let value = value_to_string(p.get(2)?);
                pool.set_config_by_name(&p.string(0)?, &p.string(1)?, &value)
                    .await?;
                ok
            }
            "setInstanceConfigAt" => {
                let value = value_to_string(p.get(2)?);
                pool.set_config_at(p.index(0)?, &p.string(1)?, &value)
                    .await?;
                ok
            }
            "signalAllInstances" => {
                pool.signal_all(&p.string(0)?).await?;
                ok
            }
            "signalInstanceAt" => {
                pool.signal_at(p.index(0)?, &p.string(1)?).await?;
                ok
            }
            "signalInstanceByName" => {
                pool.signal_by_name(&p.string(0)?, &p.string(1)?).await?;
                ok
            }
            "signalInstancesByGroup" => {
                pool.signal_by_group(&p.string(0)?, &p.string(1)?).await?;
                ok
            }
            "addInstanceToGroupByName" => {
                pool.add_instance_to_group_by_name(&p.string(0)?, &p.string(1)?)?;
                ok
            }
            "addInstanceToGroupAt" => {
                pool.add_instance_to_group_at(&p.string(0)?, p.index(1)?)?;
                ok
            }
            "removeInstanceFromGroupByName" => {
                pool.remove_instance_from_group_by_name(&p.string(0)?, &p.string(1)?)?;
                ok
            }
            "removeInstanceFromGroupAt" => {
                pool.remove_instance_from_group_at(&p.string(0)?, p.index(1)?)?;
                ok
            }
            _ => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("method {} not found", method),
            )),
        }
    }

    /// 处理一行请求, 通知类请求(无id)不回复
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return Some(Self::error_response(Value::Null, RpcError::new(PARSE_ERROR, e.to_string()))),
        };
        let id = request.get("id").cloned();
        let method = match request.get("method").and_then(|m| m.as_str()) {
            Some(m) => m,
            None => {
                return Some(Self::error_response(
                    id.unwrap_or(Value::Null),
                    RpcError::new(INVALID_REQUEST, "missing method"),
                ))
            }
        };
        let params = match request.get("params") {
            None | Some(Value::Null) => vec![],
            Some(Value::Array(list)) => list.clone(),
            Some(v) => vec![v.clone()],
        };
        log::debug!("[control] {} {:?}", method, params);
        let result = self.dispatch(method, &params).await;
        if let Err(e) = &result {
            log::info!("[control] {} 执行失败: {}", method, e.message);
        }
        let id = id?;
        Some(match result {
            Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
            Err(e) => Self::error_response(id, e),
        })
    }

    fn error_response(id: Value, err: RpcError) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": err.code, "message": err.message},
        })
    }

    /// 按行读取请求, 超过长度限制的行直接断开
    pub async fn process<S>(self: Arc<Self>, stream: S) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE));
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Err(ProxyError::extension("control line too long"));
                }
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(line.trim()).await {
                let mut data = serde_json::to_vec(&response)?;
                data.push(b'\n');
                writer.write_all(&data).await?;
            }
        }
        Ok(())
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut receiver_close: Receiver<()>,
    ) -> ProxyResult<()> {
        loop {
            tokio::select! {
                r = listener.accept() => {
                    let (conn, addr) = r?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.process(conn).await {
                            log::info!("[control] 处理{}时发生错误: {}", addr, e);
                        }
                    });
                }
                _ = receiver_close.recv() => {
                    log::info!("[control] 控制端收到关闭信号");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TorLauncher;

    fn server() -> ControlServer {
        let pool = InstancePool::new(
            Arc::new(TorLauncher::new("tor")),
            std::env::temp_dir(),
            TorConfig::new(),
            LoadBalanceMethod::RoundRobin,
        );
        ControlServer::new(pool)
    }

    #[tokio::test]
    async fn query_empty_pool() {
        let server = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"queryInstances","params":[]}"#)
            .await
            .unwrap();
        assert_eq!(resp["result"], json!([]));
        assert_eq!(resp["id"], json!(1));
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"nextInstance"}"#)
            .await
            .unwrap();
        assert_eq!(resp["result"], Value::Null);
    }

    #[tokio::test]
    async fn errors_map_to_codes() {
        let server = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"noSuchMethod"}"#)
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], json!(METHOD_NOT_FOUND));
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"removeInstanceAt","params":["x"]}"#)
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], json!(INVALID_PARAMS));
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"removeInstanceByName","params":["none"]}"#)
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], json!(POOL_ERROR));
        let resp = server.handle_line("{not json").await.unwrap();
        assert_eq!(resp["error"]["code"], json!(PARSE_ERROR));
    }

    #[tokio::test]
    async fn default_config_and_method() {
        let server = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"setDefaultTorConfig","params":[{"NewCircuitPeriod":10,"Log":"notice stdout"}]}"#)
            .await
            .unwrap();
        assert!(resp.get("error").is_none());
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"getDefaultTorConfig"}"#)
            .await
            .unwrap();
        assert_eq!(resp["result"]["NewCircuitPeriod"], json!("10"));

        assert!(server
            .handle_line(r#"{"jsonrpc":"2.0","method":"setLoadBalanceMethod","params":["weighted"]}"#)
            .await
            .is_none());
        assert_eq!(server.pool().load_balance_method(), LoadBalanceMethod::Weighted);
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"getLoadBalanceMethod"}"#)
            .await
            .unwrap();
        assert_eq!(resp["result"], json!("weighted"));
    }

    #[tokio::test]
    async fn overlong_line_closes_connection() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let server = Arc::new(server());
        let (client, conn) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(server.process(conn));
        let (reader, mut writer) = tokio::io::split(client);
        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"queryInstances\"}\n")
            .await
            .unwrap();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let resp: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(resp["id"], json!(7));

        // 不带换行持续写入, 服务端不应无限缓存
        tokio::spawn(async move {
            let chunk = vec![b'a'; 64 * 1024];
            for _ in 0..(MAX_LINE / chunk.len() + 4) {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        let result = tokio::time::timeout(std::time::Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProxyError::Extension(_))));
    }
}
