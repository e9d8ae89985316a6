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
// Created Date: 2024/03/12 16:41:08

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::BytesMut;
use futures::future::join_all;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::Record,
};
use tokio::net::{TcpStream, UdpSocket};

use crate::{
    router::{ConnectionRouter, Proto},
    ProxyError, ProxyResult,
};

/// 单个udp包的最大长度
pub const MAX_DNS_PACKET: usize = 4096;

/// dns请求不带用户名, 总是按默认策略选择实例
pub struct ProxyDns {
    router: Arc<ConnectionRouter>,
    timeout: Duration,
}

impl ProxyDns {
    pub fn new(router: Arc<ConnectionRouter>, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    /// 向实例的dns端口查询单个问题, 超时或失败返回空
    pub async fn query_upstream(upstream: SocketAddr, query: Query, timeout: Duration) -> Vec<Record> {
        let name = query.name().to_string();
        let result = tokio::time::timeout(timeout, async {
            let mut request = Message::new();
            request
                .set_id(rand::random())
                .set_message_type(MessageType::Query)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(true)
                .add_query(query);
            let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
            socket.connect(upstream).await?;
            socket.send(&request.to_vec()?).await?;
            let mut buf = vec![0u8; MAX_DNS_PACKET];
            loop {
                let n = socket.recv(&mut buf).await?;
                let mut response = Message::from_vec(&buf[..n])?;
                // 忽略不匹配的旧回复
                if response.id() == request.id() {
                    return Ok::<_, ProxyError>(response.take_answers());
                }
            }
        })
        .await;
        match result {
            Ok(Ok(answers)) => answers,
            Ok(Err(e)) => {
                log::debug!("[dns] 查询{}失败: {}", name, e);
                vec![]
            }
            Err(_) => {
                log::debug!("[dns] 查询{}超时", name);
                vec![]
            }
        }
    }

    /// 处理一个请求包, 返回回复包
    pub async fn handle(&self, data: &[u8], source: SocketAddr) -> ProxyResult<Vec<u8>> {
        let request = Message::from_vec(data)?;
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true)
            .add_queries(request.queries().to_vec());

        let mut pending = BytesMut::new();
        // 没有客户端连接可以取消等待, 等待实例最多一个超时时间
        let routed = tokio::time::timeout(
            self.timeout,
            self.router
                .route(source, Proto::Dns, None, None::<&mut TcpStream>, &mut pending),
        )
        .await
        .unwrap_or(Err(ProxyError::UpstreamUnavailable));
        let instance = match routed {
            Ok(instance) => instance,
            Err(e) => {
                log::info!("[dns] {} 无法选择实例: {}", source, e);
                response.set_response_code(ResponseCode::ServFail);
                return Ok(response.to_vec()?);
            }
        };

        let upstream = instance.ports().dns_addr();
        let answers = join_all(
            request
                .queries()
                .iter()
                .map(|q| Self::query_upstream(upstream, q.clone(), self.timeout)),
        )
        .await;
        response
            .set_response_code(ResponseCode::NoError)
            .add_answers(answers.into_iter().flatten());
        log::trace!(
            "[dns] {} 查询{}个问题, 回复{}条记录",
            source,
            request.queries().len(),
            response.answers().len()
        );
        Ok(response.to_vec()?)
    }

    /// 循环接收请求, 每个请求单独处理
    pub async fn serve(self: Arc<Self>, socket: Arc<UdpSocket>) -> ProxyResult<()> {
        let mut buf = vec![0u8; MAX_DNS_PACKET];
        loop {
            let (n, source) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("[dns] 接收请求失败: {}", e);
                    continue;
                }
            };
            let data = buf[..n].to_vec();
            let dns = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                match dns.handle(&data, source).await {
                    Ok(reply) => {
                        if let Err(e) = socket.send_to(&reply, source).await {
                            log::debug!("[dns] 回复{}失败: {}", source, e);
                        }
                    }
                    Err(e) => log::debug!("[dns] {} 无效的请求: {}", source, e),
                }
            });
        }
    }
}
