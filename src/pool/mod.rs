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
// Created Date: 2024/03/08 09:30:12

mod balance;
mod definition;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use futures::future::join_all;
use tokio::sync::broadcast;

pub use self::balance::{LoadBalanceMethod, WeightedCache};
pub use self::definition::{InstanceDefinition, TorConfig};

use crate::{
    backend::{BackendPorts, BackendProcess, Launcher},
    helper::PortAllocator,
    ProxyError, ProxyResult,
};

struct PoolInner {
    /// 已就绪的实例, 顺序用于轮询
    instances: Vec<Arc<BackendProcess>>,
    /// 启动中的实例
    pending: Vec<Arc<BackendProcess>>,
    /// 创建中已占用的名称
    reserved_names: HashSet<String>,
    load_balance_method: LoadBalanceMethod,
    default_config: TorConfig,
    weighted: Option<WeightedCache>,
}

impl PoolInner {
    fn name_taken(&self, name: &str) -> bool {
        self.reserved_names.contains(name)
            || self
                .instances
                .iter()
                .chain(self.pending.iter())
                .any(|p| p.name().as_deref() == Some(name))
    }

    /// 实例结构发生变化时调用
    fn invalidate(&mut self) {
        self.weighted = None;
    }

    fn position_by_name(&self, name: &str) -> Option<usize> {
        self.instances
            .iter()
            .position(|p| p.name().as_deref() == Some(name))
    }
}

/// 实例池, 负责实例的创建销毁及负载均衡
pub struct InstancePool {
    launcher: Arc<dyn Launcher>,
    parent_data_directory: PathBuf,
    ports: &'static PortAllocator,
    inner: Mutex<PoolInner>,
    created: broadcast::Sender<Arc<BackendProcess>>,
}

impl InstancePool {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        parent_data_directory: PathBuf,
        default_config: TorConfig,
        load_balance_method: LoadBalanceMethod,
    ) -> Arc<InstancePool> {
        let (created, _) = broadcast::channel(64);
        Arc::new(InstancePool {
            launcher,
            parent_data_directory,
            ports: PortAllocator::global(),
            inner: Mutex::new(PoolInner {
                instances: vec![],
                pending: vec![],
                reserved_names: HashSet::new(),
                load_balance_method,
                default_config,
                weighted: None,
            }),
            created,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn parent_data_directory(&self) -> &Path {
        &self.parent_data_directory
    }

    /// 新实例就绪时的通知
    pub fn subscribe_created(&self) -> broadcast::Receiver<Arc<BackendProcess>> {
        self.created.subscribe()
    }

    /// 正在等待新实例就绪的连接数
    pub fn waiting_count(&self) -> usize {
        self.created.receiver_count()
    }

    pub fn default_config(&self) -> TorConfig {
        self.lock().default_config.clone()
    }

    pub fn set_default_config(&self, config: TorConfig) {
        self.lock().default_config = config;
    }

    pub fn load_balance_method(&self) -> LoadBalanceMethod {
        self.lock().load_balance_method
    }

    pub fn set_load_balance_method(&self, method: LoadBalanceMethod) {
        let mut inner = self.lock();
        inner.load_balance_method = method;
        inner.invalidate();
    }

    /// 创建指定数量的匿名实例
    pub async fn create_count(
        self: &Arc<Self>,
        count: usize,
    ) -> ProxyResult<Vec<Arc<BackendProcess>>> {
        self.create(vec![InstanceDefinition::new(); count]).await
    }

    /// 并发创建实例, 每个实例就绪后立即加入实例池
    ///
    /// 名称冲突或者权重不合法时整批不创建, 单个实例失败不影响其它实例
    pub async fn create(
        self: &Arc<Self>,
        definitions: Vec<InstanceDefinition>,
    ) -> ProxyResult<Vec<Arc<BackendProcess>>> {
        for def in &definitions {
            def.validate()?;
        }
        {
            let mut inner = self.lock();
            let mut batch = HashSet::new();
            for def in &definitions {
                if let Some(name) = def.name() {
                    if inner.name_taken(name) || !batch.insert(name.to_string()) {
                        return Err(ProxyError::DuplicateName(name.to_string()));
                    }
                }
            }
            inner.reserved_names.extend(batch);
        }

        let futs = definitions.into_iter().enumerate().map(|(idx, def)| {
            let key = def.name().map(|s| s.to_string()).unwrap_or(format!("#{}", idx));
            async move { (key, self.create_one(def).await) }
        });
        ProxyError::collect_batch(join_all(futs).await)
    }

    async fn create_one(
        self: &Arc<Self>,
        definition: InstanceDefinition,
    ) -> ProxyResult<Arc<BackendProcess>> {
        let name = definition.name().map(|s| s.to_string());
        let result = self.spawn_and_wait(definition).await;
        if result.is_err() {
            if let Some(name) = &name {
                self.lock().reserved_names.remove(name);
            }
        }
        result
    }

    async fn spawn_and_wait(
        self: &Arc<Self>,
        definition: InstanceDefinition,
    ) -> ProxyResult<Arc<BackendProcess>> {
        let allocated = self.ports.allocate(&[false, true, false])?;
        let ports = BackendPorts {
            proxy_port: allocated[0],
            dns_port: allocated[1],
            control_port: allocated[2],
        };
        let default_config = self.default_config();
        let process = match BackendProcess::create(
            &*self.launcher,
            definition,
            &default_config,
            &self.parent_data_directory,
            ports,
        )
        .await
        {
            Ok(process) => process,
            Err(e) => {
                self.ports.release(&allocated);
                return Err(e);
            }
        };

        let pool = Arc::downgrade(self);
        process.on_exit(move |process| {
            if let Some(pool) = pool.upgrade() {
                pool.evict(process);
            }
        });

        self.lock().pending.push(process.clone());
        let mut ready = process.wait_ready().await;
        {
            let mut inner = self.lock();
            inner.pending.retain(|p| !Arc::ptr_eq(p, &process));
            if ready.is_ok() && process.is_exiting() {
                ready = Err(ProxyError::CreationError(format!(
                    "{} exited before ready",
                    process.id()
                )));
            }
            if ready.is_ok() {
                inner.instances.push(process.clone());
                if let Some(name) = process.name() {
                    inner.reserved_names.remove(&name);
                }
                inner.invalidate();
            }
        }

        match ready {
            Ok(()) => {
                let _ = self.created.send(process.clone());
                Ok(process)
            }
            Err(e) => {
                log::error!("实例{}创建失败: {}", process.id(), e);
                process.exit().await;
                Err(e)
            }
        }
    }

    /// 进程退出时同步调用, 实例池中不会留下已退出的实例
    fn evict(&self, process: &BackendProcess) {
        let evicted = {
            let mut inner = self.lock();
            inner.pending.retain(|p| p.id() != process.id());
            let len = inner.instances.len();
            inner.instances.retain(|p| p.id() != process.id());
            let evicted = len != inner.instances.len();
            if evicted {
                inner.invalidate();
            }
            evicted
        };
        if evicted {
            log::warn!("实例{}意外退出, 已从实例池中移除", process.id());
        }
        self.ports.release(&process.ports().as_vec());
    }

    /// 已就绪的实例
    pub fn instances(&self) -> Vec<Arc<BackendProcess>> {
        self.lock().instances.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().instances.is_empty()
    }

    pub fn instance_by_name(&self, name: &str) -> Option<Arc<BackendProcess>> {
        let inner = self.lock();
        inner
            .position_by_name(name)
            .map(|idx| inner.instances[idx].clone())
    }

    /// 包括启动中的实例
    pub fn find_by_name(&self, name: &str) -> Option<Arc<BackendProcess>> {
        let inner = self.lock();
        inner
            .instances
            .iter()
            .chain(inner.pending.iter())
            .find(|p| p.name().as_deref() == Some(name))
            .cloned()
    }

    pub fn instance_at(&self, index: usize) -> Option<Arc<BackendProcess>> {
        self.lock().instances.get(index).cloned()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.lock()
            .instances
            .iter()
            .filter_map(|p| p.name())
            .collect()
    }

    /// 由实例的分组推导出的索引
    pub fn groups(&self) -> BTreeMap<String, Vec<Arc<BackendProcess>>> {
        let mut groups: BTreeMap<String, Vec<Arc<BackendProcess>>> = BTreeMap::new();
        for process in self.lock().instances.iter() {
            for group in process.definition().group {
                groups.entry(group).or_default().push(process.clone());
            }
        }
        groups
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for process in self.lock().instances.iter() {
            names.extend(process.definition().group);
        }
        names.into_iter().collect()
    }

    pub fn instances_by_group(&self, group: &str) -> Vec<Arc<BackendProcess>> {
        self.lock()
            .instances
            .iter()
            .filter(|p| p.in_group(group))
            .cloned()
            .collect()
    }

    fn require_group(&self, group: &str) -> ProxyResult<Vec<Arc<BackendProcess>>> {
        let members = self.instances_by_group(group);
        if members.is_empty() {
            return Err(ProxyError::GroupNotFound(group.to_string()));
        }
        Ok(members)
    }

    fn require_name(&self, name: &str) -> ProxyResult<Arc<BackendProcess>> {
        self.instance_by_name(name)
            .ok_or_else(|| ProxyError::InstanceNotFound(name.to_string()))
    }

    fn require_at(&self, index: usize) -> ProxyResult<Arc<BackendProcess>> {
        self.instance_at(index)
            .ok_or_else(|| ProxyError::InstanceNotFound(format!("#{}", index)))
    }

    /// 按负载均衡方式调整顺序, 返回新的第一个实例
    pub fn next(&self) -> Option<Arc<BackendProcess>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.instances.is_empty() {
            return None;
        }
        match inner.load_balance_method {
            LoadBalanceMethod::RoundRobin => inner.instances.rotate_left(1),
            LoadBalanceMethod::Weighted => {
                if inner.weighted.is_none() {
                    inner.weighted = WeightedCache::build(
                        inner
                            .instances
                            .iter()
                            .map(|p| (p.id().to_string(), p.weight())),
                    )
                    .ok();
                }
                let picked = inner.weighted.as_ref().and_then(|cache| {
                    let id = cache.pick(&mut rand::thread_rng());
                    inner.instances.iter().position(|p| p.id() == id)
                });
                match picked {
                    Some(pos) => inner.instances.rotate_left(pos),
                    // 权重缓存无法建立时退化为轮询
                    None => inner.instances.rotate_left(1),
                }
            }
        }
        inner.instances.first().cloned()
    }

    /// 仅在分组内部轮询, 其它实例的位置不变
    pub fn next_by_group(&self, group: &str) -> ProxyResult<Arc<BackendProcess>> {
        let mut inner = self.lock();
        let positions: Vec<usize> = inner
            .instances
            .iter()
            .enumerate()
            .filter(|(_, p)| p.in_group(group))
            .map(|(idx, _)| idx)
            .collect();
        if positions.is_empty() {
            return Err(ProxyError::GroupNotFound(group.to_string()));
        }
        for w in positions.windows(2) {
            inner.instances.swap(w[0], w[1]);
        }
        Ok(inner.instances[positions[0]].clone())
    }

    async fn exit_all(processes: Vec<Arc<BackendProcess>>) {
        join_all(processes.iter().map(|p| p.exit())).await;
    }

    /// 移除最前面的`count`个实例
    pub async fn remove(&self, count: usize) -> ProxyResult<()> {
        let removed = {
            let mut inner = self.lock();
            let count = count.min(inner.instances.len());
            let removed: Vec<_> = inner.instances.drain(..count).collect();
            inner.invalidate();
            removed
        };
        Self::exit_all(removed).await;
        Ok(())
    }

    pub async fn remove_at(&self, index: usize) -> ProxyResult<()> {
        let removed = {
            let mut inner = self.lock();
            if index >= inner.instances.len() {
                return Err(ProxyError::InstanceNotFound(format!("#{}", index)));
            }
            let removed = inner.instances.remove(index);
            inner.invalidate();
            removed
        };
        removed.exit().await;
        Ok(())
    }

    pub async fn remove_by_name(&self, name: &str) -> ProxyResult<()> {
        let removed = {
            let mut inner = self.lock();
            let index = inner
                .position_by_name(name)
                .ok_or_else(|| ProxyError::InstanceNotFound(name.to_string()))?;
            let removed = inner.instances.remove(index);
            inner.invalidate();
            removed
        };
        removed.exit().await;
        Ok(())
    }

    /// 关闭所有实例, 包括启动中的
    pub async fn exit(&self) {
        let all = {
            let mut inner = self.lock();
            let mut all: Vec<_> = inner.instances.drain(..).collect();
            all.extend(inner.pending.drain(..));
            inner.invalidate();
            all
        };
        log::info!("正在关闭{}个实例", all.len());
        Self::exit_all(all).await;
    }

    pub fn add_instance_to_group_by_name(&self, group: &str, name: &str) -> ProxyResult<()> {
        self.require_name(name)?
            .update_definition(|d| d.add_group(group));
        Ok(())
    }

    pub fn add_instance_to_group_at(&self, group: &str, index: usize) -> ProxyResult<()> {
        self.require_at(index)?
            .update_definition(|d| d.add_group(group));
        Ok(())
    }

    pub fn remove_instance_from_group_by_name(&self, group: &str, name: &str) -> ProxyResult<()> {
        self.require_name(name)?
            .update_definition(|d| d.remove_group(group));
        Ok(())
    }

    pub fn remove_instance_from_group_at(&self, group: &str, index: usize) -> ProxyResult<()> {
        self.require_at(index)?
            .update_definition(|d| d.remove_group(group));
        Ok(())
    }

    /// 并发执行, 所有调用都会执行, 任一失败则返回Batch错误
    async fn fan_out<F, Fut, T>(targets: Vec<Arc<BackendProcess>>, func: F) -> ProxyResult<Vec<T>>
    where
        F: Fn(Arc<BackendProcess>) -> Fut,
        Fut: Future<Output = ProxyResult<T>>,
    {
        let futs = targets.into_iter().map(|p| {
            let key = p.name().unwrap_or_else(|| p.id().to_string());
            let fut = func(p);
            async move { (key, fut.await) }
        });
        ProxyError::collect_batch(join_all(futs).await)
    }

    async fn apply_config(process: Arc<BackendProcess>, config: TorConfig) -> ProxyResult<()> {
        for (key, value) in &config {
            process.set_config(key, value).await?;
        }
        Ok(())
    }

    pub async fn set_config_all(&self, key: &str, value: &str) -> ProxyResult<()> {
        Self::fan_out(self.instances(), |p| async move { p.set_config(key, value).await }).await?;
        Ok(())
    }

    pub async fn set_config_by_group(&self, group: &str, key: &str, value: &str) -> ProxyResult<()> {
        let members = self.require_group(group)?;
        Self::fan_out(members, |p| async move { p.set_config(key, value).await }).await?;
        Ok(())
    }

    pub async fn set_config_by_name(&self, name: &str, key: &str, value: &str) -> ProxyResult<()> {
        self.require_name(name)?.set_config(key, value).await
    }

    pub async fn set_config_at(&self, index: usize, key: &str, value: &str) -> ProxyResult<()> {
        self.require_at(index)?.set_config(key, value).await
    }

    /// 将多个配置项应用到所有实例
    pub async fn set_tor_config(&self, config: &TorConfig) -> ProxyResult<()> {
        Self::fan_out(self.instances(), |p| Self::apply_config(p, config.clone())).await?;
        Ok(())
    }

    pub async fn set_tor_config_by_group(&self, group: &str, config: &TorConfig) -> ProxyResult<()> {
        let members = self.require_group(group)?;
        Self::fan_out(members, |p| Self::apply_config(p, config.clone())).await?;
        Ok(())
    }

    pub async fn get_config_by_name(&self, name: &str, key: &str) -> ProxyResult<Vec<String>> {
        self.require_name(name)?.get_config(key).await
    }

    pub async fn get_config_at(&self, index: usize, key: &str) -> ProxyResult<Vec<String>> {
        self.require_at(index)?.get_config(key).await
    }

    pub async fn signal_all(&self, signal: &str) -> ProxyResult<()> {
        Self::fan_out(self.instances(), |p| async move { p.signal(signal).await }).await?;
        Ok(())
    }

    pub async fn signal_by_group(&self, group: &str, signal: &str) -> ProxyResult<()> {
        let members = self.require_group(group)?;
        Self::fan_out(members, |p| async move { p.signal(signal).await }).await?;
        Ok(())
    }

    pub async fn signal_by_name(&self, name: &str, signal: &str) -> ProxyResult<()> {
        self.require_name(name)?.signal(signal).await
    }

    pub async fn signal_at(&self, index: usize, signal: &str) -> ProxyResult<()> {
        self.require_at(index)?.signal(signal).await
    }

    /// 所有实例更换身份
    pub async fn new_identites(&self) -> ProxyResult<()> {
        Self::fan_out(self.instances(), |p| async move { p.new_identity().await }).await?;
        Ok(())
    }

    pub async fn new_identities_by_group(&self, group: &str) -> ProxyResult<()> {
        let members = self.require_group(group)?;
        Self::fan_out(members, |p| async move { p.new_identity().await }).await?;
        Ok(())
    }

    pub async fn new_identity_by_name(&self, name: &str) -> ProxyResult<()> {
        self.require_name(name)?.new_identity().await
    }

    pub async fn new_identity_at(&self, index: usize) -> ProxyResult<()> {
        self.require_at(index)?.new_identity().await
    }
}
