//! 设备路由表
//! 记录每个设备可以通过哪些 relay 到达，失败时轮转到下一个 relay

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{device::DeviceId, error::Error};

#[derive(Debug, Default)]
struct Route {
    /// 按发现顺序排列的 relay
    relays: Vec<u32>,
    /// 当前选中的 relay 下标
    cursor: usize,
}

/// 多个调用并发读写，锁只在查找/更新期间持有，不会跨越网络读写
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Mutex<HashMap<DeviceId, Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<DeviceId, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 通过 relay 成功到达设备
    ///
    /// 如果 relay 就是设备自身，它的响应最权威，直接选中
    pub fn record_success(&self, device: DeviceId, relay: u32, own_relay: bool) {
        let mut routes = self.routes();
        let route = routes.entry(device).or_default();

        let position = match route.relays.iter().position(|&r| r == relay) {
            Some(position) => position,
            None => {
                route.relays.push(relay);
                route.relays.len() - 1
            }
        };
        if own_relay {
            route.cursor = position;
        }
    }

    pub fn current_relay(&self, device: DeviceId) -> Result<u32, Error> {
        self.routes()
            .get(&device)
            .and_then(|route| route.relays.get(route.cursor).copied())
            .ok_or(Error::Unreachable)
    }

    /// 轮转到下一个 relay，返回新选中的 relay
    ///
    /// 没有退避，下一次调用立即使用新的 relay
    pub fn record_failure(&self, device: DeviceId) -> Option<u32> {
        let mut routes = self.routes();
        let route = routes.get_mut(&device)?;
        if route.relays.is_empty() {
            return None;
        }
        route.cursor = (route.cursor + 1) % route.relays.len();
        Some(route.relays[route.cursor])
    }

    /// 设备所有已知 relay，当前选中的排在最前
    pub fn relays(&self, device: DeviceId) -> Vec<u32> {
        match self.routes().get(&device) {
            Some(route) => {
                let mut relays = route.relays.clone();
                relays.rotate_left(route.cursor);
                relays
            }
            None => Vec::new(),
        }
    }

    /// 忘掉设备的所有路由
    pub fn forget(&self, device: DeviceId) {
        self.routes().remove(&device);
    }
}
