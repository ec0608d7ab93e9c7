use std::{
    fmt,
    num::ParseIntError,
    str::FromStr,
    sync::{PoisonError, RwLock},
};

use crate::{account::DeviceDescriptor, network::packet::StatusReport};

/// 设备在账号内的稳定 id
///
/// 同一个家庭的设备共享 `id / 1000`，`id % 1000` 为设备在 relay 内的索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// pipe 报文中使用的设备索引
    #[inline]
    pub fn index(&self) -> u16 {
        (self.0 % 1000) as u16
    }

    #[inline]
    pub fn mesh(&self) -> u64 {
        self.0 / 1000
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(DeviceId)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    /// 为 false 时 report 无意义，设备无法连通
    pub online: bool,
    pub report: StatusReport,
}

impl DeviceStatus {
    pub fn online(report: StatusReport) -> Self {
        Self {
            online: true,
            report,
        }
    }
}

/// 调用方持有的设备
///
/// 身份字段创建后不再改变；路由信息由 `RoutingTable` 维护
#[derive(Debug)]
pub struct LogicalDevice {
    id: DeviceId,
    /// 目录中记录的设备自身 relay 地址
    home_relay: u32,
    name: String,
    /// 最近一次成功查询到的状态，不会自动失效
    last_status: RwLock<DeviceStatus>,
}

impl LogicalDevice {
    pub fn new(id: DeviceId, home_relay: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            home_relay,
            name: name.into(),
            last_status: RwLock::new(DeviceStatus::default()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn home_relay(&self) -> u32 {
        self.home_relay
    }

    pub fn index(&self) -> u16 {
        self.id.index()
    }

    pub fn mesh(&self) -> u64 {
        self.id.mesh()
    }

    /// relay 就是设备自身，而不是中转设备
    pub fn is_own_relay(&self, relay: u32) -> bool {
        relay == self.home_relay
    }

    pub fn last_status(&self) -> DeviceStatus {
        *self
            .last_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, status: DeviceStatus) {
        *self
            .last_status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }
}

impl From<DeviceDescriptor> for LogicalDevice {
    fn from(descriptor: DeviceDescriptor) -> Self {
        LogicalDevice::new(descriptor.id, descriptor.switch_id, descriptor.name)
    }
}
