//! C by GE / Cync 灯光设备的 tcp 协议客户端
//!
//! 设备只能通过中转的 relay 访问。调用方只需指定逻辑设备，
//! 引擎负责选择 relay、失败轮转，以及把异步到达的响应报文匹配到对应的请求

use async_trait::async_trait;

pub use account::{DeviceDescriptor, SessionCredentials, StaticAccount};
pub use controller::{Controller, Step, SyncMode};
pub use device::{DeviceId, DeviceStatus, LogicalDevice};
pub use error::{Error, Result};
pub use network::{
    packet::{Packet, PacketType, StatusReport},
    Dialer, TcpDialer,
};
pub use routing::RoutingTable;

pub mod account;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod network;
pub mod routing;

/// 账号服务，由外部实现（例如 https 登录接口）
#[async_trait]
pub trait Account: Send + Sync + 'static {
    /// 登录，获取新的会话凭证
    async fn login(&self) -> Result<SessionCredentials, account::Error>;
    /// 列出账号下的设备
    async fn devices(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<Vec<DeviceDescriptor>, account::Error>;
}
