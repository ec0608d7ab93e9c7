//! 账号服务边界
//!
//! 登录与设备目录由外部的 https 接口提供，这里只定义引擎需要的数据

use async_trait::async_trait;

use crate::{config::Config, device::DeviceId, Account};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Login rejected: {0}")]
    Rejected(String),
    #[error("Account service unavailable: {0}")]
    Unavailable(String),
}

/// 会话凭证，重新登录时整体替换
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SessionCredentials {
    /// 账号 id
    pub user_id: u32,
    /// tcp 认证令牌
    pub authorize: String,
    /// https 接口使用的 bearer 令牌
    #[serde(default)]
    pub access_token: String,
}

/// 设备目录中的一项
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    /// 设备自身的 relay 地址
    pub switch_id: u32,
    #[serde(default)]
    pub name: String,
}

/// 从配置中提供固定的凭证和设备目录
#[derive(Debug, Clone, Default)]
pub struct StaticAccount {
    credentials: Option<SessionCredentials>,
    devices: Vec<DeviceDescriptor>,
}

impl StaticAccount {
    pub fn new(credentials: Option<SessionCredentials>, devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            credentials,
            devices,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.session.clone(), cfg.devices.clone())
    }
}

#[async_trait]
impl Account for StaticAccount {
    async fn login(&self) -> Result<SessionCredentials, Error> {
        self.credentials
            .clone()
            .ok_or_else(|| Error::Rejected("no session configured".into()))
    }

    async fn devices(&self, _credentials: &SessionCredentials) -> Result<Vec<DeviceDescriptor>, Error> {
        Ok(self.devices.clone())
    }
}
