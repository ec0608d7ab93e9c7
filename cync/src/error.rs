use std::sync::Arc;

use crate::{
    account, config,
    device::DeviceId,
    network::{conn, packet},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] conn::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("Account error: {0}")]
    Account(#[from] account::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
    #[error("The server returned with an error")]
    RemoteCall,
    #[error("The device cannot be reached")]
    Unreachable,
    #[error("Timeout waiting for response")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("No status record for device in response")]
    MissingStatus,
    /// 批量调用中多个设备共享的同一个错误
    #[error(transparent)]
    Shared(Arc<Error>),
    #[error("{operation} {device}: {source}")]
    Device {
        operation: &'static str,
        device: DeviceId,
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn context(self, operation: &'static str, device: DeviceId) -> Self {
        Error::Device {
            operation,
            device,
            source: Box::new(self),
        }
    }

    /// 去掉上下文后的原始错误
    pub fn root(&self) -> &Error {
        match self {
            Error::Device { source, .. } => source.root(),
            Error::Shared(e) => e.root(),
            e => e,
        }
    }

    /// 超时无法确定远端是否已执行命令，需要重新查询状态确认
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout)
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self.root(), Error::Unreachable)
    }
}
