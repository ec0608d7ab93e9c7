//! 网络层
//! 本层只关心报文编解码与连接读写，不包含设备路由相关逻辑

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

pub use conn::Connection;

pub mod conn;
pub mod packet;

/// 服务端默认地址
pub const DEFAULT_SERVER_ADDR: &str = "cm.gelighting.com:23778";
/// 默认连接超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 建立到服务端的连接
///
/// 生产环境使用 [`TcpDialer`]，测试时可以替换为内存中的模拟服务端
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self) -> Result<Connection<Self::Stream>, conn::Error>;
}

#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_ADDR, DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> Result<Connection<TcpStream>, conn::Error> {
        Connection::connect(&self.addr, self.connect_timeout).await
    }
}
