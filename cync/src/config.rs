use std::time::Duration;

use tokio::{fs, io};

use crate::{
    account::{DeviceDescriptor, SessionCredentials},
    controller::DEFAULT_TIMEOUT,
    network::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_SERVER_ADDR},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Parse config error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    /// 登录后得到的会话信息
    #[serde(default)]
    pub session: Option<SessionCredentials>,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 每次调用等待响应的超时，为 0 时使用默认值
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Server {
    pub fn connect_timeout(&self) -> Duration {
        match self.connect_timeout_secs {
            0 => DEFAULT_CONNECT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        match self.call_timeout_secs {
            0 => DEFAULT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            connect_timeout_secs: default_connect_timeout(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

fn default_addr() -> String {
    DEFAULT_SERVER_ADDR.into()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_call_timeout() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let s = fs::read_to_string(path).await?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }
}
