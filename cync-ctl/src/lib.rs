//! cync-ctl：在命令行中查询和控制灯光设备

use std::{io::ErrorKind, sync::Arc};

use clap::{Parser, Subcommand, ValueEnum};
use cync::{
    config::{self, Config},
    controller::DEFAULT_BLAST_RELAYS,
    Controller, DeviceId, LogicalDevice, SessionCredentials, StaticAccount, SyncMode,
};
use log::{info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 未指定配置文件时使用的路径，文件不存在时使用默认配置
pub const DEFAULT_CONFIG_PATH: &str = "cync.toml";

#[derive(Debug, Parser)]
#[clap(name = "cync-ctl", version, about = "Control C by GE / Cync lights")]
pub struct Cli {
    /// 配置文件路径
    #[clap(long, short)]
    pub config: Option<String>,
    /// 只等待确认，不等待状态同步
    #[clap(long = "async")]
    pub no_wait: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 列出所有设备及状态
    List,
    /// 查询设备状态
    Status { id: DeviceId },
    On { id: DeviceId },
    Off { id: DeviceId },
    /// 设置亮度 [1, 100]
    Brightness { id: DeviceId, value: u8 },
    /// 设置色温 [0, 100]
    Tone { id: DeviceId, value: u8 },
    Rgb { id: DeviceId, r: u8, g: u8, b: u8 },
    /// 通过多个 relay 同时开关多个设备
    Blast {
        #[clap(value_enum)]
        power: Power,
        #[clap(required = true)]
        ids: Vec<DeviceId>,
        /// 每个设备最多使用的 relay 数
        #[clap(long, default_value_t = DEFAULT_BLAST_RELAYS)]
        relays: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Power {
    On,
    Off,
}

/// `CYNC_` 前缀的环境变量，优先级高于配置文件
#[derive(Debug, Default, serde::Deserialize)]
pub struct Env {
    pub config: Option<String>,
    pub server: Option<String>,
    pub user_id: Option<u32>,
    pub authorize: Option<String>,
}

impl Env {
    pub fn load() -> Result<Self, envy::Error> {
        envy::prefixed("CYNC_").from_env::<Env>()
    }

    pub fn apply(&self, cfg: &mut Config) {
        if let Some(addr) = &self.server {
            cfg.server.addr = addr.clone();
        }
        match (self.user_id, &self.authorize) {
            (Some(user_id), Some(authorize)) => {
                cfg.session = Some(SessionCredentials {
                    user_id,
                    authorize: authorize.clone(),
                    access_token: String::new(),
                })
            }
            // 只覆盖配置中已有会话的部分字段
            (user_id, authorize) => {
                if let Some(session) = cfg.session.as_mut() {
                    if let Some(user_id) = user_id {
                        session.user_id = user_id;
                    }
                    if let Some(authorize) = authorize {
                        session.authorize = authorize.clone();
                    }
                }
            }
        }
    }
}

pub async fn run(cli: Cli, env: Env) -> Result<(), BoxError> {
    let cfg = load_config(cli.config.as_deref().or(env.config.as_deref()), &env).await?;
    let mode = if cli.no_wait {
        SyncMode::Async
    } else {
        SyncMode::Sync
    };

    let account = Arc::new(StaticAccount::from_config(&cfg));
    let controller = Controller::login(&cfg.server, account).await?;
    let devices = controller.enumerate_devices().await?;
    info!("{} device(s) in account", devices.len());

    let find = |id: DeviceId| {
        controller
            .find_device(id)
            .ok_or_else(|| BoxError::from(format!("unknown device {}", id)))
    };

    match cli.command {
        Command::List => {
            for device in devices.iter() {
                println!("{}", describe(device));
            }
        }
        Command::Status { id } => {
            let device = find(id)?;
            controller.query_status(&device).await?;
            println!("{}", describe(&device));
        }
        Command::On { id } => controller.set_on_off(&*find(id)?, true, mode).await?,
        Command::Off { id } => controller.set_on_off(&*find(id)?, false, mode).await?,
        Command::Brightness { id, value } => {
            if !(1..=100).contains(&value) {
                return Err(format!("brightness must be in [1, 100], got {}", value).into());
            }
            controller.set_brightness(&*find(id)?, value, mode).await?
        }
        Command::Tone { id, value } => {
            if value > 100 {
                return Err(format!("color tone must be in [0, 100], got {}", value).into());
            }
            controller.set_color_tone(&*find(id)?, value, mode).await?
        }
        Command::Rgb { id, r, g, b } => controller.set_rgb(&*find(id)?, (r, g, b), mode).await?,
        Command::Blast { power, ids, relays } => {
            let targets = ids.into_iter().map(&find).collect::<Result<Vec<_>, _>>()?;
            let results = controller
                .blast_on_off(&targets, power == Power::On, relays)
                .await;
            let mut failed = 0;
            for (device, res) in targets.iter().zip(results) {
                match res {
                    Ok(()) => println!("{:>12}  ok", device.id()),
                    Err(e) => {
                        failed += 1;
                        println!("{:>12}  {}", device.id(), e);
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{} device(s) failed", failed).into());
            }
        }
    }
    Ok(())
}

async fn load_config(path: Option<&str>, env: &Env) -> Result<Config, BoxError> {
    let mut cfg = match path {
        Some(path) => Config::from_path(path).await?,
        None => match Config::from_path(DEFAULT_CONFIG_PATH).await {
            Ok(cfg) => cfg,
            Err(config::Error::IO(e)) if e.kind() == ErrorKind::NotFound => {
                warn!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
                Config::default()
            }
            Err(e) => return Err(e.into()),
        },
    };
    env.apply(&mut cfg);
    Ok(cfg)
}

/// 一行设备描述
pub fn describe(device: &LogicalDevice) -> String {
    let status = device.last_status();
    let head = format!("{:>12}  {:<20}", device.id(), device.name());
    if !status.online {
        return format!("{} offline", head);
    }

    let report = status.report;
    let color = if report.uses_rgb {
        format!(
            "rgb({}, {}, {})",
            report.rgb[0], report.rgb[1], report.rgb[2]
        )
    } else {
        format!("tone {}", report.color_tone)
    };
    format!(
        "{} {} brightness {} {}",
        head,
        if report.is_on { "on" } else { "off" },
        report.brightness,
        color
    )
}
