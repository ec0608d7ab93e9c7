use clap::Parser;
use cync_ctl::{Cli, Env};
use flexi_logger::Logger;
use log::error;

#[tokio::main]
async fn main() {
    // 日志级别可由 RUST_LOG 覆盖
    let _logger = match Logger::try_with_env_or_str("info").and_then(|logger| logger.start()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("failed to start logger: {}", e);
            None
        }
    };

    let cli = Cli::parse();
    let env = match Env::load() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("invalid CYNC_ environment: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = cync_ctl::run(cli, env).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
