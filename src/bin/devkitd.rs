//! Daemon entry point.
//!
//! Loads configuration and brings up the async runtime this daemon's job
//! engine, mount handlers, and RPC router all run on. Wiring in the
//! concrete `DeviceRegistry`/`AuthService`/`MountLedger`/`ChangeNotifier`
//! implementations (the D-Bus/system-bus glue this crate does not own,
//! per spec.md's Out-of-scope list) is the enclosing daemon's job; this
//! binary only proves the core starts up cleanly against its config file.

use std::path::PathBuf;

use anyhow::Error;

use devkitd::config::DkConfig;

const DEFAULT_CONFIG_PATH: &str = "/etc/devkitd/devkitd.toml";

#[tokio::main]
async fn main() -> Result<(), Error> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if config_path.exists() {
        DkConfig::load(&config_path)?
    } else {
        log::warn!("no config file at {:?}, using built-in defaults", config_path);
        DkConfig::default()
    };

    log::info!(
        "devkitd starting: media_root={:?} partition_wait_secs={}",
        config.media_root,
        config.partition_wait_secs,
    );

    tokio::signal::ctrl_c().await?;
    log::info!("devkitd shutting down");

    Ok(())
}
