#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use pulseform_env_utils::option_env;
use pulseform_server::config::ServerConfig;

fn main() -> std::io::Result<()> {
    if let Err(e) = pulseform_logging::init(option_env("PULSEFORM_LOG_FILE").as_deref()) {
        eprintln!("Failed to initialize logging: {e:?}");
    }

    let config = ServerConfig::from_env()
        .and_then(|config| config.with_port_arg(std::env::args().nth(1)))
        .map_err(std::io::Error::other)?;

    log::debug!("Starting with {config:?}");

    actix_web::rt::System::with_tokio_rt(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    })
    .block_on(pulseform_server::run(config, None))
}
