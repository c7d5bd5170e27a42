//! Cordatus Flash - provision Jetson-class boards from the command line
//!
//! Pick a device, release and storage; the tool fetches the vendor
//! archives, prepares the BSP and runs the vendor flashing script.

mod cli;
mod commands;

use clap::Parser;
use cordatus_flash::{config, log_error, log_info, logging};

use cli::Cli;

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    logging::set_log_level(cli.verbose);

    log_info!("main", "=== Cordatus Flash Starting ===");
    log_info!("main", "Version: {}", env!("CARGO_PKG_VERSION"));
    log_info!(
        "main",
        "OS: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    log_info!("main", "App: {}", config::app::NAME);

    let code = match commands::dispatch(cli).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            log_error!("main", "{}", e);
            eprintln!("Error: {}", e);
            2
        }
    };
    std::process::exit(code);
}
