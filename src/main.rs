mod cli;
mod config;
mod models;
mod protocol;
mod retrievers;
mod search_worker;
mod service_manager;
mod thumbnail_cache;
mod worker_pool;

use clap::Parser;
use log::{error, LevelFilter};

use cli::Args;

/// Third-party crates that are noisy below warn.
const QUIET_MODULES: [&str; 4] = ["ureq", "rustls", "html5ever", "selectors"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut clog = colog::default_builder();
    clog.filter(None, args.log_level);
    for module in QUIET_MODULES {
        clog.filter(Some(module), LevelFilter::Warn.min(args.log_level));
    }
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };
    let config = config::load_or_create(&config_path)?;

    if let Err(err) = cli::run_with_config(&args, config) {
        error!("{}", err);
        return Err(err.into());
    }
    Ok(())
}
