#![deny(unsafe_op_in_unsafe_fn)]

use clap::Parser;

mod config;
mod error;
mod run;

use config::{Args, RunConfig};

fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::try_init();

    let result = RunConfig::from_args(Args::parse()).and_then(|config| run::run(&config));
    match result {
        Ok(summary) => log::info!("Done: {}", summary),
        Err(error) => {
            log::error!("ERROR: {}", error);
            std::process::exit(1);
        }
    }
}
