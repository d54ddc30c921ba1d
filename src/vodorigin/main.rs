// SPDX-License-Identifier: GPL-2.0-or-later

mod app;
mod config;
mod logger;

use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "./configs/vodorigin.toml";

const HELP: &str = "\
vodorigin - adaptive streaming VOD origin

USAGE:
  vodorigin [--config <PATH>]

OPTIONS:
  --config <PATH>  Config file [default: ./configs/vodorigin.toml]
  -h, --help       Print help
";

#[tokio::main]
async fn main() {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print!("{HELP}");
        return;
    }
    let config: PathBuf = match args.opt_value_from_str("--config") {
        Ok(v) => v.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        Err(e) => {
            eprintln!("bad arguments: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app::run(&config).await {
        eprintln!("failed to run app: {e}");
        std::process::exit(1);
    }
}
