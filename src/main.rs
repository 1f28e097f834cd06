mod args;

use args::Commands;
use clap::Parser;
use scanarium::command_log::CommandLogger;
use scanarium::config::Config;
use scanarium::context::Scanarium;
use scanarium::{generate, reindex, scan};

/// When invoked as a request handler, stdout has to carry an HTTP header
/// and the envelope is always delivered, even for failed scans.
fn is_request_handler() -> bool {
    std::env::var_os("REMOTE_ADDR").is_some()
}

fn main() -> anyhow::Result<()> {
    let args = args::TopLevelArgs::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(config_override) = &args.config_override {
        config.merge_override(Config::load(config_override)?);
    }
    let scanarium = Scanarium::new(config);

    match args.command {
        Commands::Scan(scan_args) => {
            let command_logger = CommandLogger::new(&scanarium)?;
            let envelope = scan::scan_once(&scanarium, &command_logger, scan_args.visualized_alpha)?;

            if is_request_handler() {
                println!("Content-Type: application/json\n");
                println!("{}", serde_json::to_string(&envelope)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&envelope)?);
                if envelope["is_ok"] == serde_json::json!(false) {
                    std::process::exit(1);
                }
            }
        }
        Commands::Generate(generate_args) => {
            generate::regenerate_static_content(
                &scanarium,
                generate_args.command.as_deref(),
                generate_args.parameter.as_deref(),
                Some(&generate_args.language),
                generate_args.force,
            )?;
        }
        Commands::Reindex => {
            reindex::reindex(&scanarium)?;
        }
    }

    Ok(())
}
