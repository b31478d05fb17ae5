mod name_daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::name_daemon::{
    inspect_log, load_name_config, run_name_daemon, NameDaemonRunOptions,
    DEFAULT_NAME_CONFIG_PATH,
};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Run(NameDaemonRunOptions),
    Inspect { log: PathBuf, seq: usize },
}

fn usage() -> String {
    format!(
        "usage: dfs_daemon [--config <path>]\n\
         \x20      dfs_daemon inspect <log file> <record number>\n\
         defaults:\n\
         --config {}",
        DEFAULT_NAME_CONFIG_PATH
    )
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    if args.first().map(|a| a == "-h" || a == "--help").unwrap_or(false) {
        return Err(usage());
    }

    if args.first().map(|a| a == "inspect").unwrap_or(false) {
        let log = args
            .get(1)
            .ok_or_else(|| format!("missing log file\n{}", usage()))?;
        let seq = args
            .get(2)
            .ok_or_else(|| format!("missing record number\n{}", usage()))?
            .parse::<usize>()
            .map_err(|e| format!("bad record number: {}", e))?;
        if args.len() > 3 {
            return Err(format!("unknown argument: {}\n{}", args[3], usage()));
        }
        return Ok(Command::Inspect {
            log: PathBuf::from(log),
            seq,
        });
    }

    let mut options = NameDaemonRunOptions {
        config_path: PathBuf::from(DEFAULT_NAME_CONFIG_PATH),
    };
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                options.config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }
    Ok(Command::Run(options))
}

fn main() {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let command = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    match command {
        Command::Inspect { log, seq } => {
            env_logger::init();
            match inspect_log(&log, seq) {
                Ok(Some(record)) => println!("{}", record),
                Ok(None) => {
                    eprintln!("{}: no record {}", log.display(), seq);
                    std::process::exit(1);
                }
                Err(err) => {
                    eprintln!("inspect {} failed: {}", log.display(), err);
                    std::process::exit(1);
                }
            }
        }
        Command::Run(options) => {
            let config = match load_name_config(&options.config_path) {
                Ok(v) => v,
                Err(err) => {
                    eprintln!("load config failed: {}", err);
                    std::process::exit(1);
                }
            };
            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(config.log_level.as_str()),
            )
            .init();

            if let Err(err) = run_name_daemon(config) {
                error!("run dfs_daemon failed: {}", err);
                std::process::exit(1);
            }
        }
    }
}
