use anyhow::Result;

use crate::service;

/// Dispatch the command line. Returns `true` when a command was handled.
pub fn handle_commands(args: &[String]) -> Result<bool> {
    match args.get(1).map(|s| s.as_str()) {
        Some("help" | "--help" | "-h") => {
            println!("{}", service::SERVE_USAGE);
            Ok(true)
        }
        // `serve` is the default; bare flags imply it.
        Some("serve") | None => {
            let config = service::ServeConfig::from_args(args)?;
            service::run(config)?;
            Ok(true)
        }
        Some(flag) if flag.starts_with("--") => {
            let config = service::ServeConfig::from_args(args)?;
            service::run(config)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
