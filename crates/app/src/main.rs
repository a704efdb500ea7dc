mod cli;
mod service;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    service::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    if cli::handle_commands(&args)? {
        return Ok(());
    }
    anyhow::bail!(
        "Unknown command: {}\n\n{}",
        args.get(1).map(String::as_str).unwrap_or(""),
        service::SERVE_USAGE
    );
}
