use analytics::{
    cli::{CLI, emit_error_report},
    initializers::init_tracing,
};
use clap::Parser;
use std::time::Instant;

#[tokio::main]
async fn main() {
    let started_at = Instant::now();
    let CLI { opts, command } = CLI::parse();
    init_tracing(&opts);

    if let Err(error) = command.run(&opts).await {
        emit_error_report(
            opts.json,
            opts.retry_attempts,
            started_at,
            &error,
            opts.report_file.as_deref(),
        );
        std::process::exit(1);
    }
}
