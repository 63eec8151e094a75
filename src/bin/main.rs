use ripple_rs::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let _telemetry_guard = init_tracing(cli.verbose);

    if let Err(e) = cli::run(cli) {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) -> telemetry::TelemetryGuard {
    let cfg = config::load().unwrap_or_default();
    telemetry::init(telemetry::TelemetryConfig::new(verbose, cfg.logging))
}
