use clap::Parser;
use owo_colors::OwoColorize;
use std::io;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use warden_common::{Config, ReqwestProbe, RemediationTiming, SysinfoProcessTable, SystemRunner, Systemd};
use wardenctl::cli::Cli;
use wardenctl::{execute, Services, EXIT_OK, EXIT_USAGE};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let _ = e.print();
            process::exit(code);
        }
    };

    // Quiet by default so command output stays readable; RUST_LOG for detail
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            process::exit(EXIT_USAGE);
        }
    };

    let supervisor = Systemd::new(
        config.service.name.clone(),
        SystemRunner::new(Duration::from_secs(config.health.command_timeout_secs)),
    );
    let processes = SysinfoProcessTable;
    let http = ReqwestProbe::new(
        config.health.url.clone(),
        Duration::from_secs(config.health.http_timeout_secs),
    );
    let services = Services {
        supervisor: &supervisor,
        processes: &processes,
        http: &http,
    };

    let timing = RemediationTiming::from_config(&config.health);
    let mut stdout = io::stdout().lock();
    let code = match execute(cli.action(), &config, &services, timing, &mut stdout) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            EXIT_USAGE
        }
    };
    drop(stdout);
    process::exit(code);
}
