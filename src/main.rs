use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use spf_milter::config::{Config, ListenAddr, DEFAULT_CONFIG_PATH};
use spf_milter::daemon;
use spf_milter::milter::{Listener, Milter};
use spf_milter::oracle::MailAuthOracle;
use spf_milter::transaction::PolicyEngine;
use std::fs::OpenOptions;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("spf-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SPF policy milter for Sendmail and Postfix")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("foreground")
                .short('f')
                .long("foreground")
                .help("Stay in the foreground even when daemonize is on")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Print the effective configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let config_path = Path::new(config_path);

    // The log target lives in the configuration itself
    let log_to = match Config::load(config_path) {
        Ok(config) => config.log_to,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    if let Err(e) = init_logging(matches.get_flag("verbose"), log_to.as_deref()) {
        eprintln!("Error initializing logging: {e:#}");
        process::exit(1);
    }

    // Parsed again so that its warnings reach the log
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        match config.to_yaml() {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => {
                eprintln!("Error rendering configuration: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run(config, matches.get_flag("foreground")) {
        log::error!("spf-milter error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, log_to: Option<&Path>) -> anyhow::Result<()> {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(log_level);
    if let Some(path) = log_to {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn run(config: Config, foreground: bool) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;

    let previous = daemon::set_umask(daemon::SOCKET_UMASK);
    let listener = Listener::bind(&addr);
    daemon::set_umask(previous);
    let listener = listener?;

    let socket_path = match &addr {
        ListenAddr::Unix(path) => Some(path.as_path()),
        ListenAddr::Inet(_) => None,
    };
    daemon::drop_privileges(&config.user, socket_path)?;

    if config.daemonize && !foreground {
        daemon::daemonize()?;
    }

    log::info!(
        "Starting spf-milter {} (syslog facility {})",
        env!("CARGO_PKG_VERSION"),
        config.syslog_facility
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(serve(config, listener))
}

async fn serve(config: Config, listener: Listener) -> anyhow::Result<()> {
    let oracle = Arc::new(MailAuthOracle::from_system_conf()?);
    let engine = Arc::new(PolicyEngine::new(config, oracle));
    let milter = Milter::new(engine);
    milter.run(listener, shutdown_signal()).await?;
    log::info!("spf-milter stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    log::info!("Received shutdown signal, cleaning up...");
}
