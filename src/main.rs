use serversim::config::Config;
use serversim::host::{HostIdentity, CGROUP_PATH};
use serversim::runtime::install_interrupt_handler;
use serversim::{ExitStatus, Server};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const BANNER_RULE: &str = "*** =-=--=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=";

fn main() -> ExitCode {
    let (host, cgroup_error) = HostIdentity::detect();

    // Load configuration; logging is not up yet, so fall back to defaults
    // to report configuration errors.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            init_logging("info", host.containerized);
            error!("{e}");
            return leave(e.exit_status());
        }
    };

    init_logging(&config.log_level, host.containerized);
    if let Some(e) = cgroup_error {
        warn!(path = CGROUP_PATH, error = %e, "Unable to open file");
    }
    banner(&config, &host);

    if let Err(e) = install_interrupt_handler() {
        error!(error = %e, "Failed to install signal handlers");
        return leave(ExitStatus::RuntimeFault);
    }

    let server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(port = config.port, error = %e, "Failed to bind listener");
            return leave(ExitStatus::RuntimeFault);
        }
    };

    leave(server.run())
}

/// Initialize logging. `RUST_LOG` takes precedence over the configured level.
fn init_logging(level: &str, containerized: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // The container runtime stamps each line already.
    if containerized {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

fn banner(config: &Config, host: &HostIdentity) {
    info!("{BANNER_RULE}");
    info!("***  Welcome to SeRvErSiM DOCKER Edition!");
    info!("{BANNER_RULE}");
    if host.containerized {
        info!("***  CONTAINER_ID ...... {}", host.id);
    } else {
        info!("***  HOST .............. {}", host.id);
    }
    info!("***  TCP_SERVER_PORT ... {}", config.port);
    info!("***  MAX_THREADS ....... {}", config.workers);
    info!("***  TCP_BACKLOG ....... {}", config.backlog);
    info!("{BANNER_RULE}");
    if host.containerized {
        info!("Running INSIDE of a container");
    } else {
        info!("Running OUTSIDE of a container");
    }
}

fn leave(status: ExitStatus) -> ExitCode {
    if status.is_clean() {
        info!("Exit Code: {status}");
    } else {
        error!("Exit Code: {status}");
    }
    status.into()
}
