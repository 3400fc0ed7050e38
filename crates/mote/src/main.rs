mod cli;
mod drivers;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mote_core::{DeviceAgent, DeviceConfig, DriverSet, NoopWatchdog, RunExit};
use mote_link::{BrokerTransport, LogBroker, SimBroker, SimLink};

use crate::cli::{BrokerMode, Cli, Command};

/// Exit code the supervisor treats as a restart request; everything
/// else is a clean stop.
const EXIT_RESTART: i32 = 10;
const EXIT_CONFIG: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);
    std::process::exit(run(cli).await);
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> i32 {
    let document = match mote_config::load(&cli.global.config) {
        Ok(document) => document,
        Err(e) => {
            tracing::error!(path = %cli.global.config.display(), error = %e, "configuration rejected");
            return EXIT_CONFIG;
        }
    };

    if matches!(cli.command, Some(Command::Check)) {
        println!(
            "configuration OK: {} sensor(s), broker {}:{}",
            document.sensors.len(),
            document.broker.server,
            document.broker.port
        );
        return 0;
    }

    let config = document.into_device_config();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let exit = match cli.global.broker {
        BrokerMode::Log => run_agent(config, LogBroker, cancel).await,
        BrokerMode::Sim => run_agent(config, SimBroker::new(), cancel).await,
    };

    match exit {
        RunExit::Restart => EXIT_RESTART,
        RunExit::Shutdown | RunExit::Cancelled => 0,
    }
}

async fn run_agent<B: BrokerTransport>(
    config: DeviceConfig,
    broker: B,
    cancel: CancellationToken,
) -> RunExit {
    let mut driver_set = DriverSet::new();
    drivers::register_builtin(&mut driver_set);

    let agent = DeviceAgent::new(
        config,
        SimLink::new(),
        broker,
        &driver_set,
        Box::new(NoopWatchdog),
        cancel,
    );
    agent.run().await
}
