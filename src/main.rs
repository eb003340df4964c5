use anyhow::Context;

use async_std::channel;

use freqmon::{
    cpu::{self, msr::IA32_PERF_STATUS},
    MsrDevice, Options, Refresher, Sampler, Service, SocketServer, SysfsTopology,
};

use slog::{info, o, Drain, Level, LevelFilter};

use std::sync::Mutex;

use structopt::StructOpt;

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    let config = Options::from_args()
        .into_config()
        .context("Invalid configuration")?;

    // Set up a logger
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build();
    let drain = Mutex::new(drain).fuse();
    let level = if config.verbose {
        Level::Debug
    } else {
        Level::Info
    };
    let drain = LevelFilter::new(drain, level).fuse();
    let log = slog::Logger::root(drain, o!("freqmon version" => env!("CARGO_PKG_VERSION")));

    // Report what the OS tells us about the CPU configuration
    info!(log, "Probing host CPU configuration...");
    cpu::startup_report(&log).await;

    // Get ready to shut down on SIGINT/SIGTERM
    let (shutdown, shutdown_signal) = channel::bounded(1);
    ctrlc::set_handler(move || {
        // A full channel means that shutdown is already underway
        let _ = shutdown.try_send(());
    })
    .context("Error setting Ctrl-C handler")?;

    // Start monitoring
    let topology = SysfsTopology::new(&config.sysfs_root);
    let sampler = Sampler::new(
        MsrDevice::new(&config.devfs_root, IA32_PERF_STATUS),
        config.decoder,
    );
    let refresher = Refresher::new(topology, sampler, config.max_cpus)
        .context("Failed to allocate the frequency store")?;
    let service = Service::start(refresher, config.interval, log.clone())
        .await
        .context("Failed to start frequency monitoring")?;

    // Expose the frequency report
    let server = match SocketServer::bind(&config.socket, service.endpoint(), log.clone()).await {
        Ok(server) => server,
        Err(err) => {
            service.stop().await;
            return Err(err).context("Failed to expose the frequency report");
        }
    };

    // Run until asked to stop, then tear everything down in reverse order
    let _ = shutdown_signal.recv().await;
    info!(log, "Shutting down...");
    server.stop(&log).await;
    service.stop().await;
    Ok(())
}
