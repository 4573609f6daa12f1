//! Node-level collection daemon.
//!
//! Lists the pods scheduled on this node, opens counter groups for every
//! container, lets them count for a settle window, reads them, and
//! publishes the results, repeating on a fixed cadence until signalled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use podperf::cgroup;
use podperf::discovery::ApiClient;
use podperf::metrics::{self, ContainerGauges};
use podperf::podset::{Backend, PodSetCollector};

#[derive(Parser)]
#[command(
    name = "bench",
    version,
    about = "Export per-container CPU counter gauges for one Kubernetes node"
)]
struct Cli {
    /// Node whose pods are measured, as known to the cluster API.
    node_name: String,

    /// Kubeconfig with access to the cluster API.
    kubeconfig: PathBuf,

    /// Namespace whose pods are measured.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Collector implementation: "raw-group" or "simple-hardware".
    #[arg(long, default_value = "raw-group")]
    backend: Backend,

    /// Seconds between collection passes.
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Seconds the counters accumulate before each read. Defaults to
    /// half the interval.
    #[arg(long)]
    settle: Option<u64>,

    /// Address the metrics endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    anyhow::ensure!(
        cgroup::kubepods_present(),
        "no kubepods cgroup hierarchy under {}; is this a kubelet node with the systemd driver?",
        cgroup::CGROUP_ROOT
    );

    raise_fd_limit();

    let api = ApiClient::from_kubeconfig(&cli.kubeconfig)
        .with_context(|| format!("loading kubeconfig {}", cli.kubeconfig.display()))?;

    // Fail fast on an unreachable cluster API instead of skipping every
    // pass from here to eternity.
    api.list_pods(&cli.node_name, &cli.namespace)
        .await
        .context("cluster API is unreachable")?;

    let mut registry = Registry::default();
    let gauges = ContainerGauges::register(&mut registry);
    tokio::spawn(metrics::serve(Arc::new(registry), cli.listen));

    let settle = Duration::from_secs(cli.settle.unwrap_or_else(|| (cli.interval / 2).max(1)));
    let mut ticker = tokio::time::interval(Duration::from_secs(cli.interval.max(1)));
    // A pass that overruns the interval delays the next one; passes never
    // overlap.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => collect_once(&api, &cli, settle, &gauges).await,
        }
    }

    log::info!("shutting down");
    Ok(())
}

/// One collection pass: discover, open, settle, read, publish.
async fn collect_once(api: &ApiClient, cli: &Cli, settle: Duration, gauges: &ContainerGauges) {
    let pods = match api.list_pods(&cli.node_name, &cli.namespace).await {
        Ok(pods) => pods,
        Err(err) => {
            log::warn!("skipping pass, discovery failed: {err}");
            return;
        }
    };
    log::info!(
        "there are {} pods in the {} namespace",
        pods.len(),
        cli.namespace
    );

    let collectors = PodSetCollector::open(cli.backend, pods).await;
    if collectors.is_empty() {
        log::info!("nothing to measure this pass");
        return;
    }
    log::info!("measuring {} containers", collectors.len());

    // Let the freshly zeroed counters accumulate before reading them.
    tokio::time::sleep(settle).await;

    collectors.profile(gauges).await;
}

/// Raise the open-files soft limit to the hard limit. Every measured
/// container holds one descriptor per event per CPU, which outgrows the
/// usual 1024 default after a handful of pods.
fn raise_fd_limit() {
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            log::warn!(
                "cannot read the open-files limit: {}",
                std::io::Error::last_os_error()
            );
            return;
        }
        if limit.rlim_cur >= limit.rlim_max {
            return;
        }
        limit.rlim_cur = limit.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            log::warn!(
                "cannot raise the open-files limit: {}",
                std::io::Error::last_os_error()
            );
        } else {
            log::debug!("open-files limit raised to {}", limit.rlim_cur);
        }
    }
}

/// Resolves once on the first SIGINT/SIGTERM; a second signal exits the
/// process immediately with status 1.
fn shutdown_signal() -> impl std::future::Future<Output = ()> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                log::error!("cannot install SIGINT handler: {err}");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                log::error!("cannot install SIGTERM handler: {err}");
                return;
            }
        };

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        log::info!("signal received, finishing the current pass");
        let _ = tx.send(());

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        log::warn!("second signal, exiting immediately");
        std::process::exit(1);
    });

    async move {
        let _ = rx.await;
    }
}
