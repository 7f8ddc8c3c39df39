use std::{
    env,
    io::{self, BufWriter, Write},
    path::Path,
};

use barrage::{
    config::{self, Config, KeyValues, Telemetry},
    dispatch::{Dispatch, Http},
    scheduler::{self, Scheduler, Summary},
};
use barrage_payload::RequestKind;
use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::{SeedableRng, rngs::StdRng};
use ::time::OffsetDateTime;
use tokio::{
    runtime::{Builder, Runtime},
    signal,
    time::{self, Duration},
};
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Barrage configuration is invalid: {0}")]
    Config(#[from] config::Error),
    #[error("Barrage scheduler returned an error: {0}")]
    Scheduler(#[from] scheduler::Error),
    #[error("Failed to encode request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Parsing Prometheus address failed: {0}")]
    PrometheusAddr(#[from] std::net::AddrParseError),
    #[error("Failed to install Prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Could not join the scheduler task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_config_path() -> String {
    "/etc/barrage/barrage.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load profile against the target
    Run(RunCommand),
    /// Validate configuration and exit
    ConfigCheck(ConfigArgs),
    /// Write synthesized requests to stdout as JSON lines without sending them
    Preview(PreviewCommand),
    /// Send requests of one kind, one after another, and log each status
    Fire(FireCommand),
}

#[derive(Args)]
struct ConfigArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

#[derive(Args)]
struct RunCommand {
    #[command(flatten)]
    config: ConfigArgs,
    /// address to bind the prometheus exporter to, overrides configuration
    #[clap(long)]
    prometheus_addr: Option<String>,
    /// additional labels to apply to all metrics, format KEY=VAL,KEY2=VAL
    #[clap(long)]
    global_labels: Option<KeyValues>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct PreviewCommand {
    #[command(flatten)]
    config: ConfigArgs,
    /// number of requests to synthesize
    #[clap(long, default_value_t = 10)]
    count: u32,
}

#[derive(Args)]
struct FireCommand {
    #[command(flatten)]
    config: ConfigArgs,
    /// kind of request to send: search_get, search_post, transfer or failure
    #[clap(long)]
    kind: RequestKind,
    /// number of requests to send
    #[clap(long, default_value_t = 1)]
    count: u32,
}

fn load_config(args: &ConfigArgs) -> Result<Config, Error> {
    config::load(Path::new(&args.config_path), |name| env::var(name).ok()).map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn master_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

fn runtime() -> Result<Runtime, Error> {
    Ok(Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?)
}

// Command line settings win over the configuration file. Labels from both
// are merged.
fn telemetry(
    configured: Option<Telemetry>,
    prometheus_addr: Option<&str>,
    global_labels: Option<KeyValues>,
) -> Result<Option<Telemetry>, Error> {
    let labels = global_labels.unwrap_or_default().into_inner();
    let telemetry = match (prometheus_addr, configured) {
        (Some(addr), _) => Some(Telemetry::Prometheus {
            addr: addr.parse()?,
            global_labels: labels,
        }),
        (
            None,
            Some(Telemetry::Prometheus {
                addr,
                mut global_labels,
            }),
        ) => {
            global_labels.extend(labels);
            Some(Telemetry::Prometheus {
                addr,
                global_labels,
            })
        }
        (None, None) => None,
    };
    Ok(telemetry)
}

async fn inner_main(config: Config, telemetry: Option<Telemetry>) -> Result<Summary, Error> {
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = telemetry
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("prometheus exporter listening on {addr}");
    }

    let (shutdown_watcher, shutdown_broadcast) = barrage_signal::signal();
    let max_idle = config.profile()?.maximum_target() as usize;
    let dispatcher = Http::new(config.target_uri.clone(), config.request_timeout, max_idle);
    let scheduler = Scheduler::new(&config, dispatcher, shutdown_watcher)?;
    info!(target_uri = %config.target_uri, "starting run");

    let run = tokio::spawn(scheduler.run().instrument(info_span!("scheduler")));
    tokio::pin!(run);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interval = time::interval(Duration::from_millis(400));
    let summary = loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("barrage.running").set(1.0);
            },
            _ = &mut ctrl_c => {
                info!("received ctrl-c, waiting on in-flight iterations");
                shutdown_broadcast.signal_and_wait().await;
                break (&mut run).await?;
            },
            summary = &mut run => {
                break summary?;
            },
        }
    };
    gauge!("barrage.running").set(0.0);
    Ok(summary)
}

fn preview(config: &Config, count: u32) -> Result<(), Error> {
    let workload = config.workload()?;
    let fault = config.fault()?;
    let mut rng = master_rng(config.seed);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for _ in 0..count {
        let request = if fault.trips(&mut rng) {
            workload.failure_request(&mut rng)
        } else {
            workload.synthesize(&mut rng, OffsetDateTime::now_utc())
        };
        serde_json::to_writer(&mut out, &request)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

async fn fire(config: Config, kind: RequestKind, count: u32) -> Result<(), Error> {
    let workload = config.workload()?;
    let dispatcher = Http::new(config.target_uri.clone(), config.request_timeout, 1);
    let mut rng = master_rng(config.seed);

    for n in 0..count {
        let request = workload.request(kind, &mut rng, OffsetDateTime::now_utc());
        let path = request.path_and_query();
        match dispatcher.dispatch(&request).await {
            Ok(status) => info!(n, %kind, %path, status = status.as_u16(), "response received"),
            Err(err) => warn!(n, %kind, %path, "request failed: {err}"),
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    // Logs go to stderr, stdout carries `preview` output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_ansi(false)
        .finish()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::ConfigCheck(args) => match load_config(&args) {
            Ok(_) => {
                info!("Configuration file is valid");
                std::process::exit(0)
            }
            Err(_) => std::process::exit(1),
        },
        Commands::Preview(cmd) => {
            let config = load_config(&cmd.config)?;
            preview(&config, cmd.count)
        }
        Commands::Fire(cmd) => {
            let config = load_config(&cmd.config)?;
            let runtime = runtime()?;
            runtime.block_on(fire(config, cmd.kind, cmd.count))
        }
        Commands::Run(cmd) => {
            let version = env!("CARGO_PKG_VERSION");
            info!("Starting barrage {version} run.");

            let mut config = load_config(&cmd.config)?;
            let telemetry = telemetry(
                config.telemetry.take(),
                cmd.prometheus_addr.as_deref(),
                cmd.global_labels,
            )?;
            let max_shutdown_delay = Duration::from_secs(cmd.max_shutdown_delay.into());

            let runtime = runtime()?;
            let res = runtime.block_on(inner_main(config, telemetry));
            info!(
                "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
                max_shutdown_delay.as_secs(),
            );
            runtime.shutdown_timeout(max_shutdown_delay);

            let summary = res?;
            info!(
                iterations = summary.iterations,
                successes = summary.successes,
                rejections = summary.rejections,
                transport_failures = summary.transport_failures,
                faults = summary.faults,
                peak_virtual_users = summary.peak_virtual_users,
                "run complete"
            );
            info!("Bye. :)");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use barrage::config::{KeyValues, Telemetry};
    use rustc_hash::FxHashMap;

    use super::telemetry;

    #[test]
    fn cli_address_overrides_configuration() {
        let configured = Telemetry::Prometheus {
            addr: "0.0.0.0:9000".parse().expect("valid addr"),
            global_labels: FxHashMap::default(),
        };
        let labels: KeyValues = "run=smoke".parse().expect("valid labels");
        let resolved = telemetry(Some(configured), Some("127.0.0.1:9100"), Some(labels))
            .expect("valid telemetry");
        match resolved {
            Some(Telemetry::Prometheus {
                addr,
                global_labels,
            }) => {
                assert_eq!(addr, "127.0.0.1:9100".parse::<SocketAddr>().expect("valid addr"));
                assert_eq!(global_labels["run"], "smoke");
            }
            None => panic!("telemetry missing"),
        }
    }

    #[test]
    fn labels_merge_into_configuration() {
        let mut global_labels = FxHashMap::default();
        global_labels.insert("team".to_string(), "payments".to_string());
        let configured = Telemetry::Prometheus {
            addr: "0.0.0.0:9000".parse().expect("valid addr"),
            global_labels,
        };
        let labels: KeyValues = "run=soak".parse().expect("valid labels");
        let resolved = telemetry(Some(configured), None, Some(labels)).expect("valid telemetry");
        let Some(Telemetry::Prometheus { global_labels, .. }) = resolved else {
            panic!("telemetry missing");
        };
        assert_eq!(global_labels.len(), 2);
    }

    #[test]
    fn no_telemetry_without_configuration() {
        assert_eq!(telemetry(None, None, None).expect("valid telemetry"), None);
    }

    #[test]
    fn bad_address_rejected() {
        assert!(telemetry(None, Some("not an address"), None).is_err());
    }
}
