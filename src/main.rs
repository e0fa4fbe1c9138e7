use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use picoread::{
    ClientConfig, PicoClient, RetryPolicy, SensorRegistry, Session, TelemetryListener,
    DEFAULT_CONFIG_PORT, DEFAULT_LISTEN_PORT,
};

/// Print the sensors of a Simarine Pico as JSON, one line per telemetry cycle
#[derive(Parser, Debug)]
#[command(name = "picoread", version, about)]
struct Cli {
    /// UDP port the device broadcasts telemetry to
    #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// Device address. Discovered from its broadcast when omitted
    #[arg(long)]
    device: Option<IpAddr>,

    /// TCP port of the device's config service
    #[arg(long, default_value_t = DEFAULT_CONFIG_PORT)]
    config_port: u16,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Seconds between connection attempts
    #[arg(long, default_value_t = 5)]
    retry_delay_secs: u64,

    /// Seconds allowed for one connection attempt or config request
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Pause after each cycle, in milliseconds
    #[arg(long, default_value_t = 900)]
    cadence_ms: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the sensor registry before the first reading
    #[arg(long)]
    print_config: bool,

    /// Exit after the first successful cycle
    #[arg(long)]
    once: bool,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        let timeout = Duration::from_secs(self.connect_timeout_secs);
        ClientConfig {
            port: self.config_port,
            request_timeout: timeout,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                delay: Duration::from_secs(self.retry_delay_secs),
                attempt_timeout: timeout,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let listener = TelemetryListener::bind(cli.listen_port).await?;
    let device = match cli.device {
        Some(device) => device,
        None => listener.discover().await?,
    };

    let mut client = PicoClient::connect(device, &cli.client_config())
        .await
        .with_context(|| format!("reading config from {device}"))?;
    let config = client.fetch_config().await?;
    if let Err(err) = client.stop().await {
        warn!(%err, "failed to close config connection");
    }

    let registry = SensorRegistry::build(&config)?;
    info!(sensors = registry.len(), fields = registry.element_count(), "sensor registry ready");
    if cli.print_config {
        println!("{}", serde_json::to_string(&registry)?);
    }

    let mut session = Session::new(registry);

    if cli.once {
        loop {
            let frame = listener.next_frame().await?;
            match session.process(&frame) {
                Ok(_) => break,
                Err(err) => warn!(%err, "skipping telemetry frame"),
            }
        }
        let snapshot = session.last_snapshot().ok_or_else(|| anyhow!("no reading"))?;
        println!("{}", serde_json::to_string(&picoread::Report::new(session.registry(), snapshot))?);
        return Ok(());
    }

    let frames = listener.frames(Duration::from_millis(cli.cadence_ms));
    session
        .run(frames, |report| match serde_json::to_string(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => warn!(%err, "failed to serialize report"),
        })
        .await?;

    Ok(())
}
