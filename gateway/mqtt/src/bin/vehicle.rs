use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use telemetrygateway::{
    validate_vehicle_id, BrokerAddress, InMemoryBroker, MqttTransport, MqttTransportConfig,
    PublisherConfig, TelemetryPublisher, Topics, Transport, DEFAULT_STATUS_TOPIC,
};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use vehiclesim::{list_route_files, load_itn_file, SimulatorConfig, VehicleSimulator};

const DEFAULT_VEHICLE_ID: &str = "postauto";
const DEFAULT_BROKER: &str = "tcp://localhost:1883";

/// Drive a simulated vehicle along an ITN route and publish its telemetry.
/// Vehicle id, route and broker are asked for interactively when omitted.
#[derive(Parser, Debug, Clone)]
struct Args {
    /// Vehicle id, also used as MQTT client id
    #[arg(long, env = "VEHICLE_ID")]
    vehicle_id: Option<String>,

    /// Directory searched for *.itn route files
    #[arg(long, env = "WAYPOINTS_DIR", default_value = "./waypoints")]
    waypoints_dir: PathBuf,

    /// Route file path, or index into the waypoints directory listing
    #[arg(long, env = "ROUTE")]
    route: Option<String>,

    #[arg(long, env = "MQTT_BROKER")]
    broker: Option<String>,

    #[arg(long, env = "STATUS_TOPIC", default_value = DEFAULT_STATUS_TOPIC)]
    status_topic: String,

    #[arg(long, env = "TICK_MS", default_value_t = 1000)]
    tick_ms: u64,

    #[arg(long, env = "CRUISE_KMH", default_value_t = 50.0)]
    cruise_kmh: f64,

    #[arg(long, env = "MQTT_USER")]
    username: Option<String>,
    #[arg(long, env = "MQTT_PASS")]
    password: Option<String>,

    /// Publish to an in-process broker instead of the network
    #[arg(long)]
    dry_run: bool,
}

/// `RUST_LOG` style directives; `info` when none are given.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives)
}

fn ask_vehicle_id(theme: &ColorfulTheme) -> Result<String> {
    let id: String = Input::with_theme(theme)
        .with_prompt("Vehicle id")
        .default(DEFAULT_VEHICLE_ID.to_string())
        .validate_with(|id: &String| validate_vehicle_id(id))
        .interact_text()
        .context("vehicle id prompt failed")?;
    Ok(id)
}

fn ask_broker(theme: &ColorfulTheme) -> Result<String> {
    let broker: String = Input::with_theme(theme)
        .with_prompt("MQTT broker")
        .default(DEFAULT_BROKER.to_string())
        .validate_with(|b: &String| b.parse::<BrokerAddress>().map(|_| ()))
        .interact_text()
        .context("broker prompt failed")?;
    Ok(broker)
}

fn pick_listed_route(theme: &ColorfulTheme, dir: &Path, choice: Option<&str>) -> Result<PathBuf> {
    let files = list_route_files(dir)?;
    if files.is_empty() {
        bail!("no .itn route files in {}", dir.display());
    }

    let index = match choice {
        Some(c) => c
            .parse::<usize>()
            .with_context(|| format!("route choice '{c}' is not a number"))?,
        None => {
            let names: Vec<String> = files
                .iter()
                .map(|f| f.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
                .collect();
            Select::with_theme(theme)
                .with_prompt(format!("Route ({})", dir.display()))
                .items(&names)
                .default(0)
                .interact()
                .context("route prompt failed")?
        }
    };

    files
        .get(index)
        .cloned()
        .with_context(|| format!("route index {index} out of range (0..{})", files.len()))
}

fn select_route(theme: &ColorfulTheme, args: &Args) -> Result<PathBuf> {
    match args.route.as_deref() {
        Some(r) if r.parse::<usize>().is_err() => Ok(PathBuf::from(r)),
        choice => pick_listed_route(theme, &args.waypoints_dir, choice),
    }
}

/// Resolves on Ctrl+C, or on Enter while stdin is open. The stdin reader is a
/// detached thread so a pending read never holds up runtime shutdown.
async fn shutdown_signal() {
    let (tx, rx) = oneshot::channel::<()>();
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
            let _ = tx.send(());
        }
    });

    let enter = async {
        if rx.await.is_err() {
            // stdin closed; only Ctrl+C remains
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down..."),
        _ = enter => info!("Enter pressed, shutting down..."),
    }
}

async fn run<T: Transport + 'static>(
    mut publisher: TelemetryPublisher<T>,
    address: &BrokerAddress,
) -> Result<()> {
    info!("Press Enter or Ctrl+C to stop the vehicle.");
    publisher.run_until(address, shutdown_signal()).await?;
    info!("Vehicle stopped.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::fmt().with_env_filter(log_filter(&directives)).init();

    let args = Args::parse();
    let theme = ColorfulTheme::default();

    let vehicle_id = match args.vehicle_id.clone() {
        Some(id) => id,
        None => ask_vehicle_id(&theme)?,
    };
    validate_vehicle_id(&vehicle_id)?;

    let route_path = select_route(&theme, &args)?;
    let route = load_itn_file(&route_path)?;
    info!(
        route = %route_path.display(),
        waypoints = route.len(),
        length_km = %format!("{:.2}", route.length_km()),
        "route loaded"
    );

    let broker = match (args.broker.clone(), args.dry_run) {
        (Some(b), _) => b,
        (None, true) => DEFAULT_BROKER.to_string(),
        (None, false) => ask_broker(&theme)?,
    };
    let address: BrokerAddress = broker.parse()?;

    let period = Duration::from_millis(args.tick_ms);
    let simulator = VehicleSimulator::new(
        vehicle_id,
        route,
        SimulatorConfig::default()
            .with_tick_period(period)
            .with_cruise_speed(args.cruise_kmh),
    );
    let cfg = PublisherConfig::default()
        .with_topics(Topics::new(args.status_topic.clone()))
        .with_tick_period(period);

    if args.dry_run {
        info!("dry run: publishing to in-process broker");
        let publisher = TelemetryPublisher::new(cfg, Arc::new(InMemoryBroker::new()), simulator);
        run(publisher, &address).await
    } else {
        let transport = MqttTransport::new(MqttTransportConfig {
            username: args.username.clone(),
            password: args.password.clone(),
            ..Default::default()
        });
        let publisher = TelemetryPublisher::new(cfg, Arc::new(transport), simulator);
        run(publisher, &address).await
    }
}
