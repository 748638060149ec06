use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use serde_derive::Serialize;
use tokio::sync::watch;

use locator_rs::beacon::BeaconClient;
use locator_rs::config::AppConfig;
use locator_rs::mqtt::{LocationAnnouncer, MqttClient};
use locator_rs::presence::{PatientLocationRecord, PresenceState, UnmatchedDevice};
use locator_rs::resolver;
use locator_rs::scheduler::PollingScheduler;
use locator_rs::settings::{self, FileSettingsStore, ServerEndpoint, SettingsStore};

#[derive(Parser, Debug)]
#[command(version, about = "Tracks patient locations reported by an RFID/beacon gateway")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the gateway until interrupted (default)
    Run,
    /// Poll once and print the resolved locations as JSON
    Status,
    /// Check whether the gateway answers
    Check {
        /// Check this host instead of the stored one
        #[arg(long)]
        host: Option<String>,
    },
    /// Store a new gateway host, after checking that it answers
    SetHost {
        host: String,
        /// Save even if the gateway does not answer
        #[arg(long)]
        force: bool,
    },
}

#[derive(Serialize)]
struct StatusReport<'a> {
    endpoint: String,
    records: &'a [PatientLocationRecord],
    unmatched: &'a [UnmatchedDevice],
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut logger = pretty_env_logger::formatted_builder();
    logger.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    let store: Arc<dyn SettingsStore> = Arc::new(FileSettingsStore::new(config.settings_path()));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config, store).await,
        Command::Status => status(&config, store.as_ref()).await,
        Command::Check { host } => {
            let endpoint = host
                .map(ServerEndpoint::with_host)
                .unwrap_or_else(|| settings::current_endpoint(store.as_ref()));
            if BeaconClient::new().test_connection(&endpoint).await {
                println!("Gateway {} is reachable", endpoint);
                Ok(())
            } else {
                bail!("gateway {} is not reachable", endpoint)
            }
        }
        Command::SetHost { host, force } => {
            let endpoint = ServerEndpoint::with_host(host.trim());
            if !force && !BeaconClient::new().test_connection(&endpoint).await {
                bail!(
                    "gateway {} is not reachable; check the address or pass --force",
                    endpoint
                );
            }
            settings::save_host(store.as_ref(), &host)?;
            println!("Gateway host set to {}", endpoint.host);
            Ok(())
        }
    }
}

async fn run(config: &AppConfig, store: Arc<dyn SettingsStore>) -> anyhow::Result<()> {
    let roster = config.roster();
    if roster.is_empty() {
        warn!("No patients configured; only unmatched devices will be reported");
    }

    let client = BeaconClient::new();
    let endpoint = settings::current_endpoint(store.as_ref());
    if client.test_connection(&endpoint).await {
        info!("Gateway {} is reachable", endpoint);
    } else {
        warn!("Gateway {} is not reachable, polling anyway", endpoint);
    }

    let (updates, mut latest) = watch::channel(Vec::<PatientLocationRecord>::new());
    let mqtt = config.mqtt.as_ref().map(|mqtt_config| {
        let (mqtt_client, mut eventloop) = MqttClient::new(mqtt_config);
        let event_task = tokio::task::spawn(async move {
            MqttClient::event_loop(&mut eventloop).await;
        });
        let mut announcer = LocationAnnouncer::new(mqtt_client.clone());
        let announce_task = tokio::task::spawn(async move {
            // Only the newest snapshot is published if several arrive meanwhile.
            while latest.changed().await.is_ok() {
                let records = latest.borrow_and_update().clone();
                announcer.announce(&records).await;
            }
        });
        (mqtt_client, event_task, announce_task)
    });

    let mut scheduler = PollingScheduler::new(client, store);
    scheduler.start(roster, config.poll_interval(), move |records| {
        log_records(&records);
        updates.send_replace(records);
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.stop();

    if let Some((mqtt_client, event_task, announce_task)) = mqtt {
        announce_task.abort();
        mqtt_client.disconnect().await?;
        event_task.abort();
    }

    Ok(())
}

async fn status(config: &AppConfig, store: &dyn SettingsStore) -> anyhow::Result<()> {
    let roster = config.roster();
    let endpoint = settings::current_endpoint(store);

    match BeaconClient::new().fetch_status(&endpoint).await {
        Ok(raw) => {
            let resolution = resolver::resolve_at(&roster, &raw, &[], chrono::Utc::now());
            let report = StatusReport {
                endpoint: endpoint.to_string(),
                records: &resolution.records,
                unmatched: &resolution.unmatched,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            let degraded = resolver::degrade(&roster, &[]);
            let report = StatusReport {
                endpoint: endpoint.to_string(),
                records: &degraded,
                unmatched: &[],
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Err(err.into())
        }
    }
}

fn log_records(records: &[PatientLocationRecord]) {
    let count = |state| records.iter().filter(|r| r.state == state).count();
    info!(
        "{} patient(s): {} in range, {} out of range, {} unknown",
        records.len(),
        count(PresenceState::InRange),
        count(PresenceState::OutOfRange),
        count(PresenceState::Unknown)
    );
    for record in records {
        debug!(
            "{} ({}): {}, last seen {}",
            record.name, record.id, record.state, record.last_seen
        );
    }
}
