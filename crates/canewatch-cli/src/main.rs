//! Operator binary for the Canewatch persistence layer.
//!
//! ```text
//! canewatch schema
//! canewatch health
//! canewatch export <payload.json> [--session <id>]
//! canewatch summary <session-id>
//! ```
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Parse the command line
//! 3. Load configuration from `CANEWATCH_CONFIG` or `canewatch.yaml`
//! 4. Connect (or start the in-memory store in simulated mode)
//! 5. Run the command
//! 6. Shut the pool down

mod error;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use canewatch_db::{
    ExportPayload, GasTotals, IntervalAggregate, LossStatistics, Persistence, PersistenceConfig,
    StockTotals, Summary, export_session,
};
use canewatch_types::{EmissionScope, Session, SessionId, SessionMetadata, SessionStatus, TimeBucket};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

/// Environment variable naming the configuration file.
const ENV_CONFIG: &str = "CANEWATCH_CONFIG";
/// Environment variable selecting the log format (`json` or anything else).
const ENV_LOG_FORMAT: &str = "CANEWATCH_LOG_FORMAT";
/// Configuration file used when `CANEWATCH_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "canewatch.yaml";

const USAGE: &str =
    "usage: canewatch schema | health | export <payload.json> [--session <id>] | summary <session-id>";

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Schema,
    Health,
    Export {
        payload: PathBuf,
        session: Option<SessionId>,
    },
    Summary {
        session: SessionId,
    },
}

impl Command {
    /// Parse the arguments that follow the program name.
    fn parse<I>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let name = args.next().ok_or_else(|| CliError::Usage(USAGE.to_owned()))?;
        let rest: Vec<String> = args.collect();

        match (name.as_str(), rest.as_slice()) {
            ("schema", []) => Ok(Self::Schema),
            ("health", []) => Ok(Self::Health),
            ("export", [payload]) => Ok(Self::Export {
                payload: PathBuf::from(payload),
                session: None,
            }),
            ("export", [payload, flag, id]) | ("export", [flag, id, payload])
                if flag == "--session" =>
            {
                Ok(Self::Export {
                    payload: PathBuf::from(payload),
                    session: Some(SessionId::new(id.as_str())),
                })
            }
            ("summary", [id]) => Ok(Self::Summary {
                session: SessionId::new(id.as_str()),
            }),
            _ => Err(CliError::Usage(USAGE.to_owned())),
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Health => "health",
            Self::Export { .. } => "export",
            Self::Summary { .. } => "summary",
        }
    }
}

/// Everything recorded for one session, as printed by `summary`.
#[derive(Debug, Serialize)]
struct SessionSummary {
    session: Session,
    sensors: BTreeMap<String, Summary>,
    hourly_sensor_means: BTreeMap<String, Vec<IntervalAggregate>>,
    emissions_by_scope: BTreeMap<EmissionScope, GasTotals>,
    carbon_stock_totals: StockTotals,
    sequestration: StockTotals,
    land_use_change: StockTotals,
    harvest_losses: LossStatistics,
}

/// Application entry point for the operator binary.
///
/// # Errors
///
/// Returns an error if the command line, configuration, connection or the
/// command itself fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let command = Command::parse(std::env::args().skip(1))?;
    info!(command = command.name(), "canewatch starting");

    let config = load_config()?;
    info!(
        host = config.connection.host,
        database = config.connection.database,
        simulated = config.simulated_mode,
        "Configuration loaded"
    );

    let db = Persistence::connect(&config).await.map_err(CliError::from)?;
    let outcome = run(&db, command).await;
    db.shutdown().await;
    outcome?;

    info!("canewatch finished");
    Ok(())
}

/// Install the global subscriber: `EnvFilter` (default `info`), with an
/// optional JSON formatter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Load configuration from `CANEWATCH_CONFIG` or `canewatch.yaml`.
///
/// A missing file yields defaults with environment overrides applied.
fn load_config() -> Result<PersistenceConfig, CliError> {
    let path = std::env::var(ENV_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
    let path = Path::new(&path);
    if path.exists() {
        Ok(PersistenceConfig::from_file(path)?)
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(PersistenceConfig::parse("")?)
    }
}

async fn run(db: &Persistence, command: Command) -> Result<(), CliError> {
    match command {
        Command::Schema => schema(db).await,
        Command::Health => health(db).await,
        Command::Export { payload, session } => export(db, &payload, session).await,
        Command::Summary { session } => summary(db, &session).await,
    }
}

async fn schema(db: &Persistence) -> Result<(), CliError> {
    let report = db.ensure_schema().await?;
    for failure in &report.failed {
        tracing::error!(object = failure.name, error = %failure.error, "Schema object not created");
    }
    info!(
        created = report.created.len(),
        existing = report.existing.len(),
        failed = report.failed.len(),
        "Schema check complete"
    );
    println!(
        "created: {}\nexisting: {}\nfailed: {}",
        report.created.join(", "),
        report.existing.join(", "),
        report.failed.len()
    );
    Ok(())
}

async fn health(db: &Persistence) -> Result<(), CliError> {
    if db.is_healthy().await {
        println!("ok");
        Ok(())
    } else {
        Err(CliError::Unhealthy)
    }
}

async fn export(
    db: &Persistence,
    path: &Path,
    session: Option<SessionId>,
) -> Result<(), CliError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CliError::Payload {
        path: path.display().to_string(),
        source,
    })?;
    let payload: ExportPayload = serde_json::from_str(&contents)?;

    let owned = session.is_none();
    let session_id = match session {
        Some(id) => id,
        None => {
            db.create_session(&SessionMetadata::default().with_created_by("canewatch-cli"))
                .await?
        }
    };

    let report = export_session(db, &session_id, &payload).await?;
    println!(
        "session {}: {} sensor readings, {} emissions, {} carbon stock changes, {} harvest losses",
        report.session_id,
        report.sensor_readings,
        report.emissions,
        report.carbon_stocks,
        report.harvest_losses
    );
    for failure in &report.failures {
        println!("failed {}: {}", failure.kind, failure.error);
    }

    if !report.is_complete() {
        return Err(CliError::IncompleteExport {
            session_id: session_id.into_inner(),
            failed: report.failures.len(),
        });
    }
    if owned {
        let update = db.end_session(&session_id, SessionStatus::Completed).await?;
        info!(session_id = %session_id, applied = update.is_applied(), "Export session closed");
    }
    Ok(())
}

async fn summary(db: &Persistence, id: &SessionId) -> Result<(), CliError> {
    let session = db
        .sessions()
        .get(id)
        .await?
        .ok_or_else(|| CliError::UnknownSession(id.to_string()))?;

    let sensors = db.sensors().statistics(id).await?;
    let mut hourly_sensor_means = BTreeMap::new();
    for sensor_type in sensors.keys() {
        let buckets = db
            .sensors()
            .aggregate_by_interval(id, sensor_type, TimeBucket::Hour)
            .await?;
        hourly_sensor_means.insert(sensor_type.clone(), buckets);
    }

    let summary = SessionSummary {
        session,
        sensors,
        hourly_sensor_means,
        emissions_by_scope: db.emissions().totals_by_scope(id).await?,
        carbon_stock_totals: db.carbon_stocks().totals_by_type(id).await?,
        sequestration: db.carbon_stocks().sequestration(id).await?,
        land_use_change: db.carbon_stocks().land_use_change_emissions(id).await?,
        harvest_losses: db.harvest_losses().statistics(id).await?,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, CliError> {
        Command::parse(args.iter().map(|a| (*a).to_owned()))
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse(&["schema"]).unwrap(), Command::Schema);
        assert_eq!(parse(&["health"]).unwrap(), Command::Health);
        assert_eq!(
            parse(&["summary", "S-1"]).unwrap(),
            Command::Summary {
                session: SessionId::new("S-1")
            }
        );
    }

    #[test]
    fn export_session_flag_may_come_first_or_last() {
        let expected = Command::Export {
            payload: PathBuf::from("run.json"),
            session: Some(SessionId::new("S-9")),
        };
        assert_eq!(parse(&["export", "run.json", "--session", "S-9"]).unwrap(), expected);
        assert_eq!(parse(&["export", "--session", "S-9", "run.json"]).unwrap(), expected);
        assert_eq!(
            parse(&["export", "run.json"]).unwrap(),
            Command::Export {
                payload: PathBuf::from("run.json"),
                session: None,
            }
        );
    }

    #[test]
    fn rejects_malformed_command_lines() {
        assert!(matches!(parse(&[]), Err(CliError::Usage(_))));
        assert!(matches!(parse(&["drop"]), Err(CliError::Usage(_))));
        assert!(matches!(parse(&["summary"]), Err(CliError::Usage(_))));
        assert!(matches!(parse(&["export", "a.json", "--force", "x"]), Err(CliError::Usage(_))));
        assert!(matches!(parse(&["health", "extra"]), Err(CliError::Usage(_))));
    }
}
