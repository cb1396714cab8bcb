//! Schema bootstrap.
//!
//! [`SchemaInitializer::ensure_schema`] brings an empty or partially
//! provisioned database up to the five tables and their indices. It lists
//! what already exists, creates only what is missing (tables in dependency
//! order, then indices), and treats "already exists" as success so two
//! processes bootstrapping at once both come out fine. A failure on one
//! object is recorded and the remaining objects are still attempted.

use std::collections::BTreeSet;

use sqlx::PgConnection;
use tracing::Instrument;

use crate::error::{PersistenceError, StoreError};
use crate::persistence::Persistence;

/// Kind of schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A table.
    Table,
    /// An index.
    Index,
}

/// A table or index and the DDL that creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaObject {
    /// Object name as it appears in the catalog.
    pub name: &'static str,
    /// Table or index.
    pub kind: ObjectKind,
    /// `CREATE` statement.
    pub ddl: &'static str,
}

/// Tables in creation order. Each table only references tables before it.
pub const TABLES: &[SchemaObject] = &[
    SchemaObject {
        name: "sessions",
        kind: ObjectKind::Table,
        ddl: r"CREATE TABLE sessions (
            id            TEXT PRIMARY KEY,
            start_ts      TIMESTAMPTZ NOT NULL,
            end_ts        TIMESTAMPTZ,
            status        TEXT NOT NULL CHECK (status IN ('active', 'paused', 'completed', 'aborted')),
            created_by    TEXT NOT NULL DEFAULT 'system',
            last_updated  TIMESTAMPTZ NOT NULL,
            version       BIGINT NOT NULL DEFAULT 1 CHECK (version >= 1),
            CHECK ((end_ts IS NULL) = (status IN ('active', 'paused')))
        )",
    },
    SchemaObject {
        name: "sensor_data",
        kind: ObjectKind::Table,
        ddl: r"CREATE TABLE sensor_data (
            id            BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            session_id    TEXT NOT NULL REFERENCES sessions (id),
            ts            TIMESTAMPTZ NOT NULL,
            sensor_type   TEXT NOT NULL,
            value         DOUBLE PRECISION NOT NULL,
            unit          TEXT NOT NULL DEFAULT '',
            quality_flag  TEXT NOT NULL DEFAULT 'good'
        )",
    },
    SchemaObject {
        name: "ghg_emissions",
        kind: ObjectKind::Table,
        ddl: r"CREATE TABLE ghg_emissions (
            id               BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            session_id       TEXT NOT NULL REFERENCES sessions (id),
            ts               TIMESTAMPTZ NOT NULL,
            scope            SMALLINT NOT NULL CHECK (scope IN (1, 2, 3)),
            category         TEXT NOT NULL DEFAULT '',
            source           TEXT NOT NULL,
            gas              TEXT NOT NULL CHECK (gas IN ('CO2', 'CH4', 'N2O', 'CO2e')),
            value            NUMERIC NOT NULL CHECK (value >= 0 OR gas = 'CO2'),
            unit             TEXT NOT NULL DEFAULT 'kg',
            calc_method      TEXT NOT NULL CHECK (calc_method IN ('tier1', 'tier2', 'tier3', 'direct_measurement')),
            uncertainty_pct  DOUBLE PRECISION NOT NULL DEFAULT 10.0
        )",
    },
    SchemaObject {
        name: "carbon_stocks",
        kind: ObjectKind::Table,
        ddl: r"CREATE TABLE carbon_stocks (
            id                   BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            session_id           TEXT NOT NULL REFERENCES sessions (id),
            ts                   TIMESTAMPTZ NOT NULL,
            stock_type           TEXT NOT NULL CHECK (stock_type IN ('soil_organic_carbon', 'above_ground_biomass', 'below_ground_biomass', 'dead_organic_matter')),
            change               NUMERIC NOT NULL,
            amortization_period  INTEGER NOT NULL CHECK (amortization_period >= 1),
            unit                 TEXT NOT NULL DEFAULT 'kg CO2',
            measurement_method   TEXT NOT NULL CHECK (measurement_method IN ('direct_sampling', 'remote_sensing', 'model_estimate', 'default_factor'))
        )",
    },
    SchemaObject {
        name: "harvest_losses",
        kind: ObjectKind::Table,
        ddl: r"CREATE TABLE harvest_losses (
            id                     BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            session_id             TEXT NOT NULL REFERENCES sessions (id),
            ts                     TIMESTAMPTZ NOT NULL,
            loss_percent           DOUBLE PRECISION NOT NULL CHECK (loss_percent BETWEEN 0 AND 100),
            factors_json           JSONB NOT NULL DEFAULT '[]'::JSONB,
            confidence_level       TEXT NOT NULL CHECK (confidence_level IN ('high', 'medium', 'low')),
            field_conditions_json  JSONB
        )",
    },
];

/// Indices, created after every table exists.
pub const INDEXES: &[SchemaObject] = &[
    SchemaObject {
        name: "idx_sessions_status",
        kind: ObjectKind::Index,
        ddl: "CREATE INDEX idx_sessions_status ON sessions (status)",
    },
    SchemaObject {
        name: "idx_sensor_session_ts",
        kind: ObjectKind::Index,
        ddl: "CREATE INDEX idx_sensor_session_ts ON sensor_data (session_id, ts)",
    },
    SchemaObject {
        name: "idx_emissions_session",
        kind: ObjectKind::Index,
        ddl: "CREATE INDEX idx_emissions_session ON ghg_emissions (session_id, ts)",
    },
    SchemaObject {
        name: "idx_carbon_session",
        kind: ObjectKind::Index,
        ddl: "CREATE INDEX idx_carbon_session ON carbon_stocks (session_id, ts)",
    },
    SchemaObject {
        name: "idx_losses_session",
        kind: ObjectKind::Index,
        ddl: "CREATE INDEX idx_losses_session ON harvest_losses (session_id, ts)",
    },
];

/// An object that could not be created.
#[derive(Debug)]
pub struct SchemaFailure {
    /// Object name.
    pub name: &'static str,
    /// Table or index.
    pub kind: ObjectKind,
    /// Why creation failed.
    pub error: PersistenceError,
}

/// Outcome of [`SchemaInitializer::ensure_schema`].
#[derive(Debug, Default)]
pub struct SchemaReport {
    /// Objects created by this run.
    pub created: Vec<&'static str>,
    /// Objects that were already present (including ones a concurrent
    /// bootstrap created first).
    pub existing: Vec<&'static str>,
    /// Objects that could not be created.
    pub failed: Vec<SchemaFailure>,
}

impl SchemaReport {
    /// Whether every object now exists.
    pub const fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Creates missing tables and indices.
pub struct SchemaInitializer<'a> {
    db: &'a Persistence,
}

impl<'a> SchemaInitializer<'a> {
    /// Create an initializer bound to a persistence handle.
    pub const fn new(db: &'a Persistence) -> Self {
        Self { db }
    }

    /// Make sure every table and index exists.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] only if the catalog cannot be listed.
    /// Failures creating individual objects are reported in
    /// [`SchemaReport::failed`].
    pub async fn ensure_schema(&self) -> Result<SchemaReport, PersistenceError> {
        async {
            let provider = self.db.provider();
            let tables = self
                .db
                .run("list_tables", move || provider.existing_objects(ObjectKind::Table))
                .await?;
            let indexes = self
                .db
                .run("list_indexes", move || provider.existing_objects(ObjectKind::Index))
                .await?;

            let mut report = SchemaReport::default();
            for object in TABLES.iter().chain(INDEXES) {
                let present: &BTreeSet<String> = match object.kind {
                    ObjectKind::Table => &tables,
                    ObjectKind::Index => &indexes,
                };
                if present.contains(object.name) {
                    report.existing.push(object.name);
                    continue;
                }
                self.create(object, &mut report).await;
            }

            tracing::info!(
                created = report.created.len(),
                existing = report.existing.len(),
                failed = report.failed.len(),
                "Schema check finished"
            );
            Ok(report)
        }
        .instrument(tracing::info_span!("ensure_schema"))
        .await
    }

    async fn create(&self, object: &'static SchemaObject, report: &mut SchemaReport) {
        let provider = self.db.provider();
        let outcome = self
            .db
            .run("create_schema_object", move || async move {
                match provider.create_object(object).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_duplicate_object() => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await;

        match outcome {
            Ok(true) => {
                tracing::info!(name = object.name, kind = ?object.kind, "Created schema object");
                report.created.push(object.name);
            }
            Ok(false) => {
                tracing::debug!(name = object.name, "Schema object appeared concurrently");
                report.existing.push(object.name);
            }
            Err(error) => {
                match object.kind {
                    ObjectKind::Table => {
                        tracing::error!(name = object.name, error = %error, "Failed to create table");
                    }
                    ObjectKind::Index => {
                        tracing::warn!(name = object.name, error = %error, "Failed to create index");
                    }
                }
                report.failed.push(SchemaFailure {
                    name: object.name,
                    kind: object.kind,
                    error,
                });
            }
        }
    }
}

// =========================================================================
// PostgreSQL primitives
// =========================================================================

pub(crate) async fn select_existing(
    conn: &mut PgConnection,
    kind: ObjectKind,
) -> Result<BTreeSet<String>, StoreError> {
    let sql = match kind {
        ObjectKind::Table => {
            r"SELECT table_name::TEXT FROM information_schema.tables
              WHERE table_schema = current_schema()"
        }
        ObjectKind::Index => {
            r"SELECT indexname::TEXT FROM pg_indexes
              WHERE schemaname = current_schema()"
        }
    };
    let names = sqlx::query_scalar::<_, String>(sql)
        .fetch_all(&mut *conn)
        .await?;
    Ok(names.into_iter().collect())
}

pub(crate) async fn execute_ddl(
    conn: &mut PgConnection,
    object: &SchemaObject,
) -> Result<(), StoreError> {
    sqlx::query(object.ddl).execute(&mut *conn).await?;
    Ok(())
}
