//! End-to-end scenarios for `canewatch-db` in simulated mode.
//!
//! Simulated mode serves every operation from memory, so these run in a
//! plain `cargo test` with no database. The same contracts are exercised
//! against `PostgreSQL` in `tests/integration.rs`.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::missing_panics_doc,
    clippy::too_many_lines
)]

use std::sync::Arc;

use canewatch_db::{
    ExportPayload, FixedClock, Persistence, PersistenceConfig, PersistenceError, RecordKind,
    SIMULATED_SESSION_ID, SessionUpdate, export_session,
};
use canewatch_types::{
    EmissionScope, GasType, LossCategory, SessionId, SessionMetadata, SessionStatus, StockType,
    TimeBucket,
};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;

fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 10, 14, 30, 0).unwrap()
}

fn simulated() -> Persistence {
    let config = PersistenceConfig {
        simulated_mode: true,
        ..PersistenceConfig::default()
    };
    Persistence::from_config(&config, Arc::new(FixedClock(at()))).expect("simulated config")
}

async fn open_session(db: &Persistence, id: &str) -> SessionId {
    db.create_session(&SessionMetadata::default().with_session_id(id))
        .await
        .expect("create session")
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn session_lifecycle_runs_to_completion() {
    let db = simulated();
    let id = open_session(&db, "S-LIFE").await;

    let session = db.sessions().get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.version, 1);
    assert_eq!(session.created_by, "system");
    assert!(session.end_ts.is_none());
    assert!(db.validate_session(&id).await.unwrap());

    assert_eq!(
        db.sessions().pause(&id).await.unwrap(),
        SessionUpdate::Applied { version: 2 }
    );
    assert!(!db.validate_session(&id).await.unwrap());

    assert_eq!(
        db.sessions().resume(&id).await.unwrap(),
        SessionUpdate::Applied { version: 3 }
    );
    assert_eq!(
        db.end_session(&id, SessionStatus::Completed).await.unwrap(),
        SessionUpdate::Applied { version: 4 }
    );

    let ended = db.sessions().get(&id).await.unwrap().unwrap();
    assert_eq!(ended.status, SessionStatus::Completed);
    assert_eq!(ended.end_ts, Some(at()));
    assert!(!db.validate_session(&id).await.unwrap());

    // A second end is refused and changes nothing.
    assert_eq!(
        db.end_session(&id, SessionStatus::Aborted).await.unwrap(),
        SessionUpdate::Rejected {
            from: SessionStatus::Completed,
            to: SessionStatus::Aborted,
        }
    );
    assert_eq!(db.sessions().get(&id).await.unwrap().unwrap().version, 4);
}

#[tokio::test]
async fn duplicate_session_id_is_refused() {
    let db = simulated();
    open_session(&db, "S-DUP").await;
    let err = db
        .create_session(&SessionMetadata::default().with_session_id("S-DUP"))
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::DuplicateSession(id) if id.as_str() == "S-DUP"));
}

#[tokio::test]
async fn generated_session_ids_are_distinct() {
    let db = simulated();
    let first = db.create_session(&SessionMetadata::default()).await.unwrap();
    let second = db.create_session(&SessionMetadata::default()).await.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn stale_version_yields_conflict() {
    let db = simulated();
    let id = open_session(&db, "S-STALE").await;
    assert!(db.sessions().pause(&id).await.unwrap().is_applied());

    // A caller still holding version 1 loses.
    let update = db
        .sessions()
        .update_status_at(&id, SessionStatus::Aborted, 1)
        .await
        .unwrap();
    assert_eq!(update, SessionUpdate::Conflict { expected_version: 1 });

    let session = db.sessions().get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Paused);
    assert_eq!(session.version, 2);
}

#[tokio::test]
async fn stale_version_conflicts_even_when_the_move_matches_current_state() {
    let db = simulated();
    let id = open_session(&db, "S-STALE-SAME").await;
    assert_eq!(
        db.sessions().pause(&id).await.unwrap(),
        SessionUpdate::Applied { version: 2 }
    );

    // The stale caller asks for the state the session is already in.
    let update = db
        .sessions()
        .update_status_at(&id, SessionStatus::Paused, 1)
        .await
        .unwrap();
    assert_eq!(update, SessionUpdate::Conflict { expected_version: 1 });

    // With the current version the same move is refused by the state machine.
    let update = db
        .sessions()
        .update_status_at(&id, SessionStatus::Paused, 2)
        .await
        .unwrap();
    assert_eq!(
        update,
        SessionUpdate::Rejected {
            from: SessionStatus::Paused,
            to: SessionStatus::Paused,
        }
    );
}

#[tokio::test]
async fn stale_version_on_an_ended_session_conflicts() {
    let db = simulated();
    let id = open_session(&db, "S-STALE-END").await;
    db.end_session(&id, SessionStatus::Completed).await.unwrap();

    let update = db
        .sessions()
        .update_status_at(&id, SessionStatus::Aborted, 1)
        .await
        .unwrap();
    assert_eq!(update, SessionUpdate::Conflict { expected_version: 1 });
}

#[tokio::test]
async fn sessions_are_listed_by_start_window() {
    let db = simulated();
    let id = open_session(&db, "S-WINDOW").await;
    let hour = TimeDelta::hours(1);
    let before = at().checked_sub_signed(hour).unwrap();
    let after = at().checked_add_signed(hour).unwrap();

    let started: Vec<SessionId> = db
        .sessions()
        .list_started_between(before, after)
        .await
        .unwrap()
        .into_iter()
        .map(|session| session.id)
        .collect();
    assert!(started.contains(&id));
    assert!(started.contains(&SessionId::new(SIMULATED_SESSION_ID)));

    // Both bounds are inclusive.
    assert_eq!(
        db.sessions().list_started_between(at(), at()).await.unwrap().len(),
        started.len()
    );
    assert!(
        db.sessions()
            .list_started_between(after, after)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(matches!(
        db.sessions().list_started_between(after, before).await,
        Err(PersistenceError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn concurrent_transitions_have_one_winner() {
    let db = Arc::new(simulated());
    let id = open_session(&db, "S-RACE").await;

    let mut handles = Vec::new();
    for target in [SessionStatus::Paused, SessionStatus::Completed, SessionStatus::Aborted] {
        let db = Arc::clone(&db);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            db.sessions().update_status_at(&id, target, 1).await
        }));
    }

    let mut applied = 0_usize;
    for handle in handles {
        let update = handle.await.unwrap().unwrap();
        if update.is_applied() {
            applied = applied.saturating_add(1);
        } else {
            assert!(matches!(
                update,
                SessionUpdate::Conflict { .. } | SessionUpdate::Rejected { .. }
            ));
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(db.sessions().get(&id).await.unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn unknown_session_transitions_report_not_found() {
    let db = simulated();
    let missing = SessionId::new("S-NOPE");
    assert_eq!(db.sessions().pause(&missing).await.unwrap(), SessionUpdate::NotFound);
    assert!(!db.validate_session(&missing).await.unwrap());
    assert!(db.sessions().get(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn active_listing_skips_ended_sessions() {
    let db = simulated();
    let open = open_session(&db, "S-OPEN").await;
    let closed = open_session(&db, "S-CLOSED").await;
    db.end_session(&closed, SessionStatus::Aborted).await.unwrap();

    let active: Vec<SessionId> = db
        .sessions()
        .list_active()
        .await
        .unwrap()
        .into_iter()
        .map(|session| session.id)
        .collect();
    assert!(active.contains(&open));
    assert!(!active.contains(&closed));
    assert!(active.contains(&SessionId::new(SIMULATED_SESSION_ID)));
}

// =============================================================================
// Batches
// =============================================================================

#[tokio::test]
async fn sensor_batch_keeps_valid_readings_only() {
    let db = simulated();
    let id = open_session(&db, "S-SENSOR").await;

    let written = db
        .save_sensor_batch(
            &id,
            &json!({
                "temperature": 25.4,
                "soil_humidity": { "value": 61.0, "unit": "%", "quality_flag": "GOOD" },
                "harvester_speed": { "value": 5.1, "timestamp": "2025-04-10T14:00:00Z" },
                "gps_fix": "locked",
                "wind": { "unit": "m/s" }
            }),
        )
        .await
        .unwrap();
    assert_eq!(written, 3);

    let readings = db.sensors().query_by_session(&id).await.unwrap();
    assert_eq!(readings.len(), 3);
    // Ordered by timestamp: the explicitly stamped reading comes first.
    assert_eq!(readings[0].sensor_type, "harvester_speed");
    assert!(readings.iter().all(|r| r.quality_flag == "good"));

    let latest = db
        .sensors()
        .latest_reading(&id, "temperature")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.value, 25.4);
    assert_eq!(latest.ts, at());

    let stats = db.sensors().statistics(&id).await.unwrap();
    assert_eq!(stats.len(), 3);
    assert_eq!(stats["soil_humidity"].count, 1);

    let hourly = db
        .sensors()
        .aggregate_by_interval(&id, "temperature", TimeBucket::Hour)
        .await
        .unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].bucket_start, Utc.with_ymd_and_hms(2025, 4, 10, 14, 0, 0).unwrap());
}

#[tokio::test]
async fn sensor_readings_are_filtered_by_time_range() {
    let db = simulated();
    let id = open_session(&db, "S-RANGE").await;
    db.save_sensor_batch(
        &id,
        &json!({
            "temperature": { "value": 21.0, "timestamp": "2025-04-10T08:00:00Z" },
            "soil_humidity": { "value": 58.0, "timestamp": "2025-04-10T12:00:00Z" },
            "harvester_speed": 5.0
        }),
    )
    .await
    .unwrap();

    let morning = Utc.with_ymd_and_hms(2025, 4, 10, 8, 0, 0).unwrap();
    let noon = Utc.with_ymd_and_hms(2025, 4, 10, 12, 0, 0).unwrap();
    let in_range = db.sensors().query_time_range(&id, morning, noon).await.unwrap();
    let types: Vec<&str> = in_range.iter().map(|r| r.sensor_type.as_str()).collect();
    assert_eq!(types, ["temperature", "soil_humidity"]);

    let all = db.sensors().query_time_range(&id, morning, at()).await.unwrap();
    assert_eq!(all.len(), 3);

    assert!(matches!(
        db.sensors().query_time_range(&id, noon, morning).await,
        Err(PersistenceError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn batch_with_nothing_valid_writes_nothing() {
    let db = simulated();
    let id = open_session(&db, "S-EMPTY").await;
    assert_eq!(db.save_sensor_batch(&id, &json!({})).await.unwrap(), 0);
    assert_eq!(db.save_sensor_batch(&id, &json!([1, 2])).await.unwrap(), 0);
    assert!(db.sensors().query_by_session(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn batches_for_closed_sessions_are_refused() {
    let db = simulated();
    let id = open_session(&db, "S-ENDED").await;
    db.end_session(&id, SessionStatus::Completed).await.unwrap();

    let err = db
        .save_sensor_batch(&id, &json!({ "temperature": 20.0 }))
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidSession(_)));

    let err = db
        .save_emission_batch(&SessionId::new("S-GHOST"), &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidSession(_)));
}

#[tokio::test]
async fn emissions_roll_up_by_scope_and_category() {
    let db = simulated();
    let id = open_session(&db, "S-GHG").await;

    let written = db
        .save_emission_batch(
            &id,
            &json!({
                "scope1": {
                    "mechanical": {
                        "harvester": { "CO2": 105.3, "CO2e": 110.2 },
                        "truck": { "CO2e": 40 }
                    }
                },
                "scope2": { "grid_electricity": { "CO2e": 12 } },
                "scope3": { "fertilizer": { "N2O": -1.0 } }
            }),
        )
        .await
        .unwrap();
    assert_eq!(written, 4);

    let totals = db.emissions().totals_by_scope(&id).await.unwrap();
    assert_eq!(
        totals[&EmissionScope::Scope1][&GasType::Co2e],
        Decimal::new(1502, 1)
    );
    assert!(!totals.contains_key(&EmissionScope::Scope3));

    let by_category = db.emissions().totals_by_category(&id).await.unwrap();
    assert_eq!(by_category[&EmissionScope::Scope1]["mechanical"], Decimal::new(1502, 1));

    let scope2 = db
        .emissions()
        .query_by_scope(&id, EmissionScope::Scope2)
        .await
        .unwrap();
    assert_eq!(scope2.len(), 1);
}

#[tokio::test]
async fn carbon_stocks_amortize_and_split_by_sign() {
    let db = simulated();
    let id = open_session(&db, "S-STOCK").await;

    let written = db
        .save_carbon_stock_batch(
            &id,
            &json!({
                "above_ground_biomass": { "change_co2": -1000, "amortization_period": 10 },
                "soil_organic_carbon": { "change_co2": 400 },
                "peat": { "change_co2": 1 }
            }),
        )
        .await
        .unwrap();
    assert_eq!(written, 2);

    let flux = db.carbon_stocks().amortized_flux(&id, 1).await.unwrap();
    assert_eq!(flux[&StockType::AboveGroundBiomass], Decimal::from(-100));
    assert_eq!(flux[&StockType::SoilOrganicCarbon], Decimal::from(20));
    assert_eq!(flux[&StockType::DeadOrganicMatter], Decimal::ZERO);

    let luc = db.carbon_stocks().land_use_change_emissions(&id).await.unwrap();
    assert_eq!(luc[&StockType::AboveGroundBiomass], Decimal::from(-1000));
    let sequestered = db.carbon_stocks().sequestration(&id).await.unwrap();
    assert_eq!(sequestered[&StockType::SoilOrganicCarbon], Decimal::from(400));

    assert!(matches!(
        db.carbon_stocks().amortized_flux(&id, 0).await,
        Err(PersistenceError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn harvest_losses_feed_statistics_and_factor_frequency() {
    let db = simulated();
    let id = open_session(&db, "S-LOSS").await;

    let factor = |name: &str| {
        json!({ "factor": name, "value": 7.5, "optimal_range": [4.5, 6.5], "severity": 0.8, "direction": "above" })
    };
    let written = db
        .save_harvest_loss_batch(
            &id,
            &json!([
                { "loss_estimate": 6.0, "problematic_factors": [factor("harvester_speed")] },
                { "loss_estimate": 12.5, "problematic_factors": [factor("harvester_speed"), factor("blade_wear")] },
                { "loss_estimate": 150.0 }
            ]),
        )
        .await
        .unwrap();
    assert_eq!(written, 2);

    let stats = db.harvest_losses().statistics(&id).await.unwrap();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.categories[&LossCategory::Low], 1);
    assert_eq!(stats.categories[&LossCategory::Medium], 1);

    let frequency = db.harvest_losses().factor_frequency(&id, 0.0).await.unwrap();
    assert_eq!(frequency[0].factor, "harvester_speed");
    assert_eq!(frequency[0].count, 2);

    let speed = db
        .harvest_losses()
        .query_by_factor(&id, "blade_wear")
        .await
        .unwrap();
    assert_eq!(speed.len(), 1);
    assert_eq!(speed[0].loss_percent, 12.5);

    let low = db
        .harvest_losses()
        .query_by_category(&id, LossCategory::Low)
        .await
        .unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].loss_percent, 6.0);
    let medium = db
        .harvest_losses()
        .query_by_category(&id, LossCategory::Medium)
        .await
        .unwrap();
    assert_eq!(medium.len(), 1);
    assert_eq!(medium[0].loss_percent, 12.5);
    assert!(
        db.harvest_losses()
            .query_by_category(&id, LossCategory::High)
            .await
            .unwrap()
            .is_empty()
    );
}

// =============================================================================
// Schema, export and the seeded session
// =============================================================================

#[tokio::test]
async fn schema_bootstrap_is_idempotent() {
    let db = simulated();

    let first = db.ensure_schema().await.unwrap();
    assert!(first.is_complete());
    assert!(!first.created.is_empty());
    assert!(first.existing.is_empty());

    let second = db.ensure_schema().await.unwrap();
    assert!(second.is_complete());
    assert!(second.created.is_empty());
    assert_eq!(second.existing.len(), first.created.len());
}

#[tokio::test]
async fn export_saves_each_kind_independently() {
    let db = simulated();
    let id = open_session(&db, "S-EXPORT").await;

    let payload: ExportPayload = serde_json::from_value(json!({
        "sensor_batches": [
            { "temperature": 24.0 },
            { "temperature": 26.0, "soil_humidity": 60.0 }
        ],
        "emissions": { "scope2": { "grid_electricity": { "CO2e": 12 } } },
        "carbon_stocks": "not an object",
        "harvest_losses": { "loss_estimate": 3.0 }
    }))
    .unwrap();

    let report = export_session(&db, &id, &payload).await.unwrap();
    assert_eq!(report.sensor_readings, 3);
    assert_eq!(report.emissions, 1);
    assert_eq!(report.carbon_stocks, 0);
    assert_eq!(report.harvest_losses, 1);
    assert_eq!(report.total(), 5);
    // A malformed section yields no records but is not a store failure.
    assert!(report.is_complete());

    db.end_session(&id, SessionStatus::Completed).await.unwrap();
    let err = export_session(&db, &id, &payload).await.unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidSession(_)));
    assert_eq!(RecordKind::HarvestLosses.as_str(), "harvest_losses");
}

#[tokio::test]
async fn seeded_session_serves_canned_readings() {
    let db = simulated();
    let id = SessionId::new(SIMULATED_SESSION_ID);

    assert!(db.is_healthy().await);
    assert!(db.validate_session(&id).await.unwrap());

    let types = db.sensors().sensor_types(&id).await.unwrap();
    assert!(types.contains("temperature"));
    assert!(types.contains("soil_humidity"));

    let temperature = db
        .sensors()
        .latest_reading(&id, "temperature")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(temperature.value, 25.0);
    db.shutdown().await;
}
