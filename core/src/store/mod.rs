//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The orchestrator hands it finished records; models never see SQL.
//!
//! Every write for one run happens inside a single transaction: either the
//! manifest and all of its artifacts land together, or nothing does.

use chrono::NaiveDate;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};

use crate::{
    error::{PipelineError, PipelineResult},
    event::EventLogEntry,
    run::{PipelineRun, RunState},
    snapshot::ModelingSnapshot,
};

mod artifacts;
mod queries;

pub use queries::{CustomerFeatureRow, RevenuePeriodRow, SegmentCount};

pub struct ArtifactStore {
    conn: Connection,
}

impl ArtifactStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_artifacts.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    /// Write the manifest, its event log and every artifact present in
    /// `snapshot`, atomically. `run.state` is recorded as-is, so callers
    /// pass the run already stamped with its final state.
    ///
    /// Any failure is wrapped as a retryable `Persistence` error and leaves
    /// the database untouched.
    pub fn write_run(
        &self,
        run: &PipelineRun,
        snapshot: Option<&ModelingSnapshot>,
    ) -> PipelineResult<()> {
        self.write_run_inner(run, snapshot)
            .map_err(|e| PipelineError::Persistence {
                run_id: run.run_id.clone(),
                source: Box::new(e),
            })
    }

    fn write_run_inner(
        &self,
        run: &PipelineRun,
        snapshot: Option<&ModelingSnapshot>,
    ) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;

        if let Some(snapshot) = snapshot {
            let generated_on = run.started_at.date_naive();
            if let Some(features) = &snapshot.features {
                artifacts::insert_customer_features(
                    &tx,
                    &run.run_id,
                    &features.customers,
                    snapshot.segmentation.as_ref(),
                )?;
                artifacts::insert_revenue_periods(
                    &tx,
                    &run.run_id,
                    &features.revenue_periods,
                    snapshot.anomalies.as_ref(),
                )?;
                artifacts::insert_product_features(&tx, &run.run_id, &features.products)?;
            }
            if let Some(forecast) = &snapshot.forecast {
                artifacts::insert_forecasts(&tx, &run.run_id, generated_on, forecast)?;
            }
        }

        insert_manifest(&tx, run)?;
        for (seq, event) in run.events.iter().enumerate() {
            tx.execute(
                "INSERT INTO event_log (run_id, seq, event_type, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.run_id,
                    seq as i64,
                    event.type_name(),
                    serde_json::to_string(event)?,
                ],
            )?;
        }

        tx.commit()?;
        log::debug!("store: run {} written ({})", run.run_id, run.state.as_str());
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> PipelineResult<Option<PipelineRun>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT manifest_json FROM run_manifest WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn latest_completed_run_id(&self) -> PipelineResult<Option<String>> {
        let run_id = self
            .conn
            .query_row(
                "SELECT run_id FROM run_manifest
                 WHERE state = ?1
                 ORDER BY id DESC LIMIT 1",
                params![RunState::Complete.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }

    pub fn run_count(&self) -> PipelineResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM run_manifest", [], |row| row.get(0))?;
        Ok(n)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn events_for_run(&self, run_id: &str) -> PipelineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, seq, event_type, payload
             FROM event_log WHERE run_id = ?1
             ORDER BY seq ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    seq: row.get::<_, i64>(2)? as u64,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Row count of an artifact table for one run.
    pub fn artifact_row_count(&self, table: crate::run::ArtifactTable, run_id: &str) -> PipelineResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE run_id = ?1",
            table.table_name()
        );
        let n = self.conn.query_row(&sql, params![run_id], |row| row.get(0))?;
        Ok(n)
    }
}

fn insert_manifest(conn: &Connection, run: &PipelineRun) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO run_manifest (
            run_id, state, started_at, finished_at, as_of, seed,
            config_fingerprint, input_row_count, rejected_row_count,
            partial, warning_count, manifest_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            run.run_id,
            run.state.as_str(),
            run.started_at.to_rfc3339(),
            run.finished_at.map(|t| t.to_rfc3339()),
            run.as_of.map(|d| d.to_string()),
            run.seed as i64,
            run.config_fingerprint,
            run.input_row_count as i64,
            run.rejected_row_count as i64,
            run.partial,
            run.warnings.len() as i64,
            serde_json::to_string(run)?,
        ],
    )?;
    Ok(())
}

/// Read a `YYYY-MM-DD` text column.
fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
