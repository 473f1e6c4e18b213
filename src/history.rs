// 🕰️ History Store - Append-only snapshot timeline
//
// One snapshot per run (daily) or per backfilled month (monthly), both in the
// same timeline and ordered by generation time. Snapshots are written in a
// single SQLite transaction: either every row of a snapshot is visible or none.
// Corrections append a new snapshot; nothing is updated in place.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::entities::NO_IATA;
use crate::scoring::{AirportExposure, CountryScore, ScoringMethod};

// ============================================================================
// SNAPSHOT MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Live run
    Daily,
    /// Backfilled month
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Result<Granularity> {
        match value {
            "daily" => Ok(Granularity::Daily),
            "monthly" => Ok(Granularity::Monthly),
            other => bail!("Unknown snapshot granularity '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountrySnapshot {
    pub iso_code: String,
    pub name: String,
    pub score: f64,
    pub earthquake_count: usize,
    pub exposed_airport_count: usize,
    pub avg_magnitude: f64,
    pub max_magnitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirportSnapshot {
    pub iata_code: String,
    pub name: String,
    pub country_code: String,
    pub exposure: f64,
    pub nearby_quake_count: usize,
    pub closest_quake_km: f64,
    pub max_pga_g: Option<f64>,
    pub max_mmi: Option<f64>,
}

impl AirportSnapshot {
    /// Stable identity across snapshots. Airports without IATA code fall back
    /// to country and name.
    pub fn key(&self) -> String {
        airport_key(&self.iata_code, &self.country_code, &self.name)
    }
}

pub fn airport_key(iata_code: &str, country_code: &str, name: &str) -> String {
    if iata_code == NO_IATA {
        format!("{}:{}:{}", NO_IATA, country_code, name)
    } else {
        iata_code.to_string()
    }
}

/// Immutable capture of one run's scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub generated_at: DateTime<Utc>,
    pub granularity: Granularity,
    pub scoring_method: ScoringMethod,

    /// Keyed by ISO alpha-2
    pub countries: BTreeMap<String, CountrySnapshot>,

    /// Keyed by [`AirportSnapshot::key`]
    pub airports: BTreeMap<String, AirportSnapshot>,
}

impl Snapshot {
    pub fn new(generated_at: DateTime<Utc>, granularity: Granularity, scoring_method: ScoringMethod) -> Self {
        Snapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            generated_at,
            granularity,
            scoring_method,
            countries: BTreeMap::new(),
            airports: BTreeMap::new(),
        }
    }

    /// Capture finished country scores and their exposed airports
    pub fn from_scores(
        scores: &[CountryScore],
        generated_at: DateTime<Utc>,
        granularity: Granularity,
        scoring_method: ScoringMethod,
    ) -> Self {
        let mut snapshot = Snapshot::new(generated_at, granularity, scoring_method);

        for score in scores {
            snapshot.add_country(CountrySnapshot {
                iso_code: score.iso_code.clone(),
                name: score.name.clone(),
                score: score.score,
                earthquake_count: score.earthquake_count,
                exposed_airport_count: score.exposed_airport_count,
                avg_magnitude: score.stats.avg_magnitude,
                max_magnitude: score.stats.max_magnitude,
            });
            for exposure in &score.airports {
                snapshot.add_airport(airport_snapshot(exposure));
            }
        }

        snapshot
    }

    pub fn add_country(&mut self, country: CountrySnapshot) {
        self.countries.insert(country.iso_code.clone(), country);
    }

    pub fn add_airport(&mut self, airport: AirportSnapshot) {
        self.airports.insert(airport.key(), airport);
    }
}

fn airport_snapshot(exposure: &AirportExposure) -> AirportSnapshot {
    AirportSnapshot {
        iata_code: exposure.airport.iata_code.clone(),
        name: exposure.airport.name.clone(),
        country_code: exposure.airport.country_code.clone(),
        exposure: exposure.total_exposure,
        nearby_quake_count: exposure.nearby_quake_count(),
        closest_quake_km: exposure.closest_quake_km,
        max_pga_g: exposure.max_pga_g(),
        max_mmi: exposure.max_mmi(),
    }
}

// ============================================================================
// TIMELINE
// ============================================================================

/// Readable snapshots in timestamp order, oldest first
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub snapshots: Vec<Snapshot>,

    /// Stored snapshots that could not be decoded
    pub skipped: usize,
}

impl Timeline {
    pub fn new(snapshots: Vec<Snapshot>) -> Self {
        let mut snapshots = snapshots;
        snapshots.sort_by_key(|s| s.generated_at);
        Timeline { snapshots, skipped: 0 }
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Snapshot immediately before the latest
    pub fn previous(&self) -> Option<&Snapshot> {
        self.snapshots.len().checked_sub(2).map(|i| &self.snapshots[i])
    }

    /// Add a snapshot that never reached the store; it sorts after stored
    /// snapshots with the same timestamp
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Timeline {
        let at = self
            .snapshots
            .partition_point(|s| s.generated_at <= snapshot.generated_at);
        self.snapshots.insert(at, snapshot);
        self
    }

    /// Drop snapshots generated after `at`
    pub fn until(mut self, at: DateTime<Utc>) -> Timeline {
        self.snapshots.retain(|s| s.generated_at <= at);
        self
    }

    /// Keep the `n` most recent snapshots
    pub fn keep_recent(mut self, n: usize) -> Timeline {
        if self.snapshots.len() > n {
            self.snapshots.drain(..self.snapshots.len() - n);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create history directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history database {}", path.display()))?;
        setup_history_schema(&conn)?;
        debug!("History store opened at {}", path.display());

        Ok(HistoryStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory history")?;
        setup_history_schema(&conn)?;
        Ok(HistoryStore { conn: Mutex::new(conn) })
    }

    /// Append a snapshot in one transaction. Returns its row id.
    pub fn append(&self, snapshot: &Snapshot) -> Result<i64> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("History store lock poisoned"))?;
        let tx = conn.transaction().context("Failed to begin snapshot transaction")?;

        tx.execute(
            "INSERT INTO snapshots (snapshot_id, generated_at, granularity, scoring_method)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.snapshot_id,
                snapshot.generated_at.to_rfc3339(),
                snapshot.granularity.as_str(),
                snapshot.scoring_method.as_str(),
            ],
        )
        .with_context(|| format!("Failed to insert snapshot {}", snapshot.snapshot_id))?;
        let row_id = tx.last_insert_rowid();

        {
            let mut insert_country = tx.prepare(
                "INSERT INTO snapshot_countries (
                    snapshot_row, iso_code, name, score, earthquake_count,
                    exposed_airport_count, avg_magnitude, max_magnitude
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for c in snapshot.countries.values() {
                insert_country.execute(params![
                    row_id,
                    c.iso_code,
                    c.name,
                    c.score,
                    c.earthquake_count as i64,
                    c.exposed_airport_count as i64,
                    c.avg_magnitude,
                    c.max_magnitude,
                ])?;
            }

            let mut insert_airport = tx.prepare(
                "INSERT INTO snapshot_airports (
                    snapshot_row, airport_key, iata_code, name, country_code, exposure,
                    nearby_quake_count, closest_quake_km, max_pga_g, max_mmi
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (key, a) in &snapshot.airports {
                insert_airport.execute(params![
                    row_id,
                    key,
                    a.iata_code,
                    a.name,
                    a.country_code,
                    a.exposure,
                    a.nearby_quake_count as i64,
                    a.closest_quake_km,
                    a.max_pga_g,
                    a.max_mmi,
                ])?;
            }
        }

        tx.commit().context("Failed to commit snapshot")?;
        info!(
            "Snapshot {} stored ({} countries, {} airports, {})",
            snapshot.snapshot_id,
            snapshot.countries.len(),
            snapshot.airports.len(),
            snapshot.granularity.as_str()
        );
        Ok(row_id)
    }

    pub fn snapshot_count(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("History store lock poisoned"))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Load every readable snapshot ordered by (timestamp, insertion order),
    /// keeping the `window` most recent. Malformed entries are skipped.
    pub fn load_timeline(&self, window: Option<usize>) -> Result<Timeline> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("History store lock poisoned"))?;

        let headers: Vec<SnapshotHeader> = {
            let mut stmt = conn.prepare(
                "SELECT id, snapshot_id, generated_at, granularity, scoring_method
                 FROM snapshots ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SnapshotHeader {
                    row_id: row.get(0)?,
                    snapshot_id: row.get(1)?,
                    generated_at: row.get(2)?,
                    granularity: row.get(3)?,
                    scoring_method: row.get(4)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read snapshot index")?
        };

        let mut loaded: Vec<(DateTime<Utc>, i64, Snapshot)> = Vec::with_capacity(headers.len());
        let mut skipped = 0;

        for header in headers {
            match read_snapshot(&conn, &header) {
                Ok(snapshot) => loaded.push((snapshot.generated_at, header.row_id, snapshot)),
                Err(e) => {
                    warn!("Skipping unreadable snapshot row {}: {:#}", header.row_id, e);
                    skipped += 1;
                }
            }
        }

        // Equal timestamps keep insertion order
        loaded.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let timeline = Timeline {
            snapshots: loaded.into_iter().map(|(_, _, s)| s).collect(),
            skipped,
        };
        Ok(match window {
            Some(n) => timeline.keep_recent(n),
            None => timeline,
        })
    }
}

struct SnapshotHeader {
    row_id: i64,
    snapshot_id: String,
    generated_at: String,
    granularity: String,
    scoring_method: String,
}

fn read_snapshot(conn: &Connection, header: &SnapshotHeader) -> Result<Snapshot> {
    let generated_at = DateTime::parse_from_rfc3339(&header.generated_at)
        .with_context(|| format!("Bad timestamp '{}'", header.generated_at))?
        .with_timezone(&Utc);
    let granularity = Granularity::parse(&header.granularity)?;
    let scoring_method = ScoringMethod::parse(&header.scoring_method)?;

    let mut snapshot = Snapshot {
        snapshot_id: header.snapshot_id.clone(),
        generated_at,
        granularity,
        scoring_method,
        countries: BTreeMap::new(),
        airports: BTreeMap::new(),
    };

    let mut stmt = conn.prepare(
        "SELECT iso_code, name, score, earthquake_count, exposed_airport_count,
                avg_magnitude, max_magnitude
         FROM snapshot_countries WHERE snapshot_row = ?1",
    )?;
    let countries = stmt.query_map(params![header.row_id], |row| {
        Ok(CountrySnapshot {
            iso_code: row.get(0)?,
            name: row.get(1)?,
            score: row.get(2)?,
            earthquake_count: row.get::<_, i64>(3)? as usize,
            exposed_airport_count: row.get::<_, i64>(4)? as usize,
            avg_magnitude: row.get(5)?,
            max_magnitude: row.get(6)?,
        })
    })?;
    for country in countries {
        snapshot.add_country(country.context("Unreadable country row")?);
    }

    let mut stmt = conn.prepare(
        "SELECT iata_code, name, country_code, exposure, nearby_quake_count,
                closest_quake_km, max_pga_g, max_mmi
         FROM snapshot_airports WHERE snapshot_row = ?1",
    )?;
    let airports = stmt.query_map(params![header.row_id], |row| {
        Ok(AirportSnapshot {
            iata_code: row.get(0)?,
            name: row.get(1)?,
            country_code: row.get(2)?,
            exposure: row.get(3)?,
            nearby_quake_count: row.get::<_, i64>(4)? as usize,
            closest_quake_km: row.get(5)?,
            max_pga_g: row.get(6)?,
            max_mmi: row.get(7)?,
        })
    })?;
    for airport in airports {
        snapshot.add_airport(airport.context("Unreadable airport row")?);
    }

    Ok(snapshot)
}

pub fn setup_history_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_id TEXT UNIQUE NOT NULL,
            generated_at TEXT NOT NULL,
            granularity TEXT NOT NULL,
            scoring_method TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS snapshot_countries (
            snapshot_row INTEGER NOT NULL REFERENCES snapshots(id),
            iso_code TEXT NOT NULL,
            name TEXT NOT NULL,
            score REAL NOT NULL,
            earthquake_count INTEGER NOT NULL,
            exposed_airport_count INTEGER NOT NULL,
            avg_magnitude REAL NOT NULL,
            max_magnitude REAL NOT NULL,
            PRIMARY KEY (snapshot_row, iso_code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS snapshot_airports (
            snapshot_row INTEGER NOT NULL REFERENCES snapshots(id),
            airport_key TEXT NOT NULL,
            iata_code TEXT NOT NULL,
            name TEXT NOT NULL,
            country_code TEXT NOT NULL,
            exposure REAL NOT NULL,
            nearby_quake_count INTEGER NOT NULL,
            closest_quake_km REAL NOT NULL,
            max_pga_g REAL,
            max_mmi REAL,
            PRIMARY KEY (snapshot_row, airport_key)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_generated_at ON snapshots(generated_at)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// BACKFILL
// ============================================================================

/// One full calendar month of backfilled history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthRange {
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,

    /// Last second of the month, UTC
    pub snapshot_at: DateTime<Utc>,
}

impl MonthRange {
    /// Midnight UTC on the first day
    pub fn start(&self) -> Result<DateTime<Utc>> {
        midnight(self.first_day)
    }

    /// Midnight UTC on the first day of the next month; events at or after
    /// it are outside the month
    pub fn end_exclusive(&self) -> Result<DateTime<Utc>> {
        let next = self
            .last_day
            .succ_opt()
            .ok_or_else(|| anyhow!("No day after {}", self.last_day))?;
        midnight(next)
    }
}

fn midnight(day: NaiveDate) -> Result<DateTime<Utc>> {
    let at = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("Invalid midnight for {}", day))?;
    Ok(Utc.from_utc_datetime(&at))
}

/// Every full month from `start_year-start_month` up to, not including, the
/// month of `end_date`
pub fn month_ranges(start_year: i32, start_month: u32, end_date: NaiveDate) -> Result<Vec<MonthRange>> {
    if !(1..=12).contains(&start_month) {
        bail!("Invalid start month {}", start_month);
    }

    let end = (end_date.year(), end_date.month());
    let (mut year, mut month) = (start_year, start_month);
    let mut ranges = Vec::new();

    while (year, month) < end {
        let first_day = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| anyhow!("Invalid month {}-{:02}", year, month))?;
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        let last_day = NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .and_then(|d| d.pred_opt())
            .ok_or_else(|| anyhow!("Invalid month {}-{:02}", year, month))?;
        let end_of_day = last_day
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| anyhow!("Invalid end of day for {}", last_day))?;

        ranges.push(MonthRange {
            first_day,
            last_day,
            snapshot_at: Utc.from_utc_datetime(&end_of_day),
        });

        year = next_year;
        month = next_month;
    }

    Ok(ranges)
}

// ============================================================================
// TESTS
// ============================================================================
