//! SQLite-backed node observation history.
//!
//! One table, WAL mode, a single connection shared across tasks under the
//! store's mutex. Recording is throttled to one observation per node per
//! throttle window (checked under the lock, so concurrent writers cannot
//! double-record). If the database cannot be initialized the store degrades
//! to a no-op: writes are dropped and reads return empty results.
//!
//! The schema is a compatibility surface — other tools read this file:
//!   observations(id PK, node_id, timestamp, latitude, longitude,
//!                altitude, network, snr, battery, name)
//!   + indices (node_id, timestamp) and (timestamp)

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use crate::clock::now_epoch;
use crate::geojson::{Feature, FeatureCollection};

pub const DEFAULT_THROTTLE_SECONDS: i64 = 60;
pub const DEFAULT_RETENTION_SECONDS: i64 = 30 * 24 * 3600;
pub const MAX_TRAJECTORY_POINTS: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub node_id: String,
    pub timestamp: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub network: Option<String>,
    pub snr: Option<f64>,
    pub battery: Option<i64>,
    pub name: Option<String>,
}

struct HistoryInner {
    conn: Option<Connection>,
    // node_id -> last recorded timestamp, for throttling
    last_recorded: HashMap<String, i64>,
}

pub struct NodeHistoryStore {
    inner: Mutex<HistoryInner>,
    throttle_seconds: i64,
    retention_seconds: i64,
}

impl NodeHistoryStore {
    pub fn open(path: &Path, throttle_seconds: i64, retention_seconds: i64) -> Self {
        let conn = match Self::init_connection(path) {
            Ok(conn) => {
                info!("node history DB initialized at {}", path.display());
                Some(conn)
            }
            Err(e) => {
                error!("failed to initialize node history DB: {e}");
                None
            }
        };
        Self {
            inner: Mutex::new(HistoryInner {
                conn,
                last_recorded: HashMap::new(),
            }),
            throttle_seconds,
            retention_seconds,
        }
    }

    pub fn open_in_memory(throttle_seconds: i64, retention_seconds: i64) -> Self {
        let conn = Connection::open_in_memory()
            .and_then(|conn| Self::init_schema(&conn).map(|_| conn))
            .ok();
        Self {
            inner: Mutex::new(HistoryInner {
                conn,
                last_recorded: HashMap::new(),
            }),
            throttle_seconds,
            retention_seconds,
        }
    }

    fn init_connection(path: &Path) -> anyhow::Result<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                altitude REAL,
                network TEXT,
                snr REAL,
                battery INTEGER,
                name TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_obs_node_time
                ON observations (node_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_obs_time
                ON observations (timestamp);",
        )
    }

    pub fn is_available(&self) -> bool {
        self.inner.lock().unwrap().conn.is_some()
    }

    /// Record one observation unless the node was recorded inside the
    /// throttle window. Returns whether a row was written.
    pub fn record_observation(&self, obs: &Observation) -> bool {
        let now = obs.timestamp.unwrap_or_else(now_epoch);
        let mut inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return false;
        };

        let last = inner.last_recorded.get(&obs.node_id).copied().unwrap_or(0);
        if now - last < self.throttle_seconds {
            return false;
        }

        let result = conn.execute(
            "INSERT INTO observations
                (node_id, timestamp, latitude, longitude, altitude, network, snr, battery, name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                obs.node_id,
                now,
                obs.latitude,
                obs.longitude,
                obs.altitude,
                obs.network,
                obs.snr,
                obs.battery,
                obs.name,
            ],
        );
        match result {
            Ok(_) => {
                inner.last_recorded.insert(obs.node_id.clone(), now);
                true
            }
            Err(e) => {
                debug!("failed to record observation for {}: {e}", obs.node_id);
                false
            }
        }
    }

    /// Node trajectory as a FeatureCollection holding one LineString (or a
    /// Point for a single sample) in time order.
    pub fn get_trajectory_geojson(
        &self,
        node_id: &str,
        since: Option<i64>,
        until: Option<i64>,
        limit: usize,
    ) -> FeatureCollection {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return FeatureCollection::empty("node_history");
        };

        let rows: Vec<(i64, f64, f64, Option<f64>)> = conn
            .prepare(
                "SELECT timestamp, latitude, longitude, altitude FROM observations
                 WHERE node_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp ASC LIMIT ?4",
            )
            .and_then(|mut stmt| {
                stmt.query_map(
                    params![
                        node_id,
                        since.unwrap_or(0),
                        until.unwrap_or(i64::MAX),
                        limit as i64
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?
                .collect()
            })
            .unwrap_or_else(|e| {
                error!("trajectory query failed for {node_id}: {e}");
                Vec::new()
            });

        if rows.is_empty() {
            return FeatureCollection::empty("node_history");
        }

        let mut coordinates = Vec::with_capacity(rows.len());
        let timestamps: Vec<i64> = rows.iter().map(|r| r.0).collect();
        for (_, lat, lon, alt) in &rows {
            let mut coord = vec![*lon, *lat];
            if let Some(alt) = alt {
                coord.push(*alt);
            }
            coordinates.push(coord);
        }

        let mut props = Map::new();
        props.insert("node_id".into(), json!(node_id));
        props.insert("point_count".into(), json!(coordinates.len()));
        props.insert("first_seen".into(), json!(timestamps.first()));
        props.insert("last_seen".into(), json!(timestamps.last()));
        props.insert(
            "time_span_seconds".into(),
            json!(if timestamps.len() > 1 {
                timestamps[timestamps.len() - 1] - timestamps[0]
            } else {
                0
            }),
        );

        let feature = if coordinates.len() == 1 {
            Feature::with_geometry(
                json!({"type": "Point", "coordinates": coordinates[0]}),
                props,
            )
        } else {
            Feature::line_string(coordinates, props)
        };
        FeatureCollection::new(vec![feature], "node_history")
    }

    /// Raw observation rows for one node, newest first.
    pub fn get_node_history(&self, node_id: &str, since: Option<i64>, limit: usize) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return Vec::new();
        };
        conn.prepare(
            "SELECT timestamp, latitude, longitude, altitude, network, snr, battery, name
             FROM observations
             WHERE node_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC LIMIT ?3",
        )
        .and_then(|mut stmt| {
            stmt.query_map(
                params![node_id, since.unwrap_or(0), limit as i64],
                |row| {
                    Ok(json!({
                        "timestamp": row.get::<_, i64>(0)?,
                        "latitude": row.get::<_, f64>(1)?,
                        "longitude": row.get::<_, f64>(2)?,
                        "altitude": row.get::<_, Option<f64>>(3)?,
                        "network": row.get::<_, Option<String>>(4)?,
                        "snr": row.get::<_, Option<f64>>(5)?,
                        "battery": row.get::<_, Option<i64>>(6)?,
                        "name": row.get::<_, Option<String>>(7)?,
                    }))
                },
            )?
            .collect()
        })
        .unwrap_or_else(|e| {
            error!("history query failed for {node_id}: {e}");
            Vec::new()
        })
    }

    /// Most-recent-per-node state at or before `timestamp`, as Point
    /// features. `MAX(id)` breaks same-timestamp ties.
    pub fn get_snapshot(&self, timestamp: i64) -> FeatureCollection {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return FeatureCollection::empty("node_history");
        };

        type SnapshotRow = (
            String,
            i64,
            f64,
            f64,
            Option<f64>,
            Option<String>,
            Option<f64>,
            Option<i64>,
            Option<String>,
        );
        let rows: Vec<SnapshotRow> = conn
            .prepare(
                "SELECT o.node_id, o.timestamp, o.latitude, o.longitude,
                        o.altitude, o.network, o.snr, o.battery, o.name
                 FROM observations o
                 INNER JOIN (
                     SELECT MAX(id) AS max_id
                     FROM observations
                     WHERE timestamp <= ?1
                     GROUP BY node_id
                 ) latest ON o.id = latest.max_id",
            )
            .and_then(|mut stmt| {
                stmt.query_map(params![timestamp], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                })?
                .collect()
            })
            .unwrap_or_else(|e| {
                error!("snapshot query failed: {e}");
                Vec::new()
            });

        let features: Vec<Feature> = rows
            .into_iter()
            .map(|(node_id, ts, lat, lon, alt, network, snr, battery, name)| {
                let mut props = Map::new();
                props.insert("id".into(), json!(node_id));
                props.insert(
                    "name".into(),
                    json!(name.filter(|n| !n.is_empty()).unwrap_or_else(|| node_id.clone())),
                );
                props.insert(
                    "network".into(),
                    json!(network.filter(|n| !n.is_empty()).unwrap_or_else(|| "unknown".into())),
                );
                props.insert("last_seen".into(), json!(ts));
                if let Some(snr) = snr {
                    props.insert("snr".into(), json!(snr));
                }
                if let Some(battery) = battery {
                    props.insert("battery".into(), json!(battery));
                }
                let mut coord = vec![lon, lat];
                if let Some(alt) = alt {
                    props.insert("altitude".into(), json!(alt));
                    coord.push(alt);
                }
                Feature::with_geometry(json!({"type": "Point", "coordinates": coord}), props)
            })
            .collect();

        let mut fc = FeatureCollection::new(features, "node_history");
        fc.properties.insert("snapshot_time".into(), json!(timestamp));
        fc
    }

    /// Observation density as `(lat, lon, count)` cells, densest first.
    /// `precision` is decimal places of the grid (4 ≈ 11 m cells).
    pub fn get_density_points(
        &self,
        precision: u32,
        since: Option<i64>,
        until: Option<i64>,
        network: Option<&str>,
    ) -> Vec<(f64, f64, i64)> {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return Vec::new();
        };
        conn.prepare(
            "SELECT ROUND(latitude, ?1) AS lat, ROUND(longitude, ?1) AS lon, COUNT(*) AS cnt
             FROM observations
             WHERE timestamp >= ?2 AND timestamp <= ?3
               AND (?4 IS NULL OR network = ?4)
             GROUP BY lat, lon
             ORDER BY cnt DESC",
        )
        .and_then(|mut stmt| {
            stmt.query_map(
                params![
                    precision as i64,
                    since.unwrap_or(0),
                    until.unwrap_or(i64::MAX),
                    network
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .collect()
        })
        .unwrap_or_else(|e| {
            error!("density query failed: {e}");
            Vec::new()
        })
    }

    /// All nodes with observation counts and time ranges, most recent
    /// first.
    pub fn get_tracked_nodes(&self) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return Vec::new();
        };
        conn.prepare(
            "SELECT node_id, COUNT(*), MIN(timestamp), MAX(timestamp)
             FROM observations GROUP BY node_id ORDER BY MAX(timestamp) DESC",
        )
        .and_then(|mut stmt| {
            stmt.query_map([], |row| {
                Ok(json!({
                    "node_id": row.get::<_, String>(0)?,
                    "observation_count": row.get::<_, i64>(1)?,
                    "first_seen": row.get::<_, i64>(2)?,
                    "last_seen": row.get::<_, i64>(3)?,
                }))
            })?
            .collect()
        })
        .unwrap_or_else(|e| {
            error!("tracked nodes query failed: {e}");
            Vec::new()
        })
    }

    /// Delete rows older than the retention window (or an explicit cutoff).
    /// Returns the number of deleted rows.
    pub fn prune_old_data(&self, before_timestamp: Option<i64>) -> usize {
        let cutoff = before_timestamp.unwrap_or_else(|| now_epoch() - self.retention_seconds);
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return 0;
        };
        match conn.execute("DELETE FROM observations WHERE timestamp < ?1", params![cutoff]) {
            Ok(deleted) => {
                if deleted > 0 {
                    info!("pruned {deleted} old node history observations");
                }
                deleted
            }
            Err(e) => {
                error!("prune failed: {e}");
                0
            }
        }
    }

    pub fn observation_count(&self) -> i64 {
        self.scalar("SELECT COUNT(*) FROM observations")
    }

    pub fn node_count(&self) -> i64 {
        self.scalar("SELECT COUNT(DISTINCT node_id) FROM observations")
    }

    fn scalar(&self, sql: &str) -> i64 {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return 0;
        };
        conn.query_row(sql, [], |row| row.get(0))
            .optional()
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    // ── Analytics queries ────────────────────────────────────────────────

    /// `(bucket_start, unique_nodes, observations)` rows in ascending time.
    pub fn growth_buckets(&self, since: i64, until: i64, bucket_seconds: i64) -> Vec<(i64, i64, i64)> {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return Vec::new();
        };
        conn.prepare(
            "SELECT (timestamp / ?1) * ?1 AS bucket_start,
                    COUNT(DISTINCT node_id), COUNT(*)
             FROM observations
             WHERE timestamp >= ?2 AND timestamp <= ?3
             GROUP BY bucket_start ORDER BY bucket_start ASC",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![bucket_seconds, since, until], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect()
        })
        .unwrap_or_else(|e| {
            error!("growth query failed: {e}");
            Vec::new()
        })
    }

    /// Observation counts by hour of day (index = hour 0–23).
    pub fn hourly_histogram(&self, since: i64, until: i64) -> [i64; 24] {
        let mut hours = [0i64; 24];
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return hours;
        };
        let rows: Vec<(i64, i64)> = conn
            .prepare(
                "SELECT CAST(strftime('%H', timestamp, 'unixepoch') AS INTEGER) AS hour, COUNT(*)
                 FROM observations
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                 GROUP BY hour ORDER BY hour ASC",
            )
            .and_then(|mut stmt| {
                stmt.query_map(params![since, until], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect()
            })
            .unwrap_or_else(|e| {
                error!("heatmap query failed: {e}");
                Vec::new()
            });
        for (hour, count) in rows {
            if (0..24).contains(&hour) {
                hours[hour as usize] = count;
            }
        }
        hours
    }

    /// Top nodes by observation count within the window.
    pub fn activity_ranking(&self, since: i64, limit: usize) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return Vec::new();
        };
        conn.prepare(
            "SELECT node_id, COUNT(*), MIN(timestamp), MAX(timestamp), network
             FROM observations
             WHERE timestamp >= ?1
             GROUP BY node_id ORDER BY COUNT(*) DESC LIMIT ?2",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![since, limit as i64], |row| {
                let first: i64 = row.get(2)?;
                let last: i64 = row.get(3)?;
                Ok(json!({
                    "node_id": row.get::<_, String>(0)?,
                    "observation_count": row.get::<_, i64>(1)?,
                    "first_seen": first,
                    "last_seen": last,
                    "network": row.get::<_, Option<String>>(4)?,
                    "active_seconds": last - first,
                }))
            })?
            .collect()
        })
        .unwrap_or_else(|e| {
            error!("ranking query failed: {e}");
            Vec::new()
        })
    }

    /// `(unique_nodes, total_observations)` within the window.
    pub fn network_totals(&self, since: i64) -> (i64, i64) {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return (0, 0);
        };
        conn.query_row(
            "SELECT COUNT(DISTINCT node_id), COUNT(*) FROM observations WHERE timestamp >= ?1",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap_or((0, 0))
    }

    /// Per-network `(network, node_count, observation_count)` breakdown.
    pub fn network_breakdown(&self, since: i64) -> Vec<(String, i64, i64)> {
        let inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conn.as_ref() else {
            return Vec::new();
        };
        conn.prepare(
            "SELECT COALESCE(NULLIF(network, ''), 'unknown') AS net,
                    COUNT(DISTINCT node_id), COUNT(*)
             FROM observations
             WHERE timestamp >= ?1
             GROUP BY net ORDER BY COUNT(DISTINCT node_id) DESC",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![since], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect()
        })
        .unwrap_or_else(|e| {
            error!("network breakdown query failed: {e}");
            Vec::new()
        })
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conn) = inner.conn.take() {
            drop(conn);
            debug!("node history DB closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> NodeHistoryStore {
        NodeHistoryStore::open_in_memory(0, DEFAULT_RETENTION_SECONDS)
    }

    fn obs(node_id: &str, ts: i64, lat: f64, lon: f64) -> Observation {
        Observation {
            node_id: node_id.to_string(),
            timestamp: Some(ts),
            latitude: lat,
            longitude: lon,
            network: Some("meshtastic".into()),
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_observation() {
        let store = store();
        assert!(store.is_available());
        let mut observation = obs("!a1", 1000, 40.0, -105.0);
        observation.altitude = Some(1655.0);
        observation.snr = Some(7.5);
        observation.battery = Some(88);
        observation.name = Some("Alpha".into());
        assert!(store.record_observation(&observation));

        let rows = store.get_node_history("!a1", None, 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["timestamp"], json!(1000));
        assert_eq!(rows[0]["latitude"], json!(40.0));
        assert_eq!(rows[0]["snr"], json!(7.5));
        assert_eq!(rows[0]["battery"], json!(88));
        assert_eq!(rows[0]["name"], json!("Alpha"));
    }

    #[test]
    fn throttle_limits_one_observation_per_window() {
        let store = NodeHistoryStore::open_in_memory(60, DEFAULT_RETENTION_SECONDS);
        assert!(store.record_observation(&obs("!a1", 1000, 40.0, -105.0)));
        assert!(!store.record_observation(&obs("!a1", 1030, 40.1, -105.1)));
        assert!(store.record_observation(&obs("!a1", 1060, 40.2, -105.2)));
        // Different node is unaffected
        assert!(store.record_observation(&obs("!b2", 1030, 41.0, -104.0)));
        assert_eq!(store.observation_count(), 3);
    }

    #[test]
    fn trajectory_is_time_ordered() {
        let store = store();
        // Insert out of order
        store.record_observation(&obs("!a1", 3000, 40.2, -105.2));
        store.record_observation(&obs("!a1", 1000, 40.0, -105.0));
        store.record_observation(&obs("!a1", 2000, 40.1, -105.1));

        let fc = store.get_trajectory_geojson("!a1", None, None, MAX_TRAJECTORY_POINTS);
        assert_eq!(fc.features.len(), 1);
        let feature = &fc.features[0];
        assert_eq!(feature.geometry["type"], json!("LineString"));
        assert_eq!(
            feature.geometry["coordinates"],
            json!([[-105.0, 40.0], [-105.1, 40.1], [-105.2, 40.2]])
        );
        assert_eq!(feature.properties["point_count"], json!(3));
        assert_eq!(feature.properties["time_span_seconds"], json!(2000));
    }

    #[test]
    fn single_sample_trajectory_is_point() {
        let store = store();
        store.record_observation(&obs("!a1", 1000, 40.0, -105.0));
        let fc = store.get_trajectory_geojson("!a1", None, None, 100);
        assert_eq!(fc.features[0].geometry["type"], json!("Point"));
    }

    #[test]
    fn trajectory_window_filters() {
        let store = store();
        for ts in [1000, 2000, 3000, 4000] {
            store.record_observation(&obs("!a1", ts, 40.0, -105.0));
        }
        let fc = store.get_trajectory_geojson("!a1", Some(2000), Some(3000), 100);
        assert_eq!(fc.features[0].properties["point_count"], json!(2));
    }

    #[test]
    fn snapshot_takes_latest_row_per_node_with_id_tiebreak() {
        let store = store();
        store.record_observation(&obs("!a1", 1000, 40.0, -105.0));
        store.record_observation(&obs("!a1", 2000, 40.5, -105.5));
        // Same timestamp twice: higher id (later insert) wins
        store.record_observation(&obs("!b2", 1500, 41.0, -104.0));
        store.record_observation(&obs("!b2", 1500, 41.5, -104.5));
        // After the snapshot time: excluded
        store.record_observation(&obs("!a1", 9000, 49.0, -100.0));

        let fc = store.get_snapshot(2500);
        assert_eq!(fc.features.len(), 2);
        assert_eq!(fc.properties["snapshot_time"], json!(2500));
        let a = fc.features.iter().find(|f| f.id() == Some("!a1")).unwrap();
        assert_eq!(a.geometry["coordinates"], json!([-105.5, 40.5]));
        let b = fc.features.iter().find(|f| f.id() == Some("!b2")).unwrap();
        assert_eq!(b.geometry["coordinates"], json!([-104.5, 41.5]));
    }

    #[test]
    fn density_groups_and_sorts() {
        let store = store();
        store.record_observation(&obs("!a1", 1000, 40.00001, -105.00001));
        store.record_observation(&obs("!b2", 1100, 40.00002, -105.00002));
        store.record_observation(&obs("!c3", 1200, 41.0, -104.0));

        let cells = store.get_density_points(3, None, None, None);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].2, 2); // densest first
        assert!((cells[0].0 - 40.0).abs() < 1e-6);

        let filtered = store.get_density_points(3, None, None, Some("aredn"));
        assert!(filtered.is_empty());
    }

    #[test]
    fn prune_deletes_and_counts() {
        let store = store();
        store.record_observation(&obs("!a1", 1000, 40.0, -105.0));
        store.record_observation(&obs("!a1", 5000, 40.1, -105.1));
        assert_eq!(store.prune_old_data(Some(2000)), 1);
        assert_eq!(store.observation_count(), 1);
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn degraded_store_is_noop() {
        let store = store();
        store.close();
        assert!(!store.is_available());
        assert!(!store.record_observation(&obs("!a1", 1000, 40.0, -105.0)));
        assert!(store.get_node_history("!a1", None, 10).is_empty());
        assert!(store.get_trajectory_geojson("!a1", None, None, 10).features.is_empty());
        assert_eq!(store.observation_count(), 0);
    }

    #[test]
    fn growth_buckets_aggregate() {
        let store = store();
        store.record_observation(&obs("!a1", 100, 40.0, -105.0));
        store.record_observation(&obs("!b2", 150, 40.1, -105.1));
        store.record_observation(&obs("!a1", 3700, 40.2, -105.2));

        let buckets = store.growth_buckets(0, 10_000, 3600);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0], (0, 2, 2));
        assert_eq!(buckets[1], (3600, 1, 1));
    }
}
