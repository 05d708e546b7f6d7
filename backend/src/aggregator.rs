//! Data aggregator.
//!
//! Owns the collector runners, the event bus, the circuit-breaker registry,
//! and the perf monitor. `collect_all` runs the enabled collectors in a
//! fixed dependency order, merges their FeatureCollections with
//! cross-source dedup by feature id, and caches overlay data (space
//! weather, solar terminator, HamClock) so `/api/overlay` never triggers a
//! full re-collect. A failing collector contributes zero nodes for the
//! cycle; it can never break a sibling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::now_secs;
use crate::collectors::aredn::ArednCollector;
use crate::collectors::hamclock::HamClockCollector;
use crate::collectors::meshtastic::{MeshtasticCollector, SourceMode};
use crate::collectors::noaa_alerts::NoaaAlertCollector;
use crate::collectors::reticulum::ReticulumCollector;
use crate::collectors::{RetryPolicy, SourceRunner};
use crate::config::{data_dir, MapsConfig};
use crate::connection_gate::GateRegistry;
use crate::event_bus::{Event, EventBus};
use crate::geojson::{Feature, FeatureCollection};
use crate::mqtt::{MqttSettings, MqttSubscriber};
use crate::node_store::{MqttNodeStore, TopologyLink};
use crate::perf_monitor::PerfMonitor;

const OVERLAY_KEYS: [&str; 3] = ["space_weather", "solar_terminator", "hamclock"];

pub struct DataAggregator {
    // fixed dependency order
    runners: Vec<Arc<SourceRunner>>,
    bus: Arc<EventBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    perf: Arc<PerfMonitor>,
    mqtt: Option<Arc<MqttSubscriber>>,
    mqtt_store: Option<Arc<MqttNodeStore>>,
    aredn: Option<Arc<ArednCollector>>,
    cached_overlay: Mutex<Map<String, Value>>,
    last_collect_time: Mutex<f64>,
    last_counts: Mutex<Map<String, Value>>,
}

impl DataAggregator {
    pub fn new(config: &MapsConfig, bus: Arc<EventBus>, gates: &GateRegistry) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let cache_ttl = config.cache_ttl_seconds();
        let retry = RetryPolicy::default();
        let data = data_dir();

        let mut runners: Vec<Arc<SourceRunner>> = Vec::new();
        let mut mqtt = None;
        let mut mqtt_store = None;
        let mut aredn_collector = None;

        if config.enable_meshtastic {
            let store = Arc::new(MqttNodeStore::default());
            let subscriber = Arc::new(MqttSubscriber::new(
                MqttSettings {
                    broker: config.mqtt_broker.clone(),
                    port: config.mqtt_port,
                    topic: config.mqtt_topic.clone(),
                    username: config.mqtt_username.clone(),
                    password: config.mqtt_password.clone(),
                },
                Arc::clone(&store),
                Arc::clone(&bus),
            ));
            let collector = MeshtasticCollector::new(
                "localhost",
                4403,
                gates.gate("localhost", 4403),
                Some(Arc::clone(&store)),
                data.join("mqtt_nodes.json"),
                SourceMode::from_str(&config.meshtastic_source_mode),
            );
            runners.push(Arc::new(SourceRunner::new(
                Box::new(collector),
                breakers.get("meshtastic"),
                cache_ttl,
                retry.clone(),
            )));
            mqtt = Some(subscriber);
            mqtt_store = Some(store);
        }

        if config.enable_reticulum {
            let collector = ReticulumCollector::new(
                "localhost",
                8000,
                None,
                vec![data.join("rns_nodes.json"), data.join("node_cache.json")],
            );
            runners.push(Arc::new(SourceRunner::new(
                Box::new(collector),
                breakers.get("reticulum"),
                cache_ttl,
                retry.clone(),
            )));
        }

        if config.enable_hamclock {
            let collector = HamClockCollector::new(
                &config.hamclock_host,
                config.hamclock_port,
                config.openhamclock_port,
            );
            runners.push(Arc::new(SourceRunner::new(
                Box::new(collector),
                breakers.get("hamclock"),
                cache_ttl,
                retry.clone(),
            )));
        }

        if config.enable_aredn {
            let collector = Arc::new(ArednCollector::new(
                config.aredn_nodes.clone(),
                vec![data.join("aredn_nodes.json"), data.join("node_cache.json")],
            ));
            runners.push(Arc::new(SourceRunner::new(
                Box::new(Arc::clone(&collector)),
                breakers.get("aredn"),
                cache_ttl,
                retry.clone(),
            )));
            aredn_collector = Some(collector);
        }

        if config.enable_noaa_alerts {
            let collector = NoaaAlertCollector::new(
                config.noaa_alerts_area.clone(),
                config.noaa_severity_list(),
            );
            // Alerts move faster than node data
            runners.push(Arc::new(SourceRunner::new(
                Box::new(collector),
                breakers.get("noaa_alerts"),
                cache_ttl.min(300.0),
                retry,
            )));
        }

        Self {
            runners,
            bus,
            breakers,
            perf: Arc::new(PerfMonitor::new()),
            mqtt,
            mqtt_store,
            aredn: aredn_collector,
            cached_overlay: Mutex::new(Map::new()),
            last_collect_time: Mutex::new(0.0),
            last_counts: Mutex::new(Map::new()),
        }
    }

    /// Start background machinery (the live MQTT subscription).
    pub fn start(&self) {
        if let Some(mqtt) = &self.mqtt {
            mqtt.start();
        }
    }

    pub async fn shutdown(&self) {
        if let Some(mqtt) = &self.mqtt {
            mqtt.stop().await;
        }
        self.cached_overlay.lock().unwrap().clear();
        info!("data aggregator shut down");
    }

    /// Collect from every enabled source and merge into one
    /// FeatureCollection. Features without an id are dropped; the first
    /// source to report an id wins.
    pub async fn collect_all(&self) -> FeatureCollection {
        let cycle_start = Instant::now();
        let mut all_features: Vec<Feature> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut counts = Map::new();
        let mut overlay = Map::new();

        for runner in &self.runners {
            let name = runner.source_name();
            let start = Instant::now();
            let outcome = runner.collect_with_meta().await;
            self.perf.record_collection(
                name,
                start.elapsed().as_secs_f64() * 1000.0,
                outcome.collection.features.len(),
                outcome.from_cache,
            );
            counts.insert(name.to_string(), json!(outcome.collection.features.len()));

            for key in OVERLAY_KEYS {
                if let Some(v) = outcome.collection.properties.get(key) {
                    overlay.insert(key.to_string(), v.clone());
                }
            }
            for feature in outcome.collection.features {
                if let Some(id) = feature.id() {
                    if seen.insert(id.to_string()) {
                        all_features.push(feature);
                    }
                }
            }
        }

        self.perf
            .record_cycle(cycle_start.elapsed().as_secs_f64() * 1000.0, all_features.len());
        *self.cached_overlay.lock().unwrap() = overlay.clone();
        *self.last_collect_time.lock().unwrap() = now_secs();
        *self.last_counts.lock().unwrap() = counts.clone();

        let total = all_features.len();
        let mut result = FeatureCollection::new(all_features, "aggregated");
        result.properties.insert("sources".into(), Value::Object(counts.clone()));
        result.properties.insert("total_nodes".into(), json!(total));
        result.properties.insert(
            "enabled_sources".into(),
            json!(self.runners.iter().map(|r| r.source_name()).collect::<Vec<_>>()),
        );
        result.properties.insert("overlay_data".into(), Value::Object(overlay));

        let counts_value = Value::Object(counts.clone());
        info!(
            "aggregated {total} nodes from {} sources: {}",
            self.runners.len(),
            counts_value
        );
        self.bus.publish(&Event::data_refreshed("aggregator", counts));
        result
    }

    /// Collect from a single named source.
    pub async fn collect_source(&self, source_name: &str) -> Option<FeatureCollection> {
        for runner in &self.runners {
            if runner.source_name() == source_name {
                return Some(runner.collect().await);
            }
        }
        None
    }

    /// Topology links from the MQTT store plus AREDN LQM.
    pub fn get_topology_links(&self) -> Vec<TopologyLink> {
        let mut links = Vec::new();
        if let Some(store) = &self.mqtt_store {
            links.extend(store.get_topology_links());
        }
        if let Some(aredn) = &self.aredn {
            links.extend(aredn.get_topology_links());
        }
        links
    }

    /// Topology as GeoJSON: MQTT links union AREDN LQM links, both colored
    /// through the same SNR classifier.
    pub fn get_topology_geojson(&self) -> FeatureCollection {
        let mut fc = match &self.mqtt_store {
            Some(store) => store.get_topology_geojson(),
            None => FeatureCollection::empty("topology"),
        };
        if let Some(aredn) = &self.aredn {
            for link in aredn.get_topology_links() {
                if let Some(feature) = link.to_feature() {
                    fc.features.push(feature);
                }
            }
        }
        let count = fc.features.len();
        fc.properties.insert("link_count".into(), json!(count));
        fc
    }

    /// Overlay data from the last collection cycle. When none exists yet,
    /// performs an overlay-only fetch from the HamClock collector instead
    /// of a full aggregation.
    pub async fn get_cached_overlay(&self) -> Map<String, Value> {
        {
            let cached = self.cached_overlay.lock().unwrap();
            if !cached.is_empty() {
                return cached.clone();
            }
        }
        let Some(fc) = self.collect_source("hamclock").await else {
            return Map::new();
        };
        let mut overlay = Map::new();
        for key in OVERLAY_KEYS {
            if let Some(v) = fc.properties.get(key) {
                overlay.insert(key.to_string(), v.clone());
            }
        }
        *self.cached_overlay.lock().unwrap() = overlay.clone();
        overlay
    }

    pub async fn clear_all_caches(&self) {
        for runner in &self.runners {
            runner.clear_cache().await;
        }
        self.cached_overlay.lock().unwrap().clear();
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    pub fn last_collect_age_seconds(&self) -> Option<f64> {
        let t = *self.last_collect_time.lock().unwrap();
        if t == 0.0 {
            None
        } else {
            Some(now_secs() - t)
        }
    }

    pub fn last_collect_counts(&self) -> Map<String, Value> {
        self.last_counts.lock().unwrap().clone()
    }

    pub fn enabled_sources(&self) -> Vec<&'static str> {
        self.runners.iter().map(|r| r.source_name()).collect()
    }

    pub fn get_source_health(&self) -> Map<String, Value> {
        self.runners
            .iter()
            .map(|r| (r.source_name().to_string(), Value::Object(r.health_info())))
            .collect()
    }

    pub fn get_circuit_breaker_states(&self) -> Map<String, Value> {
        self.breakers.get_all_states()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    pub fn perf(&self) -> Arc<PerfMonitor> {
        Arc::clone(&self.perf)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn mqtt_store(&self) -> Option<Arc<MqttNodeStore>> {
        self.mqtt_store.as_ref().map(Arc::clone)
    }

    pub fn mqtt_status(&self) -> &'static str {
        match &self.mqtt {
            Some(mqtt) => mqtt.status(),
            None => "disabled",
        }
    }

    pub fn mqtt_node_count(&self) -> usize {
        self.mqtt_store.as_ref().map_or(0, |s| s.node_count())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(runners: Vec<Arc<SourceRunner>>, bus: Arc<EventBus>) -> Self {
        Self {
            runners,
            bus,
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            perf: Arc::new(PerfMonitor::new()),
            mqtt: None,
            mqtt_store: None,
            aredn: None,
            cached_overlay: Mutex::new(Map::new()),
            last_collect_time: Mutex::new(0.0),
            last_counts: Mutex::new(Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::collectors::{Collector, FetchError};
    use crate::event_bus::EventType;
    use crate::geojson::node_feature;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        ids: Vec<Option<&'static str>>,
    }

    #[async_trait]
    impl Collector for Fixed {
        fn source_name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
            let features = self
                .ids
                .iter()
                .map(|id| {
                    let mut props = Map::new();
                    if let Some(id) = id {
                        props.insert("id".into(), json!(id));
                    }
                    props.insert("network".into(), json!(self.name));
                    Feature::point(40.0, -105.0, props)
                })
                .collect();
            let mut fc = FeatureCollection::new(features, self.name);
            if self.name == "hamclock" {
                fc.properties.insert("space_weather".into(), json!({"kp_index": 3}));
            }
            Ok(fc)
        }
    }

    fn runner(name: &'static str, ids: Vec<Option<&'static str>>) -> Arc<SourceRunner> {
        Arc::new(SourceRunner::new(
            Box::new(Fixed { name, ids }),
            Arc::new(CircuitBreaker::new(name, 5, 60.0)),
            900.0,
            RetryPolicy::default(),
        ))
    }

    #[tokio::test]
    async fn dedup_first_source_wins_and_idless_dropped() {
        let bus = Arc::new(EventBus::new());
        let aggregator = DataAggregator::for_tests(
            vec![
                runner("alpha", vec![Some("N"), None]),
                runner("beta", vec![Some("N"), Some("M")]),
            ],
            Arc::clone(&bus),
        );

        let fc = aggregator.collect_all().await;
        let ids: Vec<&str> = fc.features.iter().filter_map(Feature::id).collect();
        assert_eq!(ids, vec!["N", "M"]);
        // First source won: the surviving N carries alpha's network tag
        let n = fc.features.iter().find(|f| f.id() == Some("N")).unwrap();
        assert_eq!(n.properties["network"], json!("alpha"));
        assert_eq!(fc.properties["sources"]["alpha"], json!(2));
        assert_eq!(fc.properties["sources"]["beta"], json!(2));
        assert_eq!(fc.properties["total_nodes"], json!(2));
    }

    #[tokio::test]
    async fn overlay_cached_from_collect_all() {
        let bus = Arc::new(EventBus::new());
        let aggregator = DataAggregator::for_tests(
            vec![runner("hamclock", vec![])],
            Arc::clone(&bus),
        );
        assert!(aggregator.last_collect_age_seconds().is_none());

        aggregator.collect_all().await;
        let overlay = aggregator.get_cached_overlay().await;
        assert_eq!(overlay["space_weather"]["kp_index"], json!(3));
        assert!(aggregator.last_collect_age_seconds().unwrap() < 5.0);
    }

    #[tokio::test]
    async fn overlay_only_fetch_when_no_cache() {
        let bus = Arc::new(EventBus::new());
        let aggregator = DataAggregator::for_tests(
            vec![runner("hamclock", vec![])],
            Arc::clone(&bus),
        );
        // No collect_all yet: falls back to a hamclock-only fetch
        let overlay = aggregator.get_cached_overlay().await;
        assert_eq!(overlay["space_weather"]["kp_index"], json!(3));
    }

    #[tokio::test]
    async fn data_refreshed_event_published() {
        let bus = Arc::new(EventBus::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        bus.subscribe(Some(EventType::DataRefreshed), move |ev| {
            assert_eq!(ev.data["alpha"], json!(1));
            f.fetch_add(1, Ordering::SeqCst);
        });
        let aggregator =
            DataAggregator::for_tests(vec![runner("alpha", vec![Some("A")])], Arc::clone(&bus));
        aggregator.collect_all().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
