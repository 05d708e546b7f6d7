//! Synthetic mesh node models.
//!
//! Each simulated node random-walks around a center point, drains its
//! battery, and emits the same JSON frames real Meshtastic firmware
//! publishes: periodic positions and telemetry, occasional nodeinfo and
//! neighborinfo.

use mesh_wire::format_node_id;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

const HARDWARE_MODELS: [&str; 5] = ["TBEAM", "HELTEC_V3", "RAK4631", "T_ECHO", "STATION_G2"];
const ROLES: [&str; 3] = ["CLIENT", "ROUTER", "REPEATER"];

pub struct SimNode {
    pub num: u64,
    pub node_id: String,
    name: String,
    short_name: String,
    hardware: &'static str,
    role: &'static str,
    lat: f64,
    lon: f64,
    altitude: f64,
    battery: f64,
    rng: StdRng,
    frame_counter: u64,
}

impl SimNode {
    pub fn new(index: u64, center_lat: f64, center_lon: f64, spread: f64) -> Self {
        let num = 0x1000_0000 + index;
        let mut rng = StdRng::seed_from_u64(num);
        let lat = center_lat + rng.gen_range(-spread..spread);
        let lon = center_lon + rng.gen_range(-spread..spread);
        Self {
            num,
            node_id: format_node_id(num),
            name: format!("Sim Node {index:02}"),
            short_name: format!("S{index:02}"),
            hardware: HARDWARE_MODELS[(index as usize) % HARDWARE_MODELS.len()],
            role: ROLES[(index as usize) % ROLES.len()],
            lat,
            lon,
            altitude: 1500.0 + rng.gen_range(0.0..800.0),
            battery: rng.gen_range(60.0..100.0),
            rng,
            frame_counter: 0,
        }
    }

    fn envelope(&self, msg_type: &str, payload: Value) -> Value {
        json!({
            "type": msg_type,
            "sender": self.node_id,
            "from": self.num,
            "payload": payload,
        })
    }

    /// Advance the simulation one tick and produce the frames to publish.
    pub fn tick(&mut self, neighbors: &[u64]) -> Vec<Value> {
        self.frame_counter += 1;
        // Slow random walk (roughly tens of meters per tick)
        self.lat += self.rng.gen_range(-0.0005..0.0005);
        self.lon += self.rng.gen_range(-0.0005..0.0005);
        self.battery = (self.battery - self.rng.gen_range(0.0..0.05)).max(2.0);

        let mut frames = vec![self.envelope(
            "position",
            json!({
                "latitude_i": (self.lat * 1e7) as i64,
                "longitude_i": (self.lon * 1e7) as i64,
                "altitude": self.altitude as i64,
            }),
        )];

        let channel_utilization = self.rng.gen_range(2.0..40.0);
        let air_util_tx = self.rng.gen_range(0.5..10.0);
        let temperature = self.rng.gen_range(-5.0..35.0);
        frames.push(self.envelope(
            "telemetry",
            json!({
                "battery_level": self.battery.round(),
                "voltage": 3.0 + self.battery / 100.0,
                "channel_utilization": channel_utilization,
                "air_util_tx": air_util_tx,
                "temperature": temperature,
            }),
        ));

        // Identity broadcast every 10th tick, like real firmware
        if self.frame_counter % 10 == 1 {
            frames.push(self.envelope(
                "nodeinfo",
                json!({
                    "longname": self.name,
                    "shortname": self.short_name,
                    "hardware": self.hardware,
                    "role": self.role,
                }),
            ));
        }

        // Neighbor report every 5th tick
        if self.frame_counter % 5 == 0 && !neighbors.is_empty() {
            let reports: Vec<Value> = neighbors
                .iter()
                .filter(|&&n| n != self.num)
                .map(|&n| {
                    json!({
                        "node_id": n,
                        "snr": (self.rng.gen_range(-12.0..12.0) * 4.0f64).round() / 4.0,
                    })
                })
                .collect();
            frames.push(self.envelope("neighborinfo", json!({ "neighbors": reports })));
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::MqttEnvelope;

    #[test]
    fn frames_decode_through_mesh_wire() {
        let mut node = SimNode::new(1, 40.0, -105.0, 0.1);
        let frames = node.tick(&[0x1000_0002]);
        assert!(frames.len() >= 2);

        for frame in frames {
            let envelope: MqttEnvelope = serde_json::from_value(frame).unwrap();
            assert_eq!(envelope.node_id().as_deref(), Some(node.node_id.as_str()));
            if envelope.msg_type == "position" {
                let position = envelope.position().unwrap();
                assert!(position.coordinates().is_some());
            }
        }
    }

    #[test]
    fn battery_drains_monotonically() {
        let mut node = SimNode::new(2, 40.0, -105.0, 0.1);
        let mut last = f64::MAX;
        for _ in 0..50 {
            node.tick(&[]);
            let battery = {
                let frames = node.tick(&[]);
                frames
                    .iter()
                    .find(|f| f["type"] == "telemetry")
                    .and_then(|f| f["payload"]["battery_level"].as_f64())
                    .unwrap()
            };
            assert!(battery <= last);
            last = battery;
        }
    }
}
