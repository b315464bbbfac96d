// MQTT discovery (spec §4.4d): for networks where even multicast DNS is
// blocked (many cloud VPCs), processes instead publish/subscribe presence
// on a shared broker topic. Wraps `rumqttc` rather than speaking MQTT
// directly, matching the "library the core consumes" framing the spec uses
// for this mechanism.

use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

use crate::error::{O2Error, O2Result};
use crate::global::ProcessName;
use super::{DiscoveredPeer, Discoverer};

fn topic(ensemble: &str) -> String {
    format!("o2/{}/presence", ensemble)
}

pub struct MqttDiscoverer {
    ensemble: String,
    self_name: ProcessName,
    client: Client,
    connection: rumqttc::Connection,
    announced: bool,
}

impl MqttDiscoverer {
    pub fn new(broker_host: &str, broker_port: u16, ensemble: impl Into<String>, self_name: ProcessName) -> O2Result<MqttDiscoverer> {
        let ensemble = ensemble.into();
        let client_id = format!("o2-{}", self_name);
        let mut opts = MqttOptions::new(client_id, broker_host, broker_port);
        opts.set_keep_alive(std::time::Duration::from_secs(30));

        let (client, connection) = Client::new(opts, 16);
        client
            .subscribe(topic(&ensemble), QoS::AtMostOnce)
            .map_err(|e| O2Error::generic(e.to_string()))?;

        Ok(MqttDiscoverer { ensemble, self_name, client, connection, announced: false })
    }

    fn announce(&mut self) -> O2Result<()> {
        self.client
            .publish(topic(&self.ensemble), QoS::AtMostOnce, false, self.self_name.as_str().as_bytes())
            .map_err(|e| O2Error::generic(e.to_string()))?;
        self.announced = true;
        Ok(())
    }
}

impl Discoverer for MqttDiscoverer {
    fn poll(&mut self) -> O2Result<Vec<DiscoveredPeer>> {
        if !self.announced {
            self.announce()?;
        }
        let mut found = Vec::new();
        while let Ok(notification) = self.connection.recv_timeout(std::time::Duration::from_millis(0)) {
            if let Ok(Event::Incoming(Packet::Publish(publish))) = notification {
                if let Ok(name_str) = std::str::from_utf8(&publish.payload) {
                    if let Ok(process) = ProcessName::parse(name_str) {
                        if process != self.self_name {
                            found.push(DiscoveredPeer { process, ensemble: self.ensemble.clone() });
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}
