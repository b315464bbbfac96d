// MQTT relay proxy (spec §4.4d / §4.7): stands in for a remote process
// reached only through an MQTT broker — used when both processes are
// behind NATs or on networks where a direct TCP/UDP path can't be
// established (`mqtt.c`/`mqtt.cpp`'s relay path, as opposed to
// `discovery::mqtt`'s presence-only announcements). The message itself is
// published as the UDP wire encoding on a per-process topic; there is no
// framing overhead to negotiate since MQTT already delivers whole payloads.

use std::fmt;

use rumqttc::{Client, QoS};

use crate::error::{O2Error, O2Result};
use crate::global::ProcessName;
use crate::message::Message;

use super::{ProxyKind, ProxyStatus, ServiceProxy};

fn relay_topic(ensemble: &str, process: &ProcessName) -> String {
    format!("o2/{}/relay/{}", ensemble, process)
}

pub struct MqttProxy {
    ensemble: String,
    process: ProcessName,
    client: Client,
    synchronized: bool,
}

impl MqttProxy {
    pub fn new(client: Client, ensemble: impl Into<String>, process: ProcessName) -> MqttProxy {
        MqttProxy { ensemble: ensemble.into(), process, client, synchronized: false }
    }

    pub fn mark_synchronized(&mut self) {
        self.synchronized = true;
    }
}

impl fmt::Debug for MqttProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MqttProxy").field("process", &self.process).finish()
    }
}

impl ServiceProxy for MqttProxy {
    fn send(&mut self, msg: &Message) -> O2Result<bool> {
        let topic = relay_topic(&self.ensemble, &self.process);
        self.client
            .publish(topic, QoS::AtMostOnce, false, msg.to_udp_bytes())
            .map_err(|e| O2Error::generic(e.to_string()))?;
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
        self.synchronized
    }

    fn owner_process(&self) -> Option<&ProcessName> {
        Some(&self.process)
    }

    fn status(&self) -> ProxyStatus {
        if self.synchronized {
            ProxyStatus::Synchronized
        } else {
            ProxyStatus::Connected
        }
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Mqtt
    }
}
