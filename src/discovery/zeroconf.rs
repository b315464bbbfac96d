// mDNS/zeroconf discovery (spec §4.4c): register an `_o2._udp` service
// record for this process and browse for others, for networks where
// broadcast is filtered but multicast DNS is not. Wraps the `zeroconf`
// crate rather than reimplementing mDNS — this pack's other example repos
// reach for a dedicated crate for protocol layers this involved rather
// than hand-rolling one, and the spec itself treats zeroconf as "a library
// the core consumes."

use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};

use zeroconf::prelude::*;
use zeroconf::{MdnsBrowser, MdnsService, ServiceDiscovery, ServiceType};

use crate::error::{O2Error, O2Result};
use crate::global::ProcessName;
use super::{DiscoveredPeer, Discoverer};

const SERVICE_TYPE: &str = "_o2._udp";

pub struct ZeroconfDiscoverer {
    ensemble: String,
    _service: MdnsService,
    results: Receiver<ServiceDiscovery>,
}

impl ZeroconfDiscoverer {
    pub fn new(ensemble: impl Into<String>, self_name: &ProcessName, tcp_port: u16) -> O2Result<ZeroconfDiscoverer> {
        let ensemble = ensemble.into();
        let service_type = ServiceType::new(SERVICE_TYPE, "tcp").map_err(|e| O2Error::generic(e.to_string()))?;

        let mut service = MdnsService::new(service_type, tcp_port);
        service.set_name(self_name.as_str());
        service.set_txt_record(
            [("ensemble".to_string(), ensemble.clone())].into_iter().collect::<zeroconf::TxtRecord>(),
        );

        let registered: Arc<Mutex<Option<ServiceDiscovery>>> = Arc::new(Mutex::new(None));
        let registered_clone = registered.clone();
        service.set_registered_callback(Box::new(move |result, _ctx| {
            if let Ok(discovery) = result {
                *registered_clone.lock().unwrap() = Some(discovery);
            }
        }));
        let _event_loop = service.register().map_err(|e| O2Error::generic(e.to_string()))?;

        let (tx, rx) = channel();
        let mut browser = MdnsBrowser::new(ServiceType::new(SERVICE_TYPE, "tcp").unwrap());
        browser.set_service_discovered_callback(Box::new(move |result, _ctx| {
            if let Ok(discovery) = result {
                let _ = tx.send(discovery);
            }
        }));
        let _browse_loop = browser.browse_services().map_err(|e| O2Error::generic(e.to_string()))?;

        Ok(ZeroconfDiscoverer { ensemble, _service: service, results: rx })
    }
}

impl Discoverer for ZeroconfDiscoverer {
    fn poll(&mut self) -> O2Result<Vec<DiscoveredPeer>> {
        let mut found = Vec::new();
        loop {
            match self.results.try_recv() {
                Ok(discovery) => {
                    let belongs = discovery
                        .txt()
                        .as_ref()
                        .and_then(|txt| txt.get("ensemble"))
                        .map(|e| e == self.ensemble)
                        .unwrap_or(false);
                    if belongs {
                        if let Ok(process) = ProcessName::parse(discovery.name()) {
                            found.push(DiscoveredPeer { process, ensemble: self.ensemble.clone() });
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(found)
    }

    fn name(&self) -> &'static str {
        "zeroconf"
    }
}
