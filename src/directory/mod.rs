// Service directory (spec §4.3): the table every process keeps of every
// service it knows about, each with an ordered list of providers (remote
// processes offering it, tie-broken by process name) and a set of taps
// (services that receive a copy of every message sent to the service).
//
// Grounded in the teacher's session/subscriber registries (`HashMap` keyed
// by id, ordered `Vec` for tie-break) generalized to O2's provider-priority
// and tap semantics (`global.rs`, `socket_impl.rs` registry patterns).

pub mod properties;
pub mod status;

use std::collections::HashMap;

use crate::error::{O2Error, O2Result};
use crate::global::ProcessName;
use crate::proxy::ServiceProxy;
use status::ServiceStatus;

/// One provider of a service: either this process (`Local`) or a remote one
/// reachable only through its proxy.
pub struct Provider {
    pub process: Option<ProcessName>,
    pub proxy: Box<dyn ServiceProxy>,
    /// `;attr:value;` grammar, see [`properties`].
    pub properties: String,
}

impl Provider {
    pub fn property(&self, attr: &str) -> Option<String> {
        properties::get(&self.properties, attr)
    }

    pub fn set_property(&mut self, attr: &str, value: &str) {
        self.properties = properties::set(&self.properties, attr, value);
    }
}

pub struct Tap {
    pub tapper_service: String,
    pub tapper_process: Option<ProcessName>,
}

#[derive(Default)]
pub struct ServiceEntry {
    /// Ordered by `ProcessName`; spec §4.3 "the provider with the
    /// numerically highest process name by string comparison is active,
    /// others are shadow providers promoted on its departure."
    providers: Vec<Provider>,
    taps: Vec<Tap>,
}

impl ServiceEntry {
    pub fn active(&self) -> Option<&Provider> {
        self.providers.last()
    }

    pub fn active_mut(&mut self) -> Option<&mut Provider> {
        self.providers.last_mut()
    }

    pub fn status(&self) -> ServiceStatus {
        match self.active() {
            None => ServiceStatus::Unknown,
            Some(p) => match p.process {
                None => ServiceStatus::LocalNoTime,
                Some(_) => ServiceStatus::RemoteNoTime,
            },
        }
    }
}

pub struct ServiceDirectory {
    services: HashMap<String, ServiceEntry>,
    /// This process's own name, used to resolve a provider's `None` (local)
    /// slot to its real position in the lexicographic tie-break instead of
    /// always sorting it lowest (spec §4.3 "numerically highest process
    /// name by string comparison is active" — that comparison has to use
    /// this process's actual name for the local provider, same as every
    /// remote one).
    local_process: ProcessName,
}

impl ServiceDirectory {
    pub fn new(local_process: ProcessName) -> ServiceDirectory {
        ServiceDirectory { services: HashMap::new(), local_process }
    }

    fn provider_key<'a>(&'a self, process: &'a Option<ProcessName>) -> &'a ProcessName {
        process.as_ref().unwrap_or(&self.local_process)
    }

    /// Registers `proxy` as a provider of `name`; if a provider already
    /// exists for the same process name, it is replaced in place (spec
    /// §4.3 "Provider replace"), otherwise inserted and re-sorted so the
    /// active provider is always last.
    pub fn service_provider_new(
        &mut self,
        name: &str,
        process: Option<ProcessName>,
        proxy: Box<dyn ServiceProxy>,
        properties: impl Into<String>,
    ) -> O2Result<()> {
        let entry = self.services.entry(name.to_string()).or_default();
        let properties = properties.into();
        if let Some(existing) = entry.providers.iter_mut().find(|p| p.process == process) {
            existing.proxy = proxy;
            existing.properties = properties;
            return Ok(());
        }
        entry.providers.push(Provider { process, proxy, properties });
        entry.providers.sort_by(|a, b| self.provider_key(&a.process).cmp(self.provider_key(&b.process)));
        Ok(())
    }

    pub fn provider_replace(
        &mut self,
        name: &str,
        process: Option<&ProcessName>,
        proxy: Box<dyn ServiceProxy>,
    ) -> O2Result<()> {
        let entry = self.services.get_mut(name).ok_or_else(|| O2Error::NoService(name.to_string()))?;
        let slot = entry
            .providers
            .iter_mut()
            .find(|p| p.process.as_ref() == process)
            .ok_or_else(|| O2Error::NoService(name.to_string()))?;
        slot.proxy = proxy;
        Ok(())
    }

    /// Removes the provider belonging to `process` (or the sole local
    /// provider if `process` is `None`); the service entry itself is
    /// dropped once its last provider is gone.
    pub fn service_remove(&mut self, name: &str, process: Option<&ProcessName>) -> O2Result<()> {
        let entry = self.services.get_mut(name).ok_or_else(|| O2Error::NoService(name.to_string()))?;
        entry.providers.retain(|p| p.process.as_ref() != process);
        if entry.providers.is_empty() {
            self.services.remove(name);
        }
        Ok(())
    }

    pub fn tap_new(&mut self, service: &str, tapper_service: impl Into<String>, tapper_process: Option<ProcessName>) {
        let entry = self.services.entry(service.to_string()).or_default();
        entry.taps.push(Tap { tapper_service: tapper_service.into(), tapper_process });
    }

    pub fn tap_remove(&mut self, service: &str, tapper_service: &str) {
        if let Some(entry) = self.services.get_mut(service) {
            entry.taps.retain(|t| t.tapper_service != tapper_service);
        }
    }

    /// Drops every provider/tap owned by `process` across the whole
    /// directory (spec §4.3 "Process departure"), returning the names of
    /// services that lost their last provider so the caller can broadcast
    /// removal notices.
    pub fn remove_services_by(&mut self, process: &ProcessName) -> Vec<String> {
        let mut emptied = Vec::new();
        self.services.retain(|name, entry| {
            entry.providers.retain(|p| p.process.as_ref() != Some(process));
            if entry.providers.is_empty() {
                emptied.push(name.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    pub fn remove_taps_by(&mut self, process: &ProcessName) {
        for entry in self.services.values_mut() {
            entry.taps.retain(|t| t.tapper_process.as_ref() != Some(process));
        }
    }

    pub fn service_find(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn service_find_mut(&mut self, name: &str) -> Option<&mut ServiceEntry> {
        self.services.get_mut(name)
    }

    pub fn taps_for(&self, name: &str) -> &[Tap] {
        self.services.get(name).map(|e| e.taps.as_slice()).unwrap_or(&[])
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::LocalHandlerTree;

    fn test_process() -> ProcessName {
        ProcessName::parse("@0a0000ff:c0a80102:1f90").unwrap()
    }

    #[test]
    fn higher_process_name_becomes_active_provider() {
        let mut dir = ServiceDirectory::new(test_process());
        let low = ProcessName::parse("@0a000001:c0a80102:1f90").unwrap();
        let high = ProcessName::parse("@0a000002:c0a80102:1f90").unwrap();
        dir.service_provider_new("echo", Some(low.clone()), Box::new(LocalHandlerTree), "").unwrap();
        dir.service_provider_new("echo", Some(high.clone()), Box::new(LocalHandlerTree), "").unwrap();
        let entry = dir.service_find("echo").unwrap();
        assert_eq!(entry.active().unwrap().process, Some(high));
    }

    #[test]
    fn removing_last_provider_drops_the_service() {
        let mut dir = ServiceDirectory::new(test_process());
        dir.service_provider_new("echo", None, Box::new(LocalHandlerTree), "").unwrap();
        dir.service_remove("echo", None).unwrap();
        assert!(dir.service_find("echo").is_none());
    }

    #[test]
    fn local_provider_is_compared_by_its_real_process_name() {
        // local_process's real name ("...ff:...") is numerically highest, so
        // the local (`None`) provider should win the tie-break, not lose it
        // by virtue of `None` always sorting lowest under the derived `Ord`.
        let mut dir = ServiceDirectory::new(test_process());
        let low = ProcessName::parse("@0a000001:c0a80102:1f90").unwrap();
        dir.service_provider_new("echo", Some(low), Box::new(LocalHandlerTree), "").unwrap();
        dir.service_provider_new("echo", None, Box::new(LocalHandlerTree), "").unwrap();
        let entry = dir.service_find("echo").unwrap();
        assert_eq!(entry.active().unwrap().process, None);
    }

    #[test]
    fn process_departure_clears_its_providers_and_reports_emptied_services() {
        let mut dir = ServiceDirectory::new(test_process());
        let proc = ProcessName::parse("@0a000001:c0a80102:1f90").unwrap();
        dir.service_provider_new("echo", Some(proc.clone()), Box::new(LocalHandlerTree), "").unwrap();
        let emptied = dir.remove_services_by(&proc);
        assert_eq!(emptied, vec!["echo".to_string()]);
    }
}
