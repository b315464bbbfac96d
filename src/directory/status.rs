// Service status codes observable by the user (spec §4.3).
//
// Maps 1:1 onto the original C implementation's `O2_UNKNOWN` /
// `O2_LOCAL_NOTIME` / ... / `O2_TO_OSC` integer family (see
// `services.h`/`o2.cpp` in the upstream sources); kept as a Rust enum
// rather than bare integer constants.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Unknown,
    LocalNoTime,
    RemoteNoTime,
    BridgeNoTime,
    ToOscNoTime,
    Local,
    Remote,
    Bridge,
    ToOsc,
}

impl ServiceStatus {
    /// Drops the "-notime" qualifier once the owning process's clock is
    /// synchronized (spec §4.3: "'-notime' variants report that the
    /// providing process has not yet achieved clock sync").
    pub fn upgrade_to_synced(self) -> ServiceStatus {
        match self {
            ServiceStatus::LocalNoTime => ServiceStatus::Local,
            ServiceStatus::RemoteNoTime => ServiceStatus::Remote,
            ServiceStatus::BridgeNoTime => ServiceStatus::Bridge,
            ServiceStatus::ToOscNoTime => ServiceStatus::ToOsc,
            other => other,
        }
    }

    pub fn is_notime(self) -> bool {
        matches!(
            self,
            ServiceStatus::LocalNoTime
                | ServiceStatus::RemoteNoTime
                | ServiceStatus::BridgeNoTime
                | ServiceStatus::ToOscNoTime
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_drops_notime_suffix() {
        assert_eq!(ServiceStatus::RemoteNoTime.upgrade_to_synced(), ServiceStatus::Remote);
        assert_eq!(ServiceStatus::Local.upgrade_to_synced(), ServiceStatus::Local);
    }
}
