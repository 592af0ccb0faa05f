use std::fmt;

/// The lifecycle status of a registered module
///
/// Statuses are totally ordered by maturity:
///
/// `Discovered < Installed < Disabled < Enabled < Stopped < Running`
///
/// A disabled module is installed but hidden; a stopped module is enabled but
/// has no running work.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    /// Registered but never installed.
    Discovered,

    /// Installed (or upgraded) but not enabled.
    Installed,

    /// Installed and explicitly disabled.
    Disabled,

    /// Enabled but not yet started.
    Enabled,

    /// Enabled, previously started, and since stopped.
    Stopped,

    /// Enabled and started.
    Running,
}

/// A lifecycle phase, used to attribute errors
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// [`Lifecycle::install`](super::Lifecycle::install)
    Install,
    /// [`Lifecycle::upgrade`](super::Lifecycle::upgrade)
    Upgrade,
    /// [`Lifecycle::enable`](super::Lifecycle::enable)
    Enable,
    /// [`Lifecycle::disable`](super::Lifecycle::disable)
    Disable,
    /// [`Lifecycle::uninstall`](super::Lifecycle::uninstall)
    Uninstall,
    /// [`Lifecycle::start`](super::Lifecycle::start)
    Start,
    /// Stopping a running module. There is no lifecycle hook; the module's
    /// cancellation token is cancelled.
    Stop,
    /// [`Lifecycle::start_cron`](super::Lifecycle::start_cron)
    StartCron,
}

// === impl Status ===

impl Status {
    /// Returns true if the module has been installed (and not uninstalled)
    #[inline]
    pub fn is_installed(self) -> bool {
        self >= Status::Installed
    }

    /// Returns true if the module's capabilities are enabled
    #[inline]
    pub fn is_enabled(self) -> bool {
        self >= Status::Enabled
    }

    /// Returns true if the module's routes should be mounted
    #[inline]
    pub(crate) fn serves_routes(self) -> bool {
        matches!(self, Status::Enabled | Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Discovered => "discovered",
            Status::Installed => "installed",
            Status::Disabled => "disabled",
            Status::Enabled => "enabled",
            Status::Stopped => "stopped",
            Status::Running => "running",
        })
    }
}

// === impl Phase ===

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Install => "install",
            Phase::Upgrade => "upgrade",
            Phase::Enable => "enable",
            Phase::Disable => "disable",
            Phase::Uninstall => "uninstall",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::StartCron => "start-cron",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn maturity_order() {
        let ordered = [
            Status::Discovered,
            Status::Installed,
            Status::Disabled,
            Status::Enabled,
            Status::Stopped,
            Status::Running,
        ];
        assert!(ordered.windows(2).all(|w| w[0] < w[1]));

        assert!(!Status::Discovered.is_installed());
        assert!(Status::Disabled.is_installed());
        assert!(!Status::Disabled.is_enabled());
        assert!(Status::Stopped.is_enabled());
        assert!(!Status::Stopped.serves_routes());
        assert!(Status::Running.serves_routes());
    }
}
