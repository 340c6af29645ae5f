use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Emergency off switch for the whole subsystem.
///
/// Engaged when either the startup flag or the runtime override is set. The
/// runtime half can be cleared; the startup half holds for the life of the
/// process.
#[derive(Debug)]
pub struct KillSwitch {
    startup: bool,
    runtime: AtomicBool,
}

impl KillSwitch {
    pub fn new(startup: bool) -> Self {
        Self {
            startup,
            runtime: AtomicBool::new(false),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.startup || self.runtime.load(Ordering::Acquire)
    }

    /// Force the subsystem off regardless of configuration.
    pub fn engage(&self) {
        warn!("kill switch engaged at runtime, all synchronization halted");
        self.runtime.store(true, Ordering::Release);
    }

    /// Clear the runtime override. A startup flag stays in force.
    pub fn disengage(&self) {
        self.runtime.store(false, Ordering::Release);
        if self.startup {
            warn!("runtime kill switch cleared, startup flag still disables synchronization");
        } else {
            warn!("kill switch disengaged at runtime");
        }
    }

    pub fn runtime_engaged(&self) -> bool {
        self.runtime.load(Ordering::Acquire)
    }

    pub fn startup_flag(&self) -> bool {
        self.startup
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_flag() {
        assert!(KillSwitch::new(true).is_engaged());
        assert!(!KillSwitch::new(false).is_engaged());
    }

    #[test]
    fn test_runtime_override_toggles() {
        let ks = KillSwitch::new(false);
        ks.engage();
        assert!(ks.is_engaged());
        assert!(ks.runtime_engaged());
        ks.disengage();
        assert!(!ks.is_engaged());
    }

    #[test]
    fn test_disengage_cannot_lift_startup_flag() {
        let ks = KillSwitch::new(true);
        ks.disengage();
        assert!(ks.is_engaged());
        ks.engage();
        ks.disengage();
        assert!(ks.is_engaged());
        assert!(!ks.runtime_engaged());
    }
}
