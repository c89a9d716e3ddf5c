// Lock holder liveness

use lephase::ProcessProbe;
use psutil::process::Process;

/// Process probe backed by `psutil`.
///
/// A pid that cannot be inspected counts as gone, so a lock left behind by a
/// crashed run is reported as stale.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsutilProbe;

impl ProcessProbe for PsutilProbe {
    fn is_alive(&self, pid: u32) -> bool {
        Process::new(pid)
            .map(|process| process.is_running())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(PsutilProbe.is_alive(std::process::id()));
    }

    #[test]
    fn test_unused_pid_is_not_alive() {
        // Above the default pid_max on Linux.
        assert!(!PsutilProbe.is_alive(4_194_304 + 17));
    }
}
