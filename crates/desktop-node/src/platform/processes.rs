use dl_client::RunningApp;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// `sysinfo` process table, refreshed on every query.
pub struct ProcessTable {
    system: Mutex<System>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Every visible process, ordered by pid.  Dedup and capping happen in
    /// the sampler.
    pub fn list(&self) -> Vec<RunningApp> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All);
        let mut apps: Vec<RunningApp> = system
            .processes()
            .iter()
            .map(|(pid, process)| RunningApp {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect();
        apps.sort_by_key(|app| app.pid);
        apps
    }

    pub fn name_of(&self, pid: u32) -> Option<String> {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system
            .process(pid)
            .map(|p| p.name().to_string_lossy().into_owned())
    }
}
