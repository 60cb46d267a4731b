/// Cgroup-backed isolation containers with lifecycle monitoring
///
/// Containers live under the cgroup-v1 `memory` and `pids` hierarchies.
/// When cgroups are unavailable or unwritable the container degrades (in
/// non-strict mode) to liveness polling of the processes registered with it,
/// so the broker's accounting keeps working on unprivileged hosts.
use crate::container::{Container, ContainerEvent, EventSender};
use crate::types::{ContainerId, ContainerLimits, Result, ResultCode, TrackerKey};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CGROUP_BASE: &str = "/sys/fs/cgroup";
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CgroupContainer {
    id: ContainerId,
    name: String,
    memory_path: PathBuf,
    pids_path: PathBuf,
    has_cgroup_support: bool,
    strict_mode: bool,
    /// Seed pids for the fallback liveness polling.
    members: Arc<Mutex<HashSet<u32>>>,
    closed: Arc<AtomicBool>,
    monitor: Option<thread::JoinHandle<()>>,
}

impl CgroupContainer {
    pub fn new(limits: ContainerLimits, strict_mode: bool) -> Result<Self> {
        Self::with_support(limits, strict_mode, cgroups_available())
    }

    fn with_support(limits: ContainerLimits, strict_mode: bool, want_support: bool) -> Result<Self> {
        let id = ContainerId::next();
        let name = format!("sandbroker-{}", uuid::Uuid::new_v4());
        let memory_path = Path::new(CGROUP_BASE).join("memory").join(&name);
        let pids_path = Path::new(CGROUP_BASE).join("pids").join(&name);

        let mut container = Self {
            id,
            name,
            memory_path,
            pids_path,
            has_cgroup_support: false,
            strict_mode,
            members: Arc::new(Mutex::new(HashSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
            monitor: None,
        };

        if !want_support {
            if strict_mode {
                return Err(ResultCode::ContainerCreation(
                    "cgroups not available on this system".to_string(),
                ));
            }
            log::warn!(
                "cgroups not available, {} will not enforce resource limits",
                container.id
            );
            return Ok(container);
        }

        let controllers = match available_controllers() {
            Ok(controllers) => controllers,
            Err(e) => {
                if strict_mode {
                    return Err(ResultCode::ContainerCreation(format!(
                        "failed to probe cgroup controllers: {}",
                        e
                    )));
                }
                log::warn!("failed to probe cgroup controllers: {}", e);
                return Ok(container);
            }
        };

        for controller in ["memory", "pids"] {
            if !controllers.contains(controller) {
                if strict_mode {
                    return Err(ResultCode::ContainerCreation(format!(
                        "required cgroup controller '{}' not available",
                        controller
                    )));
                }
                log::warn!(
                    "cgroup controller '{}' not available, {} will not enforce resource limits",
                    controller,
                    container.id
                );
                return Ok(container);
            }
        }

        let dirs = [container.memory_path.clone(), container.pids_path.clone()];
        for dir in &dirs {
            if let Err(e) = fs::create_dir_all(dir) {
                if strict_mode {
                    return Err(ResultCode::ContainerCreation(format!(
                        "cannot create {}: {}",
                        dir.display(),
                        e
                    )));
                }
                log::warn!(
                    "cannot create {} ({}), {} will not enforce resource limits",
                    dir.display(),
                    e,
                    container.id
                );
                return Ok(container);
            }
        }

        container.has_cgroup_support = true;
        container.apply_limits(&limits)?;
        Ok(container)
    }

    fn apply_limits(&self, limits: &ContainerLimits) -> Result<()> {
        if let Some(memory) = limits.memory_limit {
            self.write_limit(
                &self.memory_path.join("memory.limit_in_bytes"),
                &memory.to_string(),
            )?;
            // memsw covers swap as well where the kernel exposes it.
            let memsw = self.memory_path.join("memory.memsw.limit_in_bytes");
            if memsw.exists() {
                let _ = fs::write(memsw, memory.to_string());
            }
        }
        if let Some(processes) = limits.process_limit {
            self.write_limit(&self.pids_path.join("pids.max"), &processes.to_string())?;
        }
        Ok(())
    }

    fn write_limit(&self, file: &Path, value: &str) -> Result<()> {
        if let Err(e) = fs::write(file, value) {
            if self.strict_mode {
                return Err(ResultCode::ContainerCreation(format!(
                    "failed to write {}: {}",
                    file.display(),
                    e
                )));
            }
            log::warn!("failed to write {}: {}", file.display(), e);
        }
        Ok(())
    }

    fn current_members(&self) -> HashSet<u32> {
        member_snapshot(
            self.has_cgroup_support,
            &self.memory_path.join("cgroup.procs"),
            &self.members,
        )
    }
}

impl Container for CgroupContainer {
    fn id(&self) -> ContainerId {
        self.id
    }

    fn add_process(&mut self, pid: u32) -> Result<()> {
        self.members.lock().unwrap().insert(pid);
        if !self.has_cgroup_support {
            return Ok(());
        }
        for tasks in [self.memory_path.join("tasks"), self.pids_path.join("tasks")] {
            if let Err(e) = fs::write(&tasks, pid.to_string()) {
                if self.strict_mode {
                    return Err(ResultCode::Generic(e));
                }
                log::warn!("failed to add pid {} to {}: {}", pid, tasks.display(), e);
            }
        }
        Ok(())
    }

    fn associate(&mut self, events: EventSender, key: TrackerKey) -> Result<()> {
        let monitor = Monitor {
            procs_file: self.memory_path.join("cgroup.procs"),
            failcnt_file: self.memory_path.join("memory.failcnt"),
            pids_events_file: self.pids_path.join("pids.events"),
            has_cgroup_support: self.has_cgroup_support,
            members: Arc::clone(&self.members),
            closed: Arc::clone(&self.closed),
            events,
            key,
        };
        let handle = thread::Builder::new()
            .name("container-monitor".to_string())
            .spawn(move || monitor.run())
            .map_err(ResultCode::ResourceCreation)?;
        self.monitor = Some(handle);
        log::debug!("{} ({}) associated as {}", self.id, self.name, key);
        Ok(())
    }

    fn active_processes(&self) -> usize {
        self.current_members().len()
    }

    fn terminate_all(&mut self, reason_code: i32) {
        let members = self.current_members();
        if members.is_empty() {
            return;
        }
        log::warn!(
            "terminating {} process(es) in {} (code {})",
            members.len(),
            self.id,
            reason_code
        );
        for pid in members {
            // Process group first, then the process itself.
            let _ = signal::kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        for dir in [&self.memory_path, &self.pids_path] {
            if dir.exists() {
                let _ = fs::remove_dir(dir);
            }
        }
    }
}

impl Drop for CgroupContainer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Polls the container membership and turns set changes into events.
struct Monitor {
    procs_file: PathBuf,
    failcnt_file: PathBuf,
    pids_events_file: PathBuf,
    has_cgroup_support: bool,
    members: Arc<Mutex<HashSet<u32>>>,
    closed: Arc<AtomicBool>,
    events: EventSender,
    key: TrackerKey,
}

impl Monitor {
    fn run(self) {
        // Pids announced as created and still alive.
        let mut live: HashSet<u32> = HashSet::new();
        // Pids whose full created/exited pair has been delivered.
        let mut retired: HashSet<u32> = HashSet::new();
        let mut last_failcnt = 0u64;
        let mut last_limit_hits = 0u64;

        loop {
            if self.closed.load(Ordering::Relaxed) {
                return;
            }

            let current =
                member_snapshot(self.has_cgroup_support, &self.procs_file, &self.members);

            for pid in current.difference(&live) {
                if !self
                    .events
                    .post_event(self.key, ContainerEvent::ProcessCreated(*pid))
                {
                    return;
                }
            }
            for pid in live.difference(&current) {
                if !self
                    .events
                    .post_event(self.key, ContainerEvent::ProcessExited(*pid))
                {
                    return;
                }
                retired.insert(*pid);
            }
            live = current;

            // A registered process that died between polls without ever
            // being observed still gets its full pair, so the broker's
            // accounting balances no matter how the timing fell.
            let registered: Vec<u32> = self.members.lock().unwrap().iter().copied().collect();
            for pid in registered {
                if !live.contains(&pid) && !retired.contains(&pid) {
                    if !self
                        .events
                        .post_event(self.key, ContainerEvent::ProcessCreated(pid))
                    {
                        return;
                    }
                    if !self
                        .events
                        .post_event(self.key, ContainerEvent::ProcessExited(pid))
                    {
                        return;
                    }
                    retired.insert(pid);
                }
            }

            if self.has_cgroup_support {
                if let Some(failcnt) = read_counter(&self.failcnt_file) {
                    if failcnt > last_failcnt {
                        last_failcnt = failcnt;
                        if !self
                            .events
                            .post_event(self.key, ContainerEvent::MemoryLimitExceeded)
                        {
                            return;
                        }
                    }
                }
                if let Some(hits) = read_limit_hits(&self.pids_events_file) {
                    if hits > last_limit_hits {
                        last_limit_hits = hits;
                        if !self
                            .events
                            .post_event(self.key, ContainerEvent::ProcessLimitExceeded)
                        {
                            return;
                        }
                    }
                }
            }

            if live.is_empty() && !retired.is_empty() {
                // The container drained; one final notification and done.
                self.events
                    .post_event(self.key, ContainerEvent::AllProcessesExited);
                return;
            }

            thread::sleep(MONITOR_POLL_INTERVAL);
        }
    }
}

/// Current member pids: the cgroup's process list merged with the still-live
/// registered pids. Zombies count as exited.
fn member_snapshot(
    has_cgroup_support: bool,
    procs_file: &Path,
    members: &Mutex<HashSet<u32>>,
) -> HashSet<u32> {
    let mut current = HashSet::new();
    if has_cgroup_support {
        if let Ok(content) = fs::read_to_string(procs_file) {
            for line in content.lines() {
                if let Ok(pid) = line.trim().parse::<u32>() {
                    current.insert(pid);
                }
            }
        }
    }
    for pid in members.lock().unwrap().iter() {
        if pid_alive(*pid) {
            current.insert(*pid);
        }
    }
    current
}

fn pid_alive(pid: u32) -> bool {
    let stat = match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    // State is the first field after the parenthesized comm.
    let state = stat
        .rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .and_then(|field| field.chars().next());
    !matches!(state, None | Some('Z') | Some('X') | Some('x'))
}

fn read_counter(file: &Path) -> Option<u64> {
    fs::read_to_string(file).ok()?.trim().parse().ok()
}

/// pids.events reports "max <count>" limit hits.
fn read_limit_hits(file: &Path) -> Option<u64> {
    let content = fs::read_to_string(file).ok()?;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("max") {
            return parts.next()?.parse().ok();
        }
    }
    None
}

pub fn cgroups_available() -> bool {
    Path::new("/proc/cgroups").exists() && Path::new(CGROUP_BASE).exists()
}

pub fn available_controllers() -> io::Result<HashSet<String>> {
    let content = fs::read_to_string("/proc/cgroups")?;
    let mut controllers = HashSet::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 4 && parts[3] == "1" {
            controllers.insert(parts[0].to_string());
        }
    }
    Ok(controllers)
}
