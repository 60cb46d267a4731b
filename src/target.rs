/// Suspended target process launch
///
/// A target starts with a restrictive security context already applied but
/// sits stopped before exec until the collaborator that owns it resumes it.
use crate::policy::Policy;
use crate::types::{Mitigations, Result, ResultCode, TokenSet};
use chrono::{DateTime, Utc};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

/// Launch configuration derived from the policy for one spawn.
#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    pub mitigations: Mitigations,
    /// Forbid the target from creating child processes of its own.
    pub restrict_child_processes: bool,
    /// Detach the target into a session of its own.
    pub alternate_session: Option<String>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
    /// Deduplicated descriptor allowlist. Empty means the target inherits
    /// nothing beyond its standard streams.
    pub inherited_handles: Vec<RawFd>,
    pub environment: Vec<(String, String)>,
}

impl LaunchOptions {
    /// Collect the policy-declared launch configuration.
    ///
    /// The inherited-descriptor list is exactly the policy's stdout, stderr
    /// and shared handles, deduplicated.
    pub fn from_policy(policy: &dyn Policy) -> Self {
        let stdout = policy.stdout_handle();
        let stderr = policy.stderr_handle();

        let mut inherited = Vec::new();
        if let Some(fd) = stdout {
            inherited.push(fd);
        }
        if let Some(fd) = stderr {
            if !inherited.contains(&fd) {
                inherited.push(fd);
            }
        }
        for fd in policy.shared_handles() {
            if !inherited.contains(&fd) {
                inherited.push(fd);
            }
        }

        LaunchOptions {
            mitigations: policy.process_mitigations(),
            restrict_child_processes: !policy.container_level().allows_child_processes(),
            alternate_session: policy.alternate_session(),
            stdout,
            stderr,
            inherited_handles: inherited,
            environment: policy.environment(),
        }
    }
}

/// One spawned target. Owned by the policy after `add_target`; the broker
/// keeps only the identity.
pub struct TargetProcess {
    child: Child,
    pid: u32,
    exe_path: PathBuf,
    tokens: TokenSet,
    spawned_at: DateTime<Utc>,
    reaped: bool,
}

impl TargetProcess {
    /// Spawn the target stopped before exec, with the lockdown credentials,
    /// mitigations and descriptor allowlist already applied.
    pub fn spawn_suspended(
        exe_path: &Path,
        args: &[String],
        tokens: TokenSet,
        options: &LaunchOptions,
    ) -> Result<TargetProcess> {
        let mut cmd = Command::new(exe_path);
        cmd.args(args);

        cmd.env_clear();
        cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
        for (key, value) in &options.environment {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(match options.stdout {
            Some(fd) => duplicated_stdio(fd)?,
            None => Stdio::null(),
        });
        cmd.stderr(match options.stderr {
            Some(fd) => duplicated_stdio(fd)?,
            None => Stdio::null(),
        });

        let lockdown = tokens.lockdown;
        let mitigations = options.mitigations;
        let restrict_children = options.restrict_child_processes;
        let new_session = options.alternate_session.is_some();
        let allowlist = options.inherited_handles.clone();

        unsafe {
            cmd.pre_exec(move || {
                if new_session {
                    nix::unistd::setsid().map_err(errno_to_io)?;
                }
                apply_mitigations(&mitigations)?;
                close_unlisted_descriptors(&allowlist);
                if let Some(gid) = lockdown.gid {
                    if libc::setgid(gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if let Some(uid) = lockdown.uid {
                    if libc::setuid(uid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                // After the credential drop so setuid itself is not counted
                // against the zero-process budget.
                if restrict_children {
                    setrlimit(Resource::RLIMIT_NPROC, 0, 0).map_err(errno_to_io)?;
                }
                // Suspend here; exec proceeds once the owner sends SIGCONT.
                signal::raise(Signal::SIGSTOP).map_err(errno_to_io)?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(ResultCode::Generic)?;
        let pid = child.id();
        log::debug!("spawned target {} suspended (pid {})", exe_path.display(), pid);

        Ok(TargetProcess {
            child,
            pid,
            exe_path: exe_path.to_path_buf(),
            tokens,
            spawned_at: Utc::now(),
            reaped: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    /// Let the suspended target proceed into exec.
    pub fn resume(&self) -> Result<()> {
        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGCONT)
            .map_err(|e| ResultCode::Generic(errno_to_io(e)))
    }

    /// Kill the target and reap it. Safe to call on an already-dead target.
    pub fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }

    /// Block until the target exits and report its status.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().map_err(ResultCode::Generic)?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for TargetProcess {
    fn drop(&mut self) {
        if !self.reaped {
            log::debug!("killing unreleased target pid {} on drop", self.pid);
            self.terminate();
        }
    }
}

fn duplicated_stdio(fd: RawFd) -> Result<Stdio> {
    let duplicate = nix::unistd::dup(fd).map_err(|e| {
        ResultCode::ProcThreadAttributes(format!("cannot duplicate descriptor {}: {}", fd, e))
    })?;
    Ok(unsafe { Stdio::from_raw_fd(duplicate) })
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Runs between fork and exec; must stay allocation-free.
fn apply_mitigations(mitigations: &Mitigations) -> io::Result<()> {
    unsafe {
        if mitigations.die_with_parent
            && libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0
        {
            return Err(io::Error::last_os_error());
        }
        if mitigations.non_dumpable
            && libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong) != 0
        {
            return Err(io::Error::last_os_error());
        }
        if mitigations.no_new_privileges
            && libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Enforce the inheritance allowlist: every descriptor above stderr that is
/// not listed gets closed, listed ones get FD_CLOEXEC cleared so they
/// survive exec. Also drops the standard library's exec status pipe, which
/// is what lets the parent's spawn() return while the child sits stopped.
fn close_unlisted_descriptors(keep: &[RawFd]) {
    const MAX_DESCRIPTOR: RawFd = 4096;
    for fd in 3..MAX_DESCRIPTOR {
        if keep.contains(&fd) {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags >= 0 {
                    libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                }
            }
        } else {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
