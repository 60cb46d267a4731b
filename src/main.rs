use anyhow::{bail, Context, Result};
use clap::Parser;
use sandbroker::broker::Broker;
use sandbroker::cgroup;
use sandbroker::cli::{Cli, Commands};
use sandbroker::policy::{BasicPolicy, PolicyConfig};
use sandbroker::types::ContainerLevel;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            policy,
            mem,
            processes,
            level,
            strict,
            command,
        } => run(policy, mem, processes, level, strict, command),
        Commands::Info => info(),
    }
}

fn run(
    policy_file: Option<PathBuf>,
    mem: Option<u64>,
    processes: Option<u32>,
    level: Option<String>,
    strict: bool,
    command: Vec<String>,
) -> Result<()> {
    let mut config = match policy_file {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read policy file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("invalid policy file {}", path.display()))?
        }
        None => PolicyConfig::default(),
    };
    if let Some(mem) = mem {
        config.memory_limit = Some(mem * 1024 * 1024);
    }
    if let Some(processes) = processes {
        config.process_limit = Some(processes);
    }
    if let Some(level) = level {
        config.level = parse_level(&level)?;
    }
    if strict {
        config.strict_mode = true;
    }

    let mut broker = Broker::new();
    broker.init()?;

    let policy = Arc::new(BasicPolicy::new(config));
    let spawned = broker.spawn_target(Path::new(&command[0]), &command[1..], policy.clone())?;
    log::info!(
        "target pid {} spawned{}",
        spawned.pid,
        if spawned.tracked { "" } else { " (untracked)" }
    );

    let mut target = policy
        .take_targets()
        .pop()
        .context("policy retained no target")?;
    target.resume()?;
    let status = target.wait()?;

    broker.wait_for_all_targets();
    drop(broker);

    match status.code() {
        Some(code) => std::process::exit(code),
        None => {
            use std::os::unix::process::ExitStatusExt;
            bail!("target killed by signal {:?}", status.signal())
        }
    }
}

fn parse_level(name: &str) -> Result<ContainerLevel> {
    Ok(match name {
        "lockdown" => ContainerLevel::Lockdown,
        "restricted" => ContainerLevel::Restricted,
        "limited" => ContainerLevel::Limited,
        "interactive" => ContainerLevel::Interactive,
        "unprotected" => ContainerLevel::Unprotected,
        other => bail!("unknown confinement level: {}", other),
    })
}

fn info() -> Result<()> {
    println!("cgroups available: {}", cgroup::cgroups_available());
    match cgroup::available_controllers() {
        Ok(controllers) => {
            let mut names: Vec<_> = controllers.into_iter().collect();
            names.sort();
            println!("enabled controllers: {}", names.join(", "));
        }
        Err(e) => println!("enabled controllers: unavailable ({})", e),
    }
    Ok(())
}
