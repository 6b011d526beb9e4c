use anyhow::{Context, Result};
use atelier::agent::{AgentConfig, ExecOptions};
use atelier::cli::{Cli, Commands};
use atelier::config::RuntimeConfig;
use atelier::container::ContainerBackend;
use atelier::runtime::{
    EventBus, RuntimeBackend, RuntimeManager, RuntimeRegistry, RuntimeSelector,
};
use atelier::session::MultiplexedBackend;
use clap::Parser;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atelier=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli.root.as_ref().map(|p| p.to_string_lossy().into_owned());
    let config = RuntimeConfig::resolve(cli.config.as_deref())
        .and_then(|c| c.with_overrides(cli.runtime.as_deref(), root.as_deref()))
        .context("loading runtime config")?;

    match cli.command {
        Commands::Detect => {
            let events = EventBus::new();
            let mut registry = RuntimeRegistry::with_defaults(&config, &events);
            let known: Vec<_> = registry
                .backends()
                .iter()
                .map(|b| (b.kind(), b.capabilities()))
                .collect();
            let available = match registry.detect_available_runtimes().await {
                Ok(kinds) => kinds,
                Err(e) => {
                    println!("{}", e);
                    Vec::new()
                }
            };

            println!("Runtimes:");
            for (kind, caps) in &known {
                println!(
                    "  {:<10} {:<14} isolation={:?} hard_limits={} network_isolation={} max_agents={}",
                    kind.as_str(),
                    if available.contains(kind) { "available" } else { "not available" },
                    caps.isolation_level,
                    caps.has_hard_resource_limits,
                    caps.supports_network_isolation,
                    caps.max_concurrent_agents
                );
            }

            let selector = RuntimeSelector::new(config.fallback_chain.clone());
            println!();
            match selector.resolve(config.preference, &available) {
                Some(kind) => println!("Selected: {} (preference: {})", kind, config.preference),
                None => println!("No usable runtime"),
            }
        }

        Commands::Run {
            agent_type,
            command,
            id,
            team,
            image,
            project,
            env,
            timeout,
        } => {
            let agent_id = id.unwrap_or_else(|| {
                let suffix: String = (0..4)
                    .map(|_| format!("{:x}", rand::random::<u8>() % 16))
                    .collect();
                format!("{}-{}", agent_type, suffix)
            });

            let mut agent = AgentConfig::new(&agent_id, &agent_type);
            if let Some(team) = team {
                agent = agent.with_team(team);
            }
            if let Some(image) = image {
                agent = agent.with_image(image);
            }
            if let Some(project) = project {
                agent = agent.with_project(project);
            }
            for (key, value) in env {
                agent = agent.with_env(key, value);
            }
            let options = ExecOptions {
                timeout: timeout.map(Duration::from_secs),
                ..Default::default()
            };

            let manager = RuntimeManager::new(&config);
            let runtime = manager.initialize().await?;
            eprintln!("Running '{}' in {} agent '{}'", command, runtime, agent_id);

            let outcome = run_once(&manager, agent, &command, options).await;
            if let Err(e) = manager.shutdown().await {
                tracing::warn!(error = %e, "shutdown incomplete");
            }

            let result = outcome?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            eprintln!("exit {} in {}ms", result.exit_code, result.duration.as_millis());
            std::process::exit(result.exit_code);
        }

        Commands::Stats => {
            let manager = RuntimeManager::new(&config);
            manager.initialize().await?;
            let stats = manager.stats().await;
            manager.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Sweep => {
            let events = EventBus::new();

            let tmux = MultiplexedBackend::new(&config, events.clone());
            if tmux.check_availability().await? {
                let killed = tmux.sweep_orphans().await?;
                println!("tmux:      removed {} orphaned session(s)", killed);
            } else {
                println!("tmux:      not available");
            }

            let container = ContainerBackend::new(&config, events);
            if container.check_availability().await? {
                let removed = container.sweep_stale().await?;
                println!("container: removed {} stale container(s)", removed);
            } else {
                println!("container: not available");
            }
        }
    }

    Ok(())
}

/// Create the agent, run the command, destroy the agent
async fn run_once(
    manager: &RuntimeManager,
    agent: AgentConfig,
    command: &str,
    options: ExecOptions,
) -> Result<atelier::agent::CommandResult> {
    let agent_id = agent.agent_id.clone();
    let provisioned = manager.create_agent(agent).await?;
    for warning in &provisioned.warnings {
        eprintln!("warning: {}", warning);
    }
    if provisioned.pooled {
        eprintln!("Claimed a warm instance");
    }

    let result = manager.execute_command(&agent_id, command, options).await;
    manager.destroy_agent(&agent_id).await?;
    Ok(result?)
}
