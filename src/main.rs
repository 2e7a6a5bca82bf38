use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use artscope::agent::{self, Agent};
use artscope::channel::ControlChannel;
use artscope::cli::{Cli, Commands, ExecCommand, PluginsCommand, ResolveCommand};
use artscope::plugin::{context, PluginHost};
use artscope::registry::CommandRegistry;
use artscope::server::{self, App, Session};
use artscope::symbols::Resolver;
use artscope::ArtscopeError;
use clap::Parser;
use nix::unistd::getuid;
use tracing_subscriber::EnvFilter;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    std::hint::black_box(context::exported_helpers());
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Serve(opts) => {
            let cfg = opts.to_config();
            println!(
                "[*]  Control server on {}, agent at {}",
                cfg.listen, cfg.channel.agent
            );
            server::serve(Arc::new(App::new(cfg)))
        }
        Commands::Agent(opts) => {
            let cfg = opts.to_agent_config();
            println!("[*]  Agent listening on {} ({})", cfg.listen, cfg.layout.name);
            agent::serve(Arc::new(Agent::new(cfg)))
        }
        Commands::Exec(opts) => run_exec(&opts),
        Commands::Resolve(opts) => run_resolve(&opts),
        Commands::Plugins(opts) => run_plugins(&opts),
    }
}

fn run_exec(opts: &ExecCommand) -> Result<()> {
    let cfg = opts.to_config();
    let agent = cfg.channel.agent;
    let line = opts.line();
    let channel = ControlChannel::new(cfg.channel);

    let mut stdout = io::stdout().lock();
    let relayed = channel
        .relay(agent, &line, &mut stdout)
        .with_context(|| format!("send '{line}' to agent at {agent}"))?;
    stdout.flush()?;
    if relayed == 0 {
        println!("[!]  No reply from agent");
    }
    Ok(())
}

fn run_resolve(opts: &ResolveCommand) -> Result<()> {
    if opts.pid.is_some() && !getuid().is_root() {
        println!("[!]  Not root, reading another process may fail");
    }

    let resolver = Resolver::new().with_fallback_paths(opts.fallback.iter().cloned());
    let candidates: Vec<&str> = opts.symbols.iter().map(String::as_str).collect();
    match resolver.resolve_in(opts.pid, &opts.library, &candidates) {
        Some(sym) => println!(
            "[+]  {} @ 0x{:x} (offset 0x{:x} in {})",
            sym.name,
            sym.address,
            sym.offset,
            sym.library.display()
        ),
        None => println!(
            "[!]  {}",
            ArtscopeError::SymbolNotFound {
                library: opts.library.clone(),
                candidates: opts.symbols.clone(),
            }
        ),
    }
    Ok(())
}

fn run_plugins(opts: &PluginsCommand) -> Result<()> {
    let cfg = opts.to_config();
    let mut host = PluginHost::from_config(&cfg);
    let mut registry = CommandRegistry::<Session>::new(cfg.registry.clone());
    let kept = host.autoload(None, &mut registry);

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&host.reports())?);
    } else {
        println!("[*]  Plugin directory: {}", host.dir().display());
        host.list(&mut io::stdout())?;
        println!("[+]  {kept} plugin(s), {} command(s) registered", registry.len());
    }
    Ok(())
}
