mod client;
mod config;
mod error;
mod serve;
mod signal;

use std::io::{self, BufRead, IsTerminal, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use clap::{Parser, Subcommand};
use runtime::{
    Capability, Registry, RegistryToolHost, RunningServerRecord, ServerStatus, Supervisor,
    ToolServerSpec, tools,
};
use tokio::process::Command;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use signal::Interrupt;
use error::{Error, Result};

#[derive(Parser)]
#[command(name = "toolhub")]
#[command(about = "Launch and use chatbot tool servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./toolhub.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch every tool server and keep them running until interrupted
    Servers,
    /// Connect to the registered servers and open the interactive client
    Client,
    /// Launch the servers, run the client, stop the servers when it exits
    Both,
    /// Run one tool server in the foreground
    Serve {
        /// weather, sql, or ppt-translate
        capability: Capability,
        /// Port to listen on (default: the capability's default port)
        #[arg(long)]
        port: Option<u16>,
        /// Interface to bind (default: `host` from the config)
        #[arg(long)]
        host: Option<IpAddr>,
    },
    /// Show registered servers and whether they answer
    Status,
}

/// Menu entries of the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuChoice {
    Servers,
    Client,
    Both,
    Exit,
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    // Tool servers get their own single-threaded runtime.
    if let Some(Commands::Serve {
        capability,
        port,
        host,
    }) = cli.command
    {
        let port = port.unwrap_or_else(|| capability.default_port());
        return serve::run(&config, capability, host.unwrap_or(config.host), port);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match cli.command {
            Some(Commands::Servers) => cmd_servers(&config, cli.config.as_ref()).await,
            Some(Commands::Client) => cmd_client(&config).await,
            Some(Commands::Both) => cmd_both(&config, cli.config.as_ref()).await,
            Some(Commands::Status) => cmd_status(&config).await,
            Some(Commands::Serve { .. }) => Ok(()),
            None => match prompt_menu()? {
                MenuChoice::Servers => cmd_servers(&config, cli.config.as_ref()).await,
                MenuChoice::Client => cmd_client(&config).await,
                MenuChoice::Both => cmd_both(&config, cli.config.as_ref()).await,
                MenuChoice::Exit => Ok(()),
            },
        }
    })
}

fn parse_choice(input: &str) -> Option<MenuChoice> {
    match input.trim() {
        "1" => Some(MenuChoice::Servers),
        "2" => Some(MenuChoice::Client),
        "3" => Some(MenuChoice::Both),
        "4" | "q" | "quit" | "exit" => Some(MenuChoice::Exit),
        _ => None,
    }
}

fn prompt_menu() -> Result<MenuChoice> {
    println!("toolhub v{}", env!("CARGO_PKG_VERSION"));
    println!("  1) Start tool servers");
    println!("  2) Start client");
    println!("  3) Start both");
    println!("  4) Exit");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("Choice [1-4]: ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(MenuChoice::Exit);
        }
        match parse_choice(&line) {
            Some(choice) => return Ok(choice),
            None => println!("Please enter 1, 2, 3 or 4."),
        }
    }
}

/// Built-in server specs that re-invoke this executable.
///
/// With a `base_port`, the servers prefer consecutive ports starting there
/// instead of their defaults.
fn builtin_specs(config_path: Option<&PathBuf>, base_port: Option<u16>) -> Result<Vec<ToolServerSpec>> {
    let program = std::env::current_exe()?;
    let mut prefix = Vec::new();
    if let Some(path) = config_path {
        let path = std::path::absolute(path)?;
        prefix.push("--config".to_string());
        prefix.push(path.to_string_lossy().into_owned());
    }

    let mut specs = ToolServerSpec::builtin(program, &prefix);
    if let Some(base) = base_port {
        for (offset, spec) in (0u16..).zip(specs.iter_mut()) {
            spec.default_port = base.saturating_add(offset);
        }
    }
    Ok(specs)
}

/// Launch the built-in servers.
///
/// Returns `None` when `interrupt` fired during the launch; every server
/// spawned so far has been stopped by then.
async fn start_servers(
    config: &Config,
    config_path: Option<&PathBuf>,
    interrupt: &mut Interrupt,
) -> Result<Option<Supervisor>> {
    let specs = builtin_specs(config_path, config.supervisor.base_port)?;
    let mut supervisor = Supervisor::new(Registry::new(&config.registry), config.supervisor_options());

    let launched = tokio::select! {
        result = supervisor.start_all(&specs) => Some(result),
        () = interrupt.recv() => None,
    };
    let records = match launched {
        Some(Ok(records)) => records,
        Some(Err(e)) => {
            shutdown_servers(supervisor).await;
            return Err(e.into());
        }
        None => {
            info!("interrupted during launch");
            shutdown_servers(supervisor).await;
            return Ok(None);
        }
    };
    print_records(&records);

    if records.iter().all(|r| r.status != ServerStatus::Running) {
        supervisor.stop_all().await;
        return Err(Error::NoServersStarted);
    }
    println!("Registry written to {}", config.registry.display());
    Ok(Some(supervisor))
}

async fn shutdown_servers(mut supervisor: Supervisor) {
    let stopped = supervisor.stop_all().await;
    if let Err(e) = supervisor.registry().clear() {
        warn!(error = %e, "failed to remove registry");
    }
    println!("Stopped {} server(s).", stopped.len());
}

async fn cmd_servers(config: &Config, config_path: Option<&PathBuf>) -> Result<()> {
    let mut interrupt = Interrupt::install()?;
    let Some(supervisor) = start_servers(config, config_path, &mut interrupt).await? else {
        return Ok(());
    };
    println!("Press Ctrl+C to stop.");

    interrupt.recv().await;
    info!("shutdown requested");
    shutdown_servers(supervisor).await;
    Ok(())
}

async fn cmd_client(config: &Config) -> Result<()> {
    let registry = Registry::new(&config.registry);
    let (host, unreachable) =
        RegistryToolHost::from_registry(&registry, &config.connect_options()).await?;

    for entry in &unreachable {
        eprintln!("Skipping {} at {}: {}", entry.name, entry.endpoint, entry.error);
    }
    if host.is_empty() {
        return Err(Error::NoReachableServers {
            path: config.registry.clone(),
        });
    }

    client::Client::new(host).run().await
}

/// Servers in this process, client as a separate child process.
async fn cmd_both(config: &Config, config_path: Option<&PathBuf>) -> Result<()> {
    let mut interrupt = Interrupt::install()?;
    let Some(mut supervisor) = start_servers(config, config_path, &mut interrupt).await? else {
        return Ok(());
    };

    let mut command = Command::new(std::env::current_exe()?);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    command
        .arg("client")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let outcome = match command.spawn() {
        Ok(mut child) => {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(Error::ClientFailed { status: status.to_string() }),
                    Err(e) => Err(Error::Io(e)),
                },
                () = interrupt.recv() => {
                    info!("shutdown requested");
                    if let Err(e) = runtime::terminate(&mut child, config.supervisor_options().grace_period).await {
                        warn!(error = %e, "failed to stop client");
                    }
                    Ok(())
                }
            }
        }
        Err(e) => Err(Error::Io(e)),
    };

    let records = supervisor.refresh_status();
    if records.iter().any(|r| r.status == ServerStatus::Failed) {
        print_records(&records);
    }
    shutdown_servers(supervisor).await;
    outcome
}

async fn cmd_status(config: &Config) -> Result<()> {
    let registry = Registry::new(&config.registry);
    let entries = registry.read()?;
    if entries.is_empty() {
        println!("No servers registered in {}.", config.registry.display());
        return Ok(());
    }

    let timeout = config.connect_options().connect_timeout;
    println!("{:<16}  {:<22}  {:<10}  TOOLS", "NAME", "ADDRESS", "STATE");
    println!("{}", "-".repeat(64));
    for (name, endpoint) in &entries {
        let address = format!("{}:{}", endpoint.host, endpoint.port);
        match tools::probe(name, endpoint, timeout).await {
            Ok(tools) => {
                let names: Vec<_> = tools.iter().map(|t| t.tool_name.as_str()).collect();
                println!("{name:<16}  {address:<22}  {:<10}  {}", "up", names.join(", "));
            }
            Err(e) => println!("{name:<16}  {address:<22}  {:<10}  {e}", "down"),
        }
    }
    Ok(())
}

fn print_records(records: &[RunningServerRecord]) {
    println!("{:<16}  {:<8}  {:<8}  {:<8}  DETAIL", "SERVER", "STATUS", "PORT", "PID");
    println!("{}", "-".repeat(64));
    for record in records {
        let port = record.assigned_port.map_or_else(|| "-".to_string(), |p| p.to_string());
        let pid = record.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        let detail = record.error.as_deref().unwrap_or("");
        println!(
            "{:<16}  {:<8}  {port:<8}  {pid:<8}  {detail}",
            record.name,
            record.status.to_string()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn menu_choices() {
        assert_eq!(parse_choice("1\n"), Some(MenuChoice::Servers));
        assert_eq!(parse_choice(" 2 "), Some(MenuChoice::Client));
        assert_eq!(parse_choice("3"), Some(MenuChoice::Both));
        assert_eq!(parse_choice("4"), Some(MenuChoice::Exit));
        assert_eq!(parse_choice("5"), None);
        assert_eq!(parse_choice(""), None);
    }

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::try_parse_from([
            "toolhub",
            "--config",
            "hub.toml",
            "serve",
            "ppt-translate",
            "--port",
            "9003",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("hub.toml")));
        match cli.command {
            Some(Commands::Serve { capability, port, host }) => {
                assert_eq!(capability, Capability::PptTranslate);
                assert_eq!(port, Some(9003));
                assert!(host.is_none());
            }
            _ => panic!("expected serve"),
        }
        assert!(Cli::try_parse_from(["toolhub", "serve", "rag"]).is_err());
    }

    #[test]
    fn builtin_specs_forward_config() {
        let path = PathBuf::from("hub.toml");
        let specs = builtin_specs(Some(&path), None).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].default_port, 8001);
        assert_eq!(specs[0].entry.args[0], "--config");
        assert!(specs[0].entry.args[1].ends_with("hub.toml"));
        assert_eq!(&specs[1].entry.args[2..], ["serve", "sql"]);
    }

    #[test]
    fn base_port_shifts_builtin_ports() {
        let specs = builtin_specs(None, Some(19100)).unwrap();
        let ports: Vec<_> = specs.iter().map(|s| s.default_port).collect();
        assert_eq!(ports, [19100, 19101, 19102]);
    }
}
