use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod args;
mod config;
mod error;
mod port;
mod probe;
mod runner;
mod session;
mod signals;
mod tunnel;

use config::Config;
use error::TunnelError;
use probe::ReadinessProbe;
use runner::{Workload, WorkloadStdio};
use session::TunnelSession;
use signals::Interrupts;
use tunnel::{
    BackendKind, BackendParams, BackendRegistry, Endpoint, KubeParams, ResourceKind, SshParams,
    TunnelSpec,
};

#[derive(Parser)]
#[command(name = "pgtun")]
#[command(about = "Run a database client through a temporary tunnel")]
struct Cli {
    /// More log output (-v info, -vv debug). PGTUN_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a tunnel and run the client through it
    ///
    /// Examples:
    ///   pgtun connect --ssh-host bastion.example --ssh-user me -- --host db.internal -U app
    ///   pgtun connect --tunnel-type k8s --k8s-resource-name postgres-0 -- -U app
    Connect(ConnectArgs),
    /// Show or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with the defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct ConnectArgs {
    /// Tunnel backend
    #[arg(long, value_enum)]
    tunnel_type: Option<BackendKind>,

    /// (ssh) tunnel user
    #[arg(long)]
    ssh_user: Option<String>,
    /// (ssh) tunnel host
    #[arg(long)]
    ssh_host: Option<String>,
    /// (ssh) extra -o option, repeatable
    #[arg(long = "ssh-option")]
    ssh_options: Vec<String>,

    /// (k8s) namespace
    #[arg(long)]
    k8s_namespace: Option<String>,
    /// (k8s) resource type: pods or services
    #[arg(long)]
    k8s_resource_type: Option<String>,
    /// (k8s) resource to port forward
    #[arg(long)]
    k8s_resource_name: Option<String>,
    /// (k8s) target port in the resource
    #[arg(long)]
    k8s_remote_port: Option<u16>,

    /// Local address the tunnel listens on
    #[arg(long)]
    local_host: Option<String>,
    #[arg(long)]
    local_port: Option<u16>,
    /// Pick the next free local port if the configured one is taken
    #[arg(long)]
    auto_port: bool,

    /// (ssh) database host as seen from the tunnel host; defaults to the client's --host
    #[arg(long)]
    remote_host: Option<String>,
    /// (ssh) database port; defaults to the client's --port
    #[arg(long)]
    remote_port: Option<u16>,

    /// Client program to run
    #[arg(long)]
    client: Option<String>,
    /// Connection attempts before giving up on the tunnel
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    attempts: Option<u32>,
    /// Delay between connection attempts
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Arguments passed to the client
    #[arg(last = true)]
    client_args: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { action } => config_command(action).map(|()| ExitCode::SUCCESS),
        Commands::Connect(args) => connect(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            let code = e
                .downcast_ref::<TunnelError>()
                .map(TunnelError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("PGTUN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("pgtun={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(
        shell,
        &mut cmd,
        "pgtun",
        &mut io::stdout()
    );
}

fn config_command(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            let contents = serde_json::to_string_pretty(&config)
                .context("Failed to serialize config")?;
            println!("{}", contents);
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path()?.display());
        }
        ConfigAction::Init { force } => {
            let path = Config::config_path()?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file {} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save()?;
            println!("{}", format!("✓ Wrote {}", path.display()).green());
        }
    }
    Ok(())
}

/// Fold command line overrides into the loaded config.
fn apply_overrides(config: &mut Config, args: &ConnectArgs) {
    if let Some(kind) = args.tunnel_type {
        config.tunnel_type = kind;
    }
    if let Some(user) = &args.ssh_user {
        config.ssh.user = user.clone();
    }
    if let Some(host) = &args.ssh_host {
        config.ssh.host = host.clone();
    }
    if !args.ssh_options.is_empty() {
        config.ssh.options = args.ssh_options.clone();
    }
    if let Some(namespace) = &args.k8s_namespace {
        config.k8s.namespace = namespace.clone();
    }
    if let Some(resource_type) = &args.k8s_resource_type {
        config.k8s.resource_type = resource_type.clone();
    }
    if let Some(resource_name) = &args.k8s_resource_name {
        config.k8s.resource_name = resource_name.clone();
    }
    if let Some(port) = args.k8s_remote_port {
        config.k8s.remote_port = port;
    }
    if let Some(host) = &args.local_host {
        config.local_host = host.clone();
    }
    if let Some(port) = args.local_port {
        config.local_port = port;
    }
    if let Some(client) = &args.client {
        config.client = client.clone();
    }
    if let Some(attempts) = args.attempts {
        config.readiness.attempts = attempts;
    }
    if let Some(interval_ms) = args.interval_ms {
        config.readiness.interval_ms = interval_ms;
    }
}

/// Build the tunnel spec. For ssh the remote target falls back to what the
/// client was told to connect to.
fn build_spec(
    config: &Config,
    args: &ConnectArgs,
    client_host: Option<&str>,
    client_port: Option<u16>,
) -> Result<TunnelSpec> {
    let local = Endpoint::new(config.local_host.clone(), config.local_port);

    let spec = match config.tunnel_type {
        BackendKind::Ssh => TunnelSpec {
            local,
            remote: Endpoint::new(
                args.remote_host
                    .as_deref()
                    .or(client_host)
                    .unwrap_or("127.0.0.1"),
                args.remote_port.or(client_port).unwrap_or(5432),
            ),
            params: BackendParams::Ssh(SshParams {
                user: config.ssh.user.clone(),
                host: config.ssh.host.clone(),
                options: config.ssh.options.clone(),
            }),
        },
        BackendKind::K8s => TunnelSpec {
            local,
            remote: Endpoint::new(config.local_host.clone(), config.k8s.remote_port),
            params: BackendParams::Kube(KubeParams {
                namespace: config.k8s.namespace.clone(),
                resource_kind: config.k8s.resource_type.parse::<ResourceKind>()?,
                resource_name: config.k8s.resource_name.clone(),
            }),
        },
    };
    Ok(spec)
}

/// Settle the local port before anything is opened; it stays fixed after.
fn preflight_local_port(config: &mut Config, auto_port: bool) -> Result<()> {
    let host = config.local_host.clone();
    let wanted = config.local_port;
    if port::is_port_available(&host, wanted) {
        return Ok(());
    }

    println!("{}", format!("Port {} is already in use", wanted).yellow());
    if auto_port {
        let next = wanted
            .checked_add(1)
            .and_then(|start| port::find_available_port(&host, start))
            .context("No available ports found!")?;
        config.local_port = next;
        println!("{}", format!("Using port {} instead", next).green());
    } else {
        println!(
            "{}",
            "⚠ Something else is listening there; the tunnel may be reported ready falsely"
                .yellow()
        );
    }
    Ok(())
}

async fn connect(args: ConnectArgs) -> Result<ExitCode> {
    let mut config = Config::load()?;
    apply_overrides(&mut config, &args);
    let policy = config.readiness.policy()?;

    preflight_local_port(&mut config, args.auto_port)?;

    let client = args::rewrite(&args.client_args, &config.local_host, config.local_port)?;
    let spec = build_spec(&config, &args, client.host.as_deref(), client.port)?;
    let workload = Workload::new(config.client.clone(), client.args);

    let mut interrupts = Interrupts::listen().context("Failed to install signal handlers")?;
    let mut session = TunnelSession::new(
        Arc::new(BackendRegistry::default()),
        config.tunnel_type,
        spec,
        ReadinessProbe::new(policy),
    );
    tracing::info!(
        local = %session.spec().local,
        remote = %session.spec().remote,
        backend = %config.tunnel_type,
        "Tunnel spec"
    );

    let result = session
        .run(&workload, WorkloadStdio::inherit(), &mut interrupts)
        .await;

    tracing::debug!(
        state = ?session.state(),
        history = ?session.history(),
        readiness = ?session.readiness(),
        "Session finished"
    );
    if let Some(e) = session.close_error() {
        eprintln!("{}", format!("  ⚠ Warning: {}", e).yellow());
    }

    match result {
        Ok(outcome) => {
            if !outcome.success() {
                tracing::info!(?outcome, "{} exited unsuccessfully", config.client);
            }
            Ok(ExitCode::from(outcome.exit_code()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn connect_args(extra: &[&str]) -> ConnectArgs {
        let mut argv = vec!["pgtun", "connect"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Connect(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ssh_spec_from_client_args() {
        let args = connect_args(&[
            "--ssh-user",
            "user",
            "--ssh-host",
            "bastion.example",
            "--",
            "--host",
            "db.internal",
            "--port",
            "5432",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);

        let client = args::rewrite(&args.client_args, &config.local_host, config.local_port)
            .unwrap();
        let spec = build_spec(&config, &args, client.host.as_deref(), client.port).unwrap();

        assert_eq!(spec.local, Endpoint::new("127.0.0.1", 5432));
        assert_eq!(spec.remote, Endpoint::new("db.internal", 5432));
        assert_eq!(client.args, ["--host", "127.0.0.1", "--port", "5432"]);

        let tunnel = tunnel::ProcessTunnel::from_spec(&spec).unwrap();
        assert_eq!(
            tunnel.args(),
            [
                "-N",
                "-L",
                "127.0.0.1:5432:db.internal:5432",
                "user@bastion.example"
            ]
        );
    }

    #[test]
    fn test_remote_flags_win_over_client_args() {
        let args = connect_args(&[
            "--remote-host",
            "10.0.0.7",
            "--remote-port",
            "6432",
            "--",
            "--host",
            "db.internal",
        ]);
        let config = Config::default();
        let spec = build_spec(&config, &args, Some("db.internal"), None).unwrap();
        assert_eq!(spec.remote, Endpoint::new("10.0.0.7", 6432));
    }

    #[test]
    fn test_k8s_spec() {
        let args = connect_args(&[
            "--tunnel-type",
            "k8s",
            "--k8s-namespace",
            "db",
            "--k8s-resource-type",
            "svc",
            "--k8s-resource-name",
            "postgres",
            "--k8s-remote-port",
            "6432",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);
        let spec = build_spec(&config, &args, None, None).unwrap();

        assert_eq!(spec.remote.port, 6432);
        assert_eq!(
            spec.params,
            BackendParams::Kube(KubeParams {
                namespace: "db".into(),
                resource_kind: ResourceKind::Service,
                resource_name: "postgres".into(),
            })
        );
    }

    #[test]
    fn test_unknown_resource_type() {
        let args = connect_args(&["--tunnel-type", "k8s", "--k8s-resource-type", "jobs"]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);
        assert!(build_spec(&config, &args, None, None).is_err());
    }

    #[test]
    fn test_zero_attempts_rejected_by_cli() {
        let argv = ["pgtun", "connect", "--attempts", "0"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_auto_port_moves_off_occupied_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        let mut config = Config {
            local_port: taken,
            ..Config::default()
        };

        preflight_local_port(&mut config, true).unwrap();
        assert_ne!(config.local_port, taken);

        let mut config = Config {
            local_port: taken,
            ..Config::default()
        };
        preflight_local_port(&mut config, false).unwrap();
        assert_eq!(config.local_port, taken);
    }

    #[test]
    fn test_interval_default() {
        let policy = Config::default().readiness.policy().unwrap();
        assert_eq!(policy.interval, Duration::from_secs(1));
    }
}
