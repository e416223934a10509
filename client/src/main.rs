use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use kubetap::config::KubetapConfig;
use kubetap::forward::PortMapping;
use kubetap::shell::ShellIo;
use kubetap::{signal, terminal, Establisher, QueryClient, TunnelController};
use kubetap_shared::protocol::{
    ClusterNodesRequest, ClusterStatus, ClusterStatusRequest, DebugPodRequest, DebugPrivilege,
    NodeList, PortForwardRequest, ShellRequest, ShellTarget,
};
use kubetap_shared::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kubetap")]
#[command(author = "Kubetap Team")]
#[command(version)]
#[command(about = "Reach into live Kubernetes clusters through the platform relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay base URL
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Config file (default: kubetap.yml in the current or home directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Access token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and debug clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },
    /// Open a shell in a running service pod
    Shell {
        #[command(flatten)]
        target: ServiceArgs,

        /// Container within the pod
        #[arg(long)]
        container: Option<String>,

        /// Command to run instead of the default shell
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Forward local ports to a service
    PortForward {
        #[command(flatten)]
        target: ServiceArgs,

        /// LOCAL:REMOTE port pair, or PORT for the same number on both sides
        #[arg(short, long = "port", required = true)]
        ports: Vec<PortMapping>,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Show live cluster status
    Status {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// List cluster nodes
    ListNodes {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Open a shell in a debug pod on a cluster node
    DebugPod {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Node selector for scheduling the debug pod
        #[arg(long)]
        node_selector: Option<String>,

        /// Run the debug pod with full host privileges
        #[arg(long)]
        full_privilege: bool,
    },
}

#[derive(Args)]
struct ClusterArgs {
    #[arg(long = "organization-id")]
    organization: String,

    #[arg(long = "cluster-id")]
    cluster: String,
}

#[derive(Args)]
struct ServiceArgs {
    #[arg(long = "organization-id")]
    organization: String,

    #[arg(long = "project-id")]
    project: String,

    #[arg(long = "environment-id")]
    environment: String,

    #[arg(long = "service-id")]
    service: String,

    /// Target a specific pod
    #[arg(long)]
    pod: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(cli));
    // A blocked stdin read never returns on its own.
    runtime.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "kubetap=debug,kubetap_shared=debug"
    } else {
        "kubetap=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn report(err: &anyhow::Error) {
    eprintln!("Error: {:#}", err);
    if let Some(hint) = err.downcast_ref::<Error>().and_then(Error::hint) {
        eprintln!("Hint: {}", hint);
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = KubetapConfig::resolve(cli.config.as_deref())?;
    if let Some(relay) = cli.relay {
        config.relay = Some(relay);
    }
    if let Some(token) = cli.token {
        config.access_token = Some(token);
    }
    config.validate()?;

    let establisher = Establisher::new(config.relay_url()?, config.credentials()?)?;
    let controller = TunnelController::new(establisher.clone(), config.tunnel_options()?);

    match cli.command {
        Commands::Cluster { command } => match command {
            ClusterCommands::Status { cluster, json } => {
                let status = QueryClient::new(establisher)
                    .query(&ClusterStatusRequest {
                        organization: cluster.organization,
                        cluster: cluster.cluster,
                    })
                    .await?;
                print_status(&status, json)?;
                Ok(ExitCode::SUCCESS)
            }
            ClusterCommands::ListNodes { cluster, json } => {
                let nodes = QueryClient::new(establisher)
                    .query(&ClusterNodesRequest {
                        organization: cluster.organization,
                        cluster: cluster.cluster,
                    })
                    .await?;
                print_nodes(&nodes, json)?;
                Ok(ExitCode::SUCCESS)
            }
            ClusterCommands::DebugPod {
                cluster,
                node_selector,
                full_privilege,
            } => {
                let request = DebugPodRequest {
                    organization: cluster.organization,
                    cluster: cluster.cluster,
                    node_selector,
                    privilege: if full_privilege {
                        DebugPrivilege::Full
                    } else {
                        DebugPrivilege::Standard
                    },
                    tty_width: None,
                    tty_height: None,
                };
                run_shell(&controller, request).await
            }
        },
        Commands::Shell {
            target,
            container,
            command,
        } => {
            let request = ShellRequest {
                organization: target.organization,
                project: target.project,
                environment: target.environment,
                service: target.service,
                pod_name: target.pod,
                container_name: container,
                command,
                tty_width: None,
                tty_height: None,
            };
            run_shell(&controller, request).await
        }
        Commands::PortForward { target, ports } => {
            let request = PortForwardRequest {
                organization: target.organization,
                project: target.project,
                environment: target.environment,
                service: target.service,
                pod_name: target.pod,
                port: None,
            };
            run_port_forward(&controller, request, &ports).await
        }
    }
}

async fn run_shell<R: ShellTarget>(controller: &TunnelController, request: R) -> Result<ExitCode> {
    let interactive = terminal::is_interactive();
    let size = if interactive { terminal::current_size() } else { None };
    let mut session = controller.open_shell(request, size).await?;

    let cancel = signal::shutdown_token();
    let resize_watch = cancel.child_token();
    let resizes = terminal::watch_resizes(resize_watch.clone());
    let outcome = {
        let _raw = terminal::RawModeGuard::new(interactive);
        session
            .run(
                ShellIo {
                    stdin: tokio::io::stdin(),
                    stdout: tokio::io::stdout(),
                    stderr: tokio::io::stderr(),
                },
                resizes,
                &cancel,
            )
            .await
    };
    resize_watch.cancel();

    let outcome = outcome?;
    Ok(exit_code(outcome.exit_code))
}

async fn run_port_forward(
    controller: &TunnelController,
    request: PortForwardRequest,
    ports: &[PortMapping],
) -> Result<ExitCode> {
    let cancel = signal::shutdown_token();
    let mut session = controller.open_port_forward(request, ports, &cancel).await?;

    for failure in session.failures() {
        eprintln!("Could not forward {}: {}", failure.mapping, failure.error);
    }
    for bound in session.bound() {
        println!(
            "Forwarding from {} -> remote port {}",
            bound.local_addr, bound.mapping.remote
        );
    }
    println!("Press Ctrl+C to stop forwarding");

    let end = session.wait().await;
    info!("Port forward ended: {:?}", end);
    Ok(ExitCode::SUCCESS)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn print_status(status: &ClusterStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }
    println!("Cluster:     {}", status.cluster_id);
    println!("Status:      {}", status.status);
    println!(
        "Kubernetes:  {}",
        status.kubernetes_version.as_deref().unwrap_or("-")
    );
    println!(
        "Nodes:       {}/{} ready{}",
        status.nodes_ready,
        status.nodes_total,
        if status.is_healthy() { "" } else { " (degraded)" }
    );
    if let Some(message) = &status.message {
        println!("Message:     {}", message);
    }
    Ok(())
}

fn print_nodes(list: &NodeList, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(list)?);
        return Ok(());
    }
    if list.nodes.is_empty() {
        println!("No nodes found");
        return Ok(());
    }
    println!(
        "{:<32} {:<8} {:<20} {:<12} {:>6}",
        "NAME", "READY", "ROLES", "VERSION", "PODS"
    );
    for node in &list.nodes {
        let roles = if node.roles.is_empty() {
            "<none>".to_string()
        } else {
            node.roles.join(",")
        };
        println!(
            "{:<32} {:<8} {:<20} {:<12} {:>6}",
            node.name,
            if node.ready { "Ready" } else { "NotReady" },
            roles,
            node.kubelet_version.as_deref().unwrap_or("-"),
            node.pods.len()
        );
    }
    Ok(())
}
