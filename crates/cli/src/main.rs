use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colony_apply::Applier;
use colony_kubehub::{DiscoveryMapper, KubeStore, ResourceStore};
use colony_provision::{BootDevice, DeploymentTarget, ProvisionConfig, ProvisionReport, ProvisionRequest, Provisioner};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "colonyctl", version, about = "Colony bare-metal provisioning CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace holding credentials, machines, jobs, hardware and workflows
    #[arg(long = "ns", global = true, env = "COLONY_NAMESPACE")]
    namespace: Option<String>,

    /// Kubeconfig file (default: KUBECONFIG, then ~/.kube/config, then in-cluster)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long = "log-json", global = true, action = ArgAction::SetTrue)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served resource kinds (incl. CRDs)
    Discover,
    /// Create or update every document in the given manifest files
    Apply {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
    },
    /// Wait for Deployments matching a label selector to be ready
    WaitDeployment {
        /// Label selector, e.g. "app=tink-server"; repeat to wait for several in order
        #[arg(short = 'l', long = "selector", required = true)]
        selectors: Vec<String>,
        #[arg(long = "timeout", default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Wait until the API server answers
    WaitApi {
        #[arg(long = "timeout", default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Register BMC credentials for a host and wait until it is contactable
    AddIpmi {
        #[arg(long = "ip")]
        ip: String,
        #[arg(long = "username", default_value = "admin")]
        username: String,
        #[arg(long = "password", env = "COLONY_IPMI_PASSWORD", hide_env_values = true)]
        password: String,
        /// Skip TLS verification of the BMC
        #[arg(long = "insecure", default_value_t = true, action = ArgAction::Set)]
        insecure: bool,
        /// Provision the host right after registering it
        #[arg(long = "auto-discover", action = ArgAction::SetTrue)]
        auto_discover: bool,
        #[command(flatten)]
        provision: ProvisionArgs,
    },
    /// Discover and provision a registered host
    Provision {
        #[arg(long = "ip")]
        ip: String,
        #[command(flatten)]
        provision: ProvisionArgs,
    },
    /// Power-cycle the machine behind a hardware record
    Reboot {
        #[command(flatten)]
        target: PowerArgs,
    },
    /// Wipe a host's disks and stop it from network booting
    Deprovision {
        #[command(flatten)]
        target: PowerArgs,
    },
    /// List hardware records
    Assets,
}

#[derive(clap::Args, Debug)]
struct ProvisionArgs {
    /// Workflow template (default: COLONY_PROVISION_TEMPLATE or ubuntu-jammy)
    #[arg(long = "template")]
    template: Option<String>,
    /// Boot device for the final power cycle
    #[arg(long = "boot", default_value = "disk", value_parser = BootDevice::from_str)]
    boot: BootDevice,
    #[arg(long = "efi-boot", default_value_t = true, action = ArgAction::Set)]
    efi_boot: bool,
}

#[derive(clap::Args, Debug)]
struct PowerArgs {
    #[arg(long = "hardware-id")]
    hardware_id: String,
    #[arg(long = "boot-device", default_value = "pxe", value_parser = BootDevice::from_str)]
    boot_device: BootDevice,
    #[arg(long = "efi-boot", alias = "efiBoot", default_value_t = true, action = ArgAction::Set)]
    efi_boot: bool,
}

fn init_tracing(json: bool) {
    let env = std::env::var("COLONY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("COLONY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid COLONY_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            kube::Client::try_from(cfg).context("building kube client")
        }
        None => kube::Client::try_default().await.context("loading default kube config"),
    }
}

/// Token cancelled on Ctrl-C so long waits stop promptly.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            trigger.cancel();
        }
    });
    token
}

fn print_report(output: Output, what: &str, report: &ProvisionReport) -> Result<()> {
    match output {
        Output::Human => {
            println!("{} {} (host {}, hardware {})", what, report.stage, report.host, report.hardware);
            println!("run:      {}", report.run_id);
            println!("workflow: {}", report.workflow);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let client = connect(cli.kubeconfig.as_deref()).await?;
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client));
    let mut config = ProvisionConfig::from_env();
    if let Some(ns) = &cli.namespace {
        config.namespace = ns.clone();
    }
    let cancel = interrupt_token();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let mut resources = store.discover().await.context("discovering served resources")?;
            resources.sort_by(|a, b| a.gvk_key().cmp(&b.gvk_key()));
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.api_version(), r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Apply { files } => {
            let mut texts = Vec::with_capacity(files.len());
            for f in &files {
                texts.push(std::fs::read_to_string(f).with_context(|| format!("reading {}", f.display()))?);
            }
            info!(files = files.len(), ns = %config.namespace, "apply invoked");
            let mapper = Arc::new(DiscoveryMapper::new(store.clone()));
            let applier = Applier::new(store, mapper).with_default_namespace(config.namespace.clone());
            let applied = applier.apply_all(&texts).await?;
            match cli.output {
                Output::Human => {
                    for a in &applied {
                        let ns = a.namespace.as_deref().map(|n| format!("{}/", n)).unwrap_or_default();
                        println!("{} {}{} {:?}", a.kind, ns, a.name, a.outcome);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&applied)?),
            }
        }
        Commands::WaitDeployment { selectors, timeout_secs } => {
            let timeout = Some(Duration::from_secs(timeout_secs));
            let targets: Vec<_> = selectors
                .into_iter()
                .map(|selector| DeploymentTarget { namespace: config.namespace.clone(), selector, timeout })
                .collect();
            let provisioner = Provisioner::new(store, config);
            provisioner.wait_for_deployments(&targets, &cancel).await?;
            println!("{} deployment selector(s) ready", targets.len());
        }
        Commands::WaitApi { timeout_secs } => {
            let provisioner = Provisioner::new(store, config);
            let version = provisioner.wait_for_api(Duration::from_secs(timeout_secs), &cancel).await?;
            println!("API server ready ({})", version);
        }
        Commands::AddIpmi { ip, username, password, insecure, auto_discover, provision } => {
            let provisioner = Provisioner::new(store, config);
            let machine = provisioner.register(&ip, &username, &password, insecure, &cancel).await?;
            if matches!(cli.output, Output::Human) {
                println!("machine {} contactable", kube::ResourceExt::name_any(&machine));
            }
            if auto_discover {
                let req = ProvisionRequest { host: ip, template: provision.template, boot: provision.boot, efi_boot: provision.efi_boot };
                let report = provisioner.provision(&req, &cancel).await?;
                print_report(cli.output, "provisioned", &report)?;
            }
        }
        Commands::Provision { ip, provision } => {
            let provisioner = Provisioner::new(store, config);
            let req = ProvisionRequest { host: ip, template: provision.template, boot: provision.boot, efi_boot: provision.efi_boot };
            let report = provisioner.provision(&req, &cancel).await?;
            print_report(cli.output, "provisioned", &report)?;
        }
        Commands::Reboot { target } => {
            let provisioner = Provisioner::new(store, config);
            let job = provisioner.reboot(&target.hardware_id, target.boot_device, target.efi_boot, &cancel).await?;
            println!("power job {} completed", kube::ResourceExt::name_any(&job));
        }
        Commands::Deprovision { target } => {
            let provisioner = Provisioner::new(store, config);
            let report = provisioner.deprovision(&target.hardware_id, target.boot_device, target.efi_boot, &cancel).await?;
            print_report(cli.output, "deprovisioned", &report)?;
        }
        Commands::Assets => {
            let provisioner = Provisioner::new(store, config);
            let rows = provisioner.list_hardware().await?;
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<20} {:<16} {:<18} STATUS", "NAME", "HOSTNAME", "IP", "MAC");
                    for r in rows {
                        println!("{:<24} {:<20} {:<16} {:<18} {}", r.name, r.hostname, r.ip, r.mac, r.state);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    init_metrics();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
