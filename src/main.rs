use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use provision_config::ServerConfig;
use provision_device::{DeviceAdapter, ScriptedDevice};
use provision_flows::{InstallRequest, Target};
use provision_lro::{ManagerConfig, Operation, OperationManager};
use provision_service::{DeviceConnector, ProvisionService, SshConnector};

/// Provision - runs device provisioning flows as long-running operations
#[derive(Parser)]
#[command(name = "provision")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Default log filter when RUST_LOG is unset
  #[arg(long, global = true, default_value = "info")]
  log_level: String,

  /// Emit logs as JSON lines
  #[arg(long, global = true)]
  log_json: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the HTTP server
  Serve {
    /// Path to the config file (default: <config dir>/provision/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Device under test, overrides the config file
    #[arg(long)]
    dut_host: Option<String>,
  },

  /// Run one install request and print the finished operation
  Install {
    /// Path to the install request (JSON)
    #[arg(long)]
    request: PathBuf,

    /// Path to the config file (default: <config dir>/provision/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against a recording device instead of ssh and print its transcript
    #[arg(long)]
    dry_run: bool,

    /// Give up waiting after this many milliseconds (default: wait until done)
    #[arg(long)]
    wait_ms: Option<u64>,
  },
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();
  init_tracing(&cli.log_level, cli.log_json)?;

  let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
  match cli.command {
    Commands::Serve {
      config,
      listen,
      dut_host,
    } => {
      rt.block_on(serve(config.as_deref(), listen, dut_host))?;
      Ok(ExitCode::SUCCESS)
    }
    Commands::Install {
      request,
      config,
      dry_run,
      wait_ms,
    } => rt.block_on(install(&request, config.as_deref(), dry_run, wait_ms)),
  }
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
    .with_context(|| format!("invalid log level: {}", level))?;

  // stdout carries command output; logs go to stderr.
  if json {
    tracing_subscriber::registry()
      .with(env_filter)
      .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
      .init();
  } else {
    tracing_subscriber::registry()
      .with(env_filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init();
  }
  Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
  ServerConfig::load_or_default(path).context("failed to load config")
}

fn operation_manager(config: &ServerConfig) -> OperationManager {
  OperationManager::new(ManagerConfig {
    sweep_interval: config.operations.sweep_interval(),
    expiry: config.operations.expiry(),
  })
}

fn require_dut_host(config: &ServerConfig) -> Result<()> {
  if config.dut.host.trim().is_empty() {
    bail!("no device configured: set dut.host in the config file or pass --dut-host");
  }
  Ok(())
}

async fn serve(
  config_path: Option<&Path>,
  listen: Option<SocketAddr>,
  dut_host: Option<String>,
) -> Result<()> {
  let mut config = load_config(config_path)?;
  if let Some(listen) = listen {
    config.listen = listen;
  }
  if let Some(host) = dut_host {
    config.dut.host = host;
  }
  require_dut_host(&config)?;

  let service = Arc::new(
    ProvisionService::new(
      operation_manager(&config),
      Arc::new(SshConnector::from_config(&config)),
    )
    .with_flow_timeout(config.flow_timeout()),
  );

  let listener = tokio::net::TcpListener::bind(config.listen)
    .await
    .with_context(|| format!("failed to bind {}", config.listen))?;
  tracing::info!(dut = %config.dut.host, "provision_server_starting");

  provision_server::serve(listener, service, provision_server::shutdown_signal())
    .await
    .context("server failed")
}

async fn install(
  request_path: &Path,
  config_path: Option<&Path>,
  dry_run: bool,
  wait_ms: Option<u64>,
) -> Result<ExitCode> {
  let config = load_config(config_path)?;

  let content = tokio::fs::read_to_string(request_path)
    .await
    .with_context(|| format!("failed to read request file: {}", request_path.display()))?;
  let request: InstallRequest = serde_json::from_str(&content)
    .with_context(|| format!("failed to parse request file: {}", request_path.display()))?;

  let recorder = dry_run.then(|| dry_run_device(&request));
  let connector: Arc<dyn DeviceConnector> = match &recorder {
    Some(device) => {
      let device: Arc<dyn DeviceAdapter> = device.clone();
      Arc::new(move |_: &InstallRequest| device.clone())
    }
    None => {
      require_dut_host(&config)?;
      Arc::new(SshConnector::from_config(&config))
    }
  };

  let service =
    ProvisionService::new(operation_manager(&config), connector).with_flow_timeout(config.flow_timeout());

  let op = service.install(request).context("install request rejected")?;
  let op = service
    .operations()
    .wait_operation(&op.name, wait_ms.map(Duration::from_millis))
    .await
    .context("failed to wait for operation")?;

  if let Some(device) = &recorder {
    for line in device.calls() {
      eprintln!("{}", line);
    }
  }

  println!("{}", serde_json::to_string_pretty(&op)?);
  Ok(exit_code(&op))
}

fn exit_code(op: &Operation) -> ExitCode {
  if !op.done {
    tracing::warn!(operation = %op.name, "operation still running after wait");
    return ExitCode::FAILURE;
  }
  match op.error() {
    Some(_) => ExitCode::FAILURE,
    None => ExitCode::SUCCESS,
  }
}

/// A recording device with plausible answers for the queries flows make.
fn dry_run_device(request: &InstallRequest) -> Arc<ScriptedDevice> {
  let device = Arc::new(ScriptedDevice::new());
  device
    .respond("rootdev -s", "/dev/sda3")
    .respond("rootdev -s -d", "/dev/sda")
    .respond("mktemp -d", "/tmp/provision.dry-run")
    .respond("[ -e ", "1")
    .respond("status system-services", "system-services start/running")
    .respond("stat -c%s", "4096")
    .respond("tar -tf", "image.bin")
    .respond("cat /tmp/metadata.json", r#"{"content": {"version": "0.0.0.0"}}"#)
    .respond("zipinfo -1", "bootloader.img\nradio.img\nimage.zip");
  if let Target::Android(target) = &request.target {
    let adb = format!("adb -s {}", target.serial_number);
    device
      .respond(format!("{} get-state", adb), "device")
      .respond(format!("{} shell getprop sys.boot_completed", adb), "1")
      .respond(format!("{} install", adb), "Success");
  }
  device
}
