//! devhost: one editor backend per workspace folder, behind a single port.
//!
//! Every folder opened through `?folder=<path>` gets its own backend process
//! listening on a unix socket; the browser session sticks to it through a
//! cookie. The listening port speaks TLS and plain HTTP (redirected to
//! HTTPS) and tunnels `CONNECT` requests.
//!
//! Usage:
//!   devhost                                      # https://dev.localhost:12345
//!   devhost --no-tls --port 8080                 # Plain HTTP
//!   devhost --backend my-editor --backend-arg=--listen --backend-arg={socket} --backend-arg={folder}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use devhost_protocol::PersistedSnapshot;
use devhost_server::{ServerConfig, build_app};
use devhost_transport::{TlsConfig, TransportConfig, TransportServer, TunnelTarget};
use devhost_workspace::{
    CommandLauncher, ProbePolicy, RegistryConfig, StateStore, WorkspaceRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "devhost", about = "devhost: per-folder editor backends behind one port")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, env = "PORT", default_value = "12345")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Backend program started once per workspace
    #[arg(long, default_value = "code-server")]
    backend: String,

    /// Backend argument template, repeatable. Placeholders: {socket}, {folder},
    /// {key}, {control}. Defaults to `--socket {socket} {folder}`.
    #[arg(long = "backend-arg", allow_hyphen_values = true)]
    backend_args: Vec<String>,

    /// Directory for backend sockets (defaults to the system temp dir)
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Registry snapshot file (defaults to <temp>/devhost-state.json)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// First readiness probe backoff, in milliseconds
    #[arg(long, default_value = "100")]
    probe_initial_ms: u64,

    /// How long a request waits for a new backend, in milliseconds
    #[arg(long, default_value = "5000")]
    probe_deadline_ms: u64,

    /// Host (port ignored) served by the workspace proxy; empty sends every
    /// request there
    #[arg(long, default_value = "dev.localhost")]
    editor_host: String,

    /// Upstream for non-API paths on other hosts
    #[arg(long)]
    frontend_url: Option<String>,

    /// Disable TLS (for development/debugging)
    #[arg(long)]
    no_tls: bool,

    /// Path to custom TLS certificate (PEM)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to custom TLS private key (PEM)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Where CONNECT tunnels go: `loopback` (this listener) or `host:port`
    #[arg(long, default_value = "loopback")]
    tunnel_target: TunnelTarget,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.devhost/logs/devhost.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn devhost_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".devhost")
}

fn init_logging(verbose: bool, log_file: Option<&str>) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let Some(log_file) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file == "DEFAULT" {
        devhost_dir().join("logs/devhost.log")
    } else {
        PathBuf::from(log_file)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

/// SHA-256 fingerprint of the first certificate in a PEM file, as `sha256:<hex>`.
fn cert_fingerprint_from_pem(cert_path: &Path) -> Option<String> {
    use base64::Engine;
    use sha2::{Digest, Sha256};

    let pem = std::fs::read_to_string(cert_path).ok()?;
    let b64: String = pem
        .lines()
        .skip_while(|l| !l.starts_with("-----BEGIN CERTIFICATE"))
        .skip(1)
        .take_while(|l| !l.starts_with("-----END"))
        .collect();
    let der = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    Some(format!("sha256:{}", hex::encode(Sha256::digest(&der))))
}

/// Ensure a self-signed certificate and key exist in `tls_dir`, generating
/// them if needed. Returns the paths and the certificate fingerprint.
fn ensure_tls_certs(tls_dir: &Path, editor_host: Option<&str>) -> anyhow::Result<(TlsConfig, String)> {
    let cert_path = tls_dir.join("cert.pem");
    let key_path = tls_dir.join("key.pem");

    if cert_path.exists() && key_path.exists() {
        let fingerprint = cert_fingerprint_from_pem(&cert_path).unwrap_or_default();
        return Ok((TlsConfig { cert_path, key_path }, fingerprint));
    }

    std::fs::create_dir_all(tls_dir)
        .with_context(|| format!("creating {}", tls_dir.display()))?;

    let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string(), "::1".to_string()];
    let extra = editor_host
        .map(str::to_string)
        .into_iter()
        .chain(hostname::get().ok().map(|h| h.to_string_lossy().into_owned()));
    for name in extra {
        if !sans.contains(&name) {
            sans.push(name);
        }
    }

    let mut subject_alt_names = Vec::with_capacity(sans.len());
    for san in &sans {
        subject_alt_names.push(match san.parse::<std::net::IpAddr>() {
            Ok(ip) => rcgen::SanType::IpAddress(ip),
            Err(_) => rcgen::SanType::DnsName(san.clone().try_into()?),
        });
    }

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())?;
    params.subject_alt_names = subject_alt_names;
    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let fingerprint = {
        use sha2::{Digest, Sha256};
        format!("sha256:{}", hex::encode(Sha256::digest(cert.der())))
    };

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok((TlsConfig { cert_path, key_path }, fingerprint))
}

fn resolve_tls(cli: &Cli, editor_host: Option<&str>) -> (Option<TlsConfig>, Option<String>) {
    if cli.no_tls {
        return (None, None);
    }
    if let (Some(cert), Some(key)) = (&cli.tls_cert, &cli.tls_key) {
        let tls = TlsConfig {
            cert_path: cert.clone(),
            key_path: key.clone(),
        };
        return (Some(tls), cert_fingerprint_from_pem(cert));
    }
    match ensure_tls_certs(&devhost_dir().join("tls"), editor_host) {
        Ok((tls, fingerprint)) => (Some(tls), Some(fingerprint).filter(|f| !f.is_empty())),
        Err(e) => {
            warn!("Failed to generate TLS certs, falling back to plain HTTP: {e:#}");
            (None, None)
        }
    }
}

fn load_snapshot(store: &StateStore) -> PersistedSnapshot {
    match store.load() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Ignoring unreadable state file {}: {e}", store.path().display());
            PersistedSnapshot::empty()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let editor_host = Some(cli.editor_host.clone()).filter(|h| !h.is_empty());

    let launcher = if cli.backend_args.is_empty() {
        CommandLauncher::new(cli.backend.clone(), CommandLauncher::code_server().args().to_vec())
    } else {
        CommandLauncher::new(cli.backend.clone(), cli.backend_args.clone())
    };
    let backend = launcher.program().to_string();

    let store = StateStore::new(cli.state_file.clone().unwrap_or_else(StateStore::default_path));
    let registry = WorkspaceRegistry::new(
        RegistryConfig {
            socket_dir: cli.socket_dir.clone().unwrap_or_else(std::env::temp_dir),
            probe: ProbePolicy {
                initial_backoff: Duration::from_millis(cli.probe_initial_ms),
                deadline: Duration::from_millis(cli.probe_deadline_ms),
            },
            ..RegistryConfig::default()
        },
        Arc::new(launcher),
        store.clone(),
    );

    let snapshot = load_snapshot(&store);
    let report = registry
        .reconcile(snapshot)
        .await
        .context("reconciling persisted workspaces")?;
    for (key, reason) in &report.discarded {
        info!("Dropped persisted workspace {}: {reason}", key.to_path().display());
    }

    let (tls, fingerprint) = resolve_tls(&cli, editor_host.as_deref());
    let scheme = if tls.is_some() { "https" } else { "http" };
    let public_host = editor_host.clone().unwrap_or_else(|| cli.hostname.clone());

    let server_config = ServerConfig {
        editor_host: editor_host.clone(),
        frontend_url: cli.frontend_url.clone(),
        public_origin: format!("{scheme}://{public_host}:{}", cli.port),
        secure_cookies: tls.is_some(),
        home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
    };

    let transport_config = TransportConfig {
        hostname: cli.hostname.clone(),
        port: cli.port,
        tls: tls.clone(),
        tunnel_target: cli.tunnel_target.clone(),
        ..TransportConfig::default()
    };
    let mut transport = TransportServer::start(transport_config, build_app(registry.clone(), server_config))
        .await
        .context("starting listener")?;
    let port = transport.port();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                           devhost                            ║");
    println!("║               one editor backend per workspace               ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Binding:    {}:{port}", cli.hostname);
    println!("  Backend:    {backend}");
    println!("  State:      {}", store.path().display());
    println!("  Restored:   {} workspace(s)", report.admitted.len());
    match &tls {
        Some(tls) => {
            println!("  TLS:        enabled (cert: {})", tls.cert_path.display());
            if let Some(fingerprint) = &fingerprint {
                println!("              {fingerprint}");
            }
        }
        None => println!("  TLS:        disabled"),
    }
    println!("  Tunnels:    {}", cli.tunnel_target);
    println!();
    println!("  Open a workspace:");
    println!("    {scheme}://{public_host}:{port}/?folder=/path/to/project");
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;

    println!();
    println!("  Shutting down...");
    transport.stop().await;
    if let Err(e) = registry.persist().await {
        warn!("Failed to save final state: {e}");
    }
    info!("Stopped; backends keep running and are re-adopted on next start");
    println!("  Server stopped.");
    Ok(())
}
