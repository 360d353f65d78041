//! appdeploy CLI - deploy web applications behind nginx and systemd

use anyhow::{Context, Result};
use appdeploy_cert::DEFAULT_VALIDITY_DAYS;
use appdeploy_cli::args::{parse_bind_address, parse_env_pair, parse_name, parse_port};
use appdeploy_cli::config::{ConfigManager, ConfigSource, SYSTEM_CONFIG};
use appdeploy_lib::{AppState, AppStatus, Deployer, DeploymentRequest, DeploymentState};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "appdeploy")]
#[command(about = "Deploy web applications behind nginx and systemd", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (overrides $APPDEPLOY_CONFIG and the system and user files)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy or redeploy an application
    Deploy {
        /// Application name (letters, digits, '-' and '_')
        #[arg(value_parser = parse_name)]
        name: String,

        /// Directory holding the published application
        #[arg(short, long)]
        source: PathBuf,

        /// Port the application listens on (1024-65535)
        #[arg(short, long, value_parser = parse_port)]
        port: u16,

        /// Serve the application under a path prefix instead of the site root
        #[arg(long)]
        subdirectory: Option<String>,

        /// Address the application binds to
        #[arg(long, value_parser = parse_bind_address)]
        bind: Option<IpAddr>,

        /// Terminate TLS in the application itself
        #[arg(long)]
        tls: bool,

        /// Registered certificate used with --tls
        #[arg(long)]
        certificate: Option<String>,

        /// Executable to run when it cannot be discovered
        #[arg(long)]
        executable: Option<String>,

        /// Proxy site name (defaults to the application name)
        #[arg(long)]
        site: Option<String>,

        /// Extra environment variable for the application (KEY=VALUE)
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Print the deployment report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List deployed applications
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show the status of one application
    Status {
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// Restart an application and wait for it to listen again
    Restart { name: String },

    /// Back up and remove an application with its unit and route
    Remove { name: String },

    /// Show recent log lines
    Logs {
        name: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
    },

    /// Manage TLS certificates
    #[command(subcommand)]
    Cert(CertCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum CertCommands {
    /// Generate and register a self-signed certificate
    Create {
        name: String,

        /// Domain the certificate is issued for
        #[arg(short, long)]
        domain: String,

        /// Validity in days
        #[arg(long, default_value_t = DEFAULT_VALIDITY_DAYS)]
        days: u32,
    },

    /// Register an existing PEM certificate and key
    Import {
        name: String,

        #[arg(long)]
        cert: PathBuf,

        #[arg(long)]
        key: PathBuf,

        #[arg(short, long)]
        domain: String,
    },

    /// List registered certificates (expired ones are swept)
    List {
        #[arg(long)]
        json: bool,
    },

    /// Unregister a certificate and delete its files
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a commented configuration template
    Init {
        /// Target file
        #[arg(long, default_value = SYSTEM_CONFIG)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let source = ConfigManager::locate(cli.config.as_deref());

    match cli.command {
        Commands::Config(command) => handle_config_command(command, &source),
        command => {
            let config = ConfigManager::load_from(&source)?;
            debug!("Using configuration from {}", source);
            let deployer = Deployer::with_system_services(config);
            match command {
                Commands::Cert(command) => handle_cert_command(&deployer, command),
                command => handle_app_command(&deployer, command).await,
            }
        }
    }
}

async fn handle_app_command(deployer: &Deployer, command: Commands) -> Result<()> {
    match command {
        Commands::Deploy {
            name,
            source,
            port,
            subdirectory,
            bind,
            tls,
            certificate,
            executable,
            site,
            env,
            json,
        } => {
            let request = build_request(
                name,
                source,
                port,
                subdirectory,
                bind,
                tls,
                certificate,
                executable,
                site,
                env,
            );
            deploy(deployer, request, json).await
        }
        Commands::List { json } => {
            let apps = deployer.status_query().list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&apps)?);
            } else if apps.is_empty() {
                println!("No applications deployed");
            } else {
                for app in &apps {
                    println!("{}", summary_line(app));
                }
            }
            Ok(())
        }
        Commands::Status { name, json } => {
            let status = deployer
                .status_query()
                .status(&name)
                .await
                .context(format!("Failed to read status of '{}'", name))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        Commands::Restart { name } => {
            let verified = deployer
                .restart(&name)
                .await
                .context(format!("Failed to restart '{}'", name))?;
            if verified {
                println!("✅ Restarted {}", name);
            } else {
                println!(
                    "⚠️  Restarted {} but it is not accepting connections yet",
                    name
                );
            }
            Ok(())
        }
        Commands::Remove { name } => {
            let report = deployer
                .remove(&name)
                .await
                .context(format!("Failed to remove '{}'", name))?;
            if let Some(backup) = &report.backup {
                println!("📦 Backup: {}", backup.display());
            }
            if report.is_complete() {
                println!("✅ Removed {}", name);
                Ok(())
            } else {
                for failure in &report.failures {
                    println!("❌ {}", failure);
                }
                anyhow::bail!(
                    "'{}' was only partially removed ({} steps failed)",
                    name,
                    report.failures.len()
                )
            }
        }
        Commands::Logs { name, lines } => {
            let output = deployer
                .logs(&name, lines)
                .await
                .context(format!("Failed to read logs of '{}'", name))?;
            print!("{}", output);
            Ok(())
        }
        Commands::Cert(_) | Commands::Config(_) => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    name: String,
    source: PathBuf,
    port: u16,
    subdirectory: Option<String>,
    bind: Option<IpAddr>,
    tls: bool,
    certificate: Option<String>,
    executable: Option<String>,
    site: Option<String>,
    env: Vec<(String, String)>,
) -> DeploymentRequest {
    let mut request = DeploymentRequest::new(name, source, port);
    if let Some(prefix) = subdirectory {
        request = request.with_subdirectory(prefix);
    }
    if let Some(bind) = bind {
        request = request.with_bind_address(bind);
    }
    // Validation rejects --tls without a certificate and a certificate
    // without --tls, so both are passed through as given
    request.use_tls_direct = tls;
    request.certificate = certificate;
    if let Some(executable) = executable {
        request = request.with_executable(executable);
    }
    if let Some(site) = site {
        request = request.with_site_name(site);
    }
    for (key, value) in env {
        request = request.with_environment(key, value);
    }
    request
}

async fn deploy(deployer: &Deployer, request: DeploymentRequest, json: bool) -> Result<()> {
    let name = request.name.clone();
    match deployer.deploy(request).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            if let Some(backup) = &report.backup {
                println!("📦 Backup: {}", backup.display());
            }
            for warning in &report.warnings {
                println!("⚠️  {}", warning);
            }
            if report.final_state() == DeploymentState::Verified {
                println!("✅ Deployed {}", name);
            } else {
                println!("⚠️  Deployed {} (started, not verified)", name);
            }
            println!("   Listening: {}", report.url);
            println!("   Route:     {}", report.route);
            Ok(())
        }
        Err(failure) => {
            if !failure.is_validation() {
                println!("❌ Reached: {}", format_states(&failure.states));
                if let Some(backup) = &failure.backup {
                    println!("   Previous deployment backed up to {}", backup.display());
                }
            }
            Err(failure).context(format!("Failed to deploy '{}'", name))
        }
    }
}

fn handle_cert_command(deployer: &Deployer, command: CertCommands) -> Result<()> {
    let registry = deployer.registry();
    match command {
        CertCommands::Create { name, domain, days } => {
            let entry = registry
                .create_self_signed(&name, &domain, days)
                .context(format!("Failed to create certificate '{}'", name))?;
            println!("✅ Created self-signed certificate {} for {}", name, domain);
            println!("   Certificate: {}", entry.certificate_path.display());
            println!("   Key:         {}", entry.key_path.display());
            Ok(())
        }
        CertCommands::Import {
            name,
            cert,
            key,
            domain,
        } => {
            let entry = registry
                .import(&name, &cert, &key, &domain)
                .context(format!("Failed to import certificate '{}'", name))?;
            println!("✅ Imported certificate {} for {}", name, domain);
            println!("   Certificate: {}", entry.certificate_path.display());
            Ok(())
        }
        CertCommands::List { json } => {
            let entries = registry.list().context("Failed to read certificate registry")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("No certificates registered");
                return Ok(());
            }
            let now = Utc::now();
            for entry in &entries {
                let expiry = entry
                    .days_until_expiry(now)
                    .map(|days| format!("expires in {} days", days))
                    .unwrap_or_else(|| "expiry unknown".to_string());
                println!("{}  {}  ({})", entry.name, entry.domain, expiry);
            }
            Ok(())
        }
        CertCommands::Remove { name } => {
            let users = deployer.certificate_users(&name)?;
            if !users.is_empty() {
                println!(
                    "⚠️  Certificate {} is still used by: {}",
                    name,
                    users.join(", ")
                );
            }
            registry
                .remove(&name)
                .context(format!("Failed to remove certificate '{}'", name))?;
            println!("✅ Removed certificate {}", name);
            Ok(())
        }
    }
}

fn handle_config_command(command: ConfigCommands, source: &ConfigSource) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = ConfigManager::load_from(source)?;
            println!("# Source: {}", source);
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        ConfigCommands::Init { path, force } => {
            ConfigManager::write_template(&path, force)?;
            info!("Wrote configuration template to {}", path.display());
            println!("✅ Wrote {}", path.display());
            Ok(())
        }
    }
}

fn print_status(status: &AppStatus) {
    let icon = match status.state {
        AppState::Running => "✅",
        AppState::Stopped => "⏹️ ",
        AppState::Unconfigured => "⚠️ ",
    };
    println!("{} {} ({})", icon, status.name, status.state);
    if let Some(unit_status) = &status.unit_status {
        println!("   Service: {}", unit_status);
    }
    if let Some(port) = status.port {
        println!("   Port:    {}", port);
    }
    if let Some(url) = &status.url {
        println!("   URL:     {}", url);
    }
    if let Some(route) = &status.route {
        println!("   Route:   {}", route);
    }
    if let Some(mode) = &status.mode {
        println!("   Mode:    {}", mode);
    }
    if let Some(certificate) = &status.certificate {
        println!("   TLS:     {}", certificate);
    }
}

fn summary_line(status: &AppStatus) -> String {
    let port = status
        .port
        .map(|port| port.to_string())
        .unwrap_or_else(|| "-".to_string());
    let route = status.route.as_deref().unwrap_or("-");
    format!(
        "{:<24} {:<13} {:>5}  {}",
        status.name,
        status.state.to_string(),
        port,
        route
    )
}

fn format_states(states: &[DeploymentState]) -> String {
    states
        .iter()
        .map(|state| state.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
