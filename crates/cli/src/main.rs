// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - CLI Client
// Command-line interface for managing SSH tunnels

mod config;
mod shell;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use ssh_tunnel_common::{
    AuthType, ConnectionConfig, DaemonConnection, DaemonSupervisor, HostProfile, ProcessLauncher,
    ProfileStore, RusshConnector, SessionConnector, SessionError, TunnelSpec, UnlockSecret,
};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "ssh-tunnel")]
#[command(about = "SSH Tunnel Manager CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new host profile
    Add {
        /// Profile name
        name: String,

        /// Remote SSH host
        #[arg(short = 'H', long)]
        remote_host: Option<String>,

        /// Remote SSH port
        #[arg(short = 'P', long)]
        remote_port: Option<u16>,

        /// SSH username
        #[arg(short = 'u', long)]
        user: Option<String>,

        /// Path to SSH private key
        #[arg(short = 'k', long)]
        key_path: Option<PathBuf>,

        /// Use password authentication
        #[arg(long, conflicts_with = "key_path")]
        password_auth: bool,

        /// Free-form description
        #[arg(short = 'd', long)]
        description: Option<String>,

        /// Skip interactive prompts (use provided args only)
        #[arg(short = 'y', long)]
        non_interactive: bool,

        /// Test the SSH connection before saving (asked interactively otherwise)
        #[arg(long)]
        test: bool,
    },

    /// List all host profiles
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show detailed information about a profile
    Info {
        /// Profile name
        name: String,
    },

    /// Delete a profile, stopping its tunnels first
    Delete {
        /// Profile name
        name: String,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Start tunnels through a profile's host (starts the daemon if needed)
    Start {
        /// Profile name
        name: String,

        /// Forwards as SOURCE_PORT:DESTINATION_HOST:DESTINATION_PORT
        /// (defaults to the profile's saved tunnels)
        forwards: Vec<String>,
    },

    /// Stop tunnels
    Stop {
        /// Profile name
        name: String,

        /// Forwards as SOURCE_PORT:DESTINATION_HOST:DESTINATION_PORT
        #[arg(required = true)]
        forwards: Vec<String>,
    },

    /// Manage a profile's saved tunnels
    Tunnel {
        #[command(subcommand)]
        action: TunnelCommands,
    },

    /// Show saved and active tunnels
    Status {
        /// Profile name (optional, shows all if not specified)
        name: Option<String>,
    },

    /// Stop every tunnel of a profile
    StopAll {
        /// Profile name
        name: String,
    },

    /// Open an interactive shell on a profile's host
    Shell {
        /// Profile name
        name: String,
    },
}

#[derive(Subcommand)]
enum TunnelCommands {
    /// Save a tunnel in the profile
    Add {
        /// Profile name
        name: String,

        /// Forward as SOURCE_PORT:DESTINATION_HOST:DESTINATION_PORT
        forward: String,
    },

    /// Remove a saved tunnel, stopping it if it is running
    Remove {
        /// Profile name
        name: String,

        /// Forward as SOURCE_PORT:DESTINATION_HOST:DESTINATION_PORT
        forward: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cli_config = CliConfig::load()?;
    let store = ProfileStore::open_default()?;

    match cli.command {
        Commands::Add {
            name,
            remote_host,
            remote_port,
            user,
            key_path,
            password_auth,
            description,
            non_interactive,
            test,
        } => {
            let options = AddOptions {
                remote_host,
                remote_port,
                user,
                key_path,
                password_auth,
                description,
                non_interactive,
                test,
            };
            add_profile(&store, &cli_config, name, options).await?;
        }
        Commands::List { json } => {
            list_profiles(&store, &cli_config, json).await?;
        }
        Commands::Info { name } => {
            show_profile_info(&store, &cli_config, &name).await?;
        }
        Commands::Delete { name, yes } => {
            delete_profile(&store, &cli_config, &name, yes).await?;
        }
        Commands::Start { name, forwards } => {
            start_tunnels(&store, &cli_config, &name, &forwards).await?;
        }
        Commands::Stop { name, forwards } => {
            stop_tunnels(&cli_config, &name, &forwards).await?;
        }
        Commands::Tunnel { action } => match action {
            TunnelCommands::Add { name, forward } => {
                save_tunnel(&store, &name, &forward)?;
            }
            TunnelCommands::Remove { name, forward } => {
                remove_saved_tunnel(&store, &cli_config, &name, &forward).await?;
            }
        },
        Commands::Status { name } => {
            show_status(&store, &cli_config, name.as_deref()).await?;
        }
        Commands::StopAll { name } => {
            stop_all_tunnels(&cli_config, &name).await?;
        }
        Commands::Shell { name } => {
            open_shell(&store, &cli_config, &name).await?;
            // The blocking stdin reader would otherwise hold the runtime open
            std::process::exit(0);
        }
    }

    Ok(())
}

/// Parse `SOURCE_PORT:DESTINATION_HOST:DESTINATION_PORT`; IPv6 hosts go in brackets
fn parse_forward(value: &str) -> Result<TunnelSpec> {
    let invalid = || {
        anyhow::anyhow!(
            "Invalid forward '{}': expected SOURCE_PORT:DESTINATION_HOST:DESTINATION_PORT",
            value
        )
    };

    let (source_port, rest) = value.split_once(':').ok_or_else(invalid)?;
    let (host, destination_port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok(TunnelSpec::parse(source_port, host, destination_port)?)
}

fn parse_forwards(values: &[String]) -> Result<Vec<TunnelSpec>> {
    values.iter().map(|v| parse_forward(v)).collect()
}

/// Explicit forwards, or the profile's saved tunnels when none are given
fn forwards_to_start(profile: &HostProfile, forwards: &[String]) -> Result<Vec<TunnelSpec>> {
    if !forwards.is_empty() {
        return parse_forwards(forwards);
    }
    if profile.tunnels.is_empty() {
        anyhow::bail!(
            "No forwards given and '{}' has no saved tunnels. Save one with: ssh-tunnel tunnel add {} 8080:localhost:80",
            profile.name(),
            profile.name()
        );
    }
    Ok(profile.tunnels.clone())
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn prompt_unlock_secret() -> Result<UnlockSecret> {
    let secret = Password::new()
        .with_prompt("Unlock secret (key passphrase / default password)")
        .allow_empty_password(true)
        .interact()
        .context("Failed to read unlock secret")?;
    Ok(Zeroizing::new(secret))
}

/// Connect to the daemon, starting it when it is not running
async fn connect_daemon(cli_config: &CliConfig) -> Result<DaemonConnection> {
    let launcher = ProcessLauncher::from_config(&cli_config.daemon_config)?;
    let supervisor = DaemonSupervisor::new(cli_config.daemon_config.clone(), launcher);

    if let Ok(connection) = supervisor.try_connect().await {
        return Ok(connection);
    }

    println!("{}", "Daemon is not running, starting it...".yellow());
    let secret = prompt_unlock_secret()?;

    let progress = spinner("Waiting for daemon...");
    let connection = supervisor.connect(|| Ok(secret.clone())).await;
    progress.finish_and_clear();

    Ok(connection?)
}

/// Connect only if a daemon is already running
async fn running_daemon(cli_config: &CliConfig) -> Option<DaemonConnection> {
    let launcher = ProcessLauncher::from_config(&cli_config.daemon_config).ok()?;
    DaemonSupervisor::new(cli_config.daemon_config.clone(), launcher)
        .try_connect()
        .await
        .ok()
}

async fn start_tunnels(
    store: &ProfileStore,
    cli_config: &CliConfig,
    name: &str,
    forwards: &[String],
) -> Result<()> {
    let profile = store.load_profile_by_name(name)?;
    let specs = forwards_to_start(&profile, forwards)?;

    println!(
        "{}",
        format!("Starting tunnels through '{}' ({})", name, profile.target())
            .green()
            .bold()
    );

    let daemon = connect_daemon(cli_config).await?;
    let mut failures = 0;

    for spec in specs {
        let progress = spinner(&format!("Starting {}", spec));
        let result = daemon.start_tunnel(name, spec.clone()).await;
        progress.finish_and_clear();

        match result {
            Ok(()) => println!(
                "{} {}",
                "✓".green().bold(),
                format!(
                    "Forwarding 127.0.0.1:{} → {}:{}",
                    spec.source_port, spec.destination_host, spec.destination_port
                )
                .green()
            ),
            Err(e) => {
                failures += 1;
                println!("{} {}: {}", "✗".red().bold(), spec, e.to_string().red());
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} tunnel(s) failed to start", failures);
    }
    Ok(())
}

async fn stop_tunnels(cli_config: &CliConfig, name: &str, forwards: &[String]) -> Result<()> {
    let specs = parse_forwards(forwards)?;

    let Some(daemon) = running_daemon(cli_config).await else {
        println!("{}", "Daemon is not running; no tunnels are active.".yellow());
        return Ok(());
    };

    for spec in specs {
        daemon.stop_tunnel(name, spec.clone()).await?;
        println!("{} Stopped {}", "✓".green().bold(), spec);
    }
    Ok(())
}

async fn stop_all_tunnels(cli_config: &CliConfig, name: &str) -> Result<()> {
    let Some(daemon) = running_daemon(cli_config).await else {
        println!("{}", "Daemon is not running; no tunnels are active.".yellow());
        return Ok(());
    };

    daemon.stop_profile(name).await?;
    println!("{}", format!("✓ All tunnels of '{}' stopped", name).green().bold());
    Ok(())
}

/// One line of tunnel status: a saved tunnel, an active one, or both
#[derive(Debug, PartialEq, Eq)]
struct TunnelRow {
    profile: String,
    spec: TunnelSpec,
    saved: bool,
    active: bool,
}

/// Saved tunnels in profile order marked active or not, followed by active
/// tunnels that were started ad hoc
fn tunnel_rows(
    profiles: &[HostProfile],
    active: &BTreeMap<String, Vec<TunnelSpec>>,
) -> Vec<TunnelRow> {
    let names: BTreeSet<&str> = profiles
        .iter()
        .map(HostProfile::name)
        .chain(active.keys().map(String::as_str))
        .collect();

    let mut rows = Vec::new();
    for name in names {
        let saved = profiles
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.tunnels.as_slice())
            .unwrap_or_default();
        let running = active.get(name).map(Vec::as_slice).unwrap_or_default();

        for spec in saved {
            rows.push(TunnelRow {
                profile: name.to_string(),
                spec: spec.clone(),
                saved: true,
                active: running.contains(spec),
            });
        }
        for spec in running.iter().filter(|spec| !saved.contains(spec)) {
            rows.push(TunnelRow {
                profile: name.to_string(),
                spec: spec.clone(),
                saved: false,
                active: true,
            });
        }
    }
    rows
}

async fn show_status(
    store: &ProfileStore,
    cli_config: &CliConfig,
    name: Option<&str>,
) -> Result<()> {
    let profiles: Vec<HostProfile> = match name {
        Some(name) => store.load_profile_by_name(name).ok().into_iter().collect(),
        None => store.load_all_profiles()?,
    };

    let daemon = running_daemon(cli_config).await;
    let active = match (&daemon, name) {
        (Some(daemon), Some(name)) => {
            let mut active = BTreeMap::new();
            let tunnels = daemon.list_tunnels(name).await?;
            if !tunnels.is_empty() {
                active.insert(name.to_string(), tunnels);
            }
            active
        }
        (Some(daemon), None) => daemon.list_all_tunnels().await?,
        (None, _) => BTreeMap::new(),
    };

    if daemon.is_none() {
        println!("{}", "Daemon is not running.".yellow());
    }

    let rows = tunnel_rows(&profiles, &active);
    if rows.is_empty() {
        println!("{}", "No saved or active tunnels.".yellow());
        return Ok(());
    }

    print_tunnels_table(&rows);
    Ok(())
}

fn print_tunnels_table(rows: &[TunnelRow]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Profile")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Local")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Destination")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Saved")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Status")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
    ]);

    for row in rows {
        let status = if row.active {
            Cell::new("● active").fg(Color::Green)
        } else {
            Cell::new("○ inactive").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&row.profile).fg(Color::Green),
            Cell::new(format!("127.0.0.1:{}", row.spec.source_port)),
            Cell::new(format!(
                "{}:{}",
                row.spec.destination_host, row.spec.destination_port
            )),
            Cell::new(if row.saved { "yes" } else { "no" }),
            status,
        ]);
    }

    let active = rows.iter().filter(|row| row.active).count();
    println!();
    println!("{}", table);
    println!();
    println!("{} active tunnel(s)", active.to_string().cyan());
    println!();
}

fn save_tunnel(store: &ProfileStore, name: &str, forward: &str) -> Result<()> {
    let mut profile = store.load_profile_by_name(name)?;
    let spec = parse_forward(forward)?;

    profile.add_tunnel(spec.clone())?;
    store.save_profile(&profile, true)?;

    println!("{} Saved {} in '{}'", "✓".green().bold(), spec, name);
    println!(
        "Start the saved tunnels with: {}",
        format!("ssh-tunnel start {}", name).yellow()
    );
    Ok(())
}

async fn remove_saved_tunnel(
    store: &ProfileStore,
    cli_config: &CliConfig,
    name: &str,
    forward: &str,
) -> Result<()> {
    let mut profile = store.load_profile_by_name(name)?;
    let spec = parse_forward(forward)?;

    if !profile.remove_tunnel(&spec) {
        anyhow::bail!("Tunnel {} is not saved in '{}'", spec, name);
    }

    if let Some(daemon) = running_daemon(cli_config).await {
        if let Err(e) = daemon.stop_tunnel(name, spec.clone()).await {
            println!(
                "{}",
                format!("⚠️  Failed to stop {}: {}", spec, e).yellow()
            );
        }
    }

    store.save_profile(&profile, true)?;
    println!("{} Removed {} from '{}'", "✓".green().bold(), spec, name);
    Ok(())
}

struct AddOptions {
    remote_host: Option<String>,
    remote_port: Option<u16>,
    user: Option<String>,
    key_path: Option<PathBuf>,
    password_auth: bool,
    description: Option<String>,
    non_interactive: bool,
    test: bool,
}

async fn add_profile(
    store: &ProfileStore,
    cli_config: &CliConfig,
    name: String,
    options: AddOptions,
) -> Result<()> {
    println!("{}", "Creating new SSH host profile".bold().green());
    println!();

    if store.profile_exists_by_name(&name) {
        anyhow::bail!(
            "A profile with the name '{}' already exists. Please choose a different name or delete the existing profile first.",
            name.yellow()
        );
    }

    let non_interactive = options.non_interactive;

    let remote_host = if let Some(host) = options.remote_host {
        host
    } else if non_interactive {
        anyhow::bail!("Remote host is required in non-interactive mode");
    } else {
        Input::new()
            .with_prompt("Remote SSH host (hostname or IP)")
            .interact_text()?
    };

    let remote_port = if let Some(port) = options.remote_port {
        port
    } else if non_interactive {
        22
    } else {
        Input::<u16>::new()
            .with_prompt("Remote SSH port")
            .default(22)
            .interact_text()?
    };

    let user = if let Some(u) = options.user {
        u
    } else if non_interactive {
        anyhow::bail!("Username is required in non-interactive mode");
    } else {
        Input::new().with_prompt("SSH username").interact_text()?
    };

    let (auth_type, key_path, password) = if let Some(path) = options.key_path {
        let path = expand_path(&path);
        validate_ssh_key(&path, non_interactive)?;
        (AuthType::Key, Some(path), None)
    } else if options.password_auth {
        (AuthType::Password, None, prompt_stored_password(non_interactive)?)
    } else if non_interactive {
        anyhow::bail!("Either --key-path or --password-auth is required in non-interactive mode");
    } else {
        let key_path_input: String = Input::new()
            .with_prompt("Path to SSH private key (or press Enter for password authentication)")
            .allow_empty(true)
            .interact_text()?;

        if key_path_input.trim().is_empty() {
            (AuthType::Password, None, prompt_stored_password(false)?)
        } else {
            let path = expand_path(Path::new(key_path_input.trim()));
            validate_ssh_key(&path, false)?;
            (AuthType::Key, Some(path), None)
        }
    };

    let connection = ConnectionConfig {
        host: remote_host,
        port: remote_port,
        user,
        auth_type,
        key_path,
        password,
    };

    let mut profile = HostProfile::new(name.clone(), connection);
    profile.metadata.description = options.description;
    profile.validate().context("Profile validation failed")?;

    let test = options.test
        || (!non_interactive
            && Confirm::new()
                .with_prompt("Test the connection now?")
                .default(true)
                .interact()?);
    if test {
        verify_connection(cli_config, &profile, non_interactive).await?;
    }

    let profile_path = store.save_profile(&profile, false)?;

    println!();
    println!("{}", "✓ Profile created successfully!".green().bold());
    println!("  Saved to: {}", profile_path.display().to_string().dimmed());
    println!();
    println!("{}", "Profile Summary:".bold());
    println!("  Name: {}", name.cyan());
    println!("  Remote: {}", profile.target());
    match &profile.connection.key_path {
        Some(kp) => println!("  Key: {}", kp.display()),
        None => println!("  Auth: Password"),
    }
    println!();
    println!(
        "Start a tunnel with: {}",
        format!("ssh-tunnel start {} 8080:localhost:80", name).yellow()
    );
    println!(
        "Or save one for later: {}",
        format!("ssh-tunnel tunnel add {} 8080:localhost:80", name).yellow()
    );

    Ok(())
}

/// Connect once, then hang up
async fn check_connection(
    connector: &dyn SessionConnector,
    profile: &HostProfile,
    secret: &UnlockSecret,
) -> Result<(), SessionError> {
    let session = connector.connect(profile, secret).await?;
    session.close().await;
    Ok(())
}

/// Test the new profile's connection. A failure aborts unless the user
/// chooses to save anyway.
async fn verify_connection(
    cli_config: &CliConfig,
    profile: &HostProfile,
    non_interactive: bool,
) -> Result<()> {
    let connector = RusshConnector::new(cli_config.shell.ssh_settings()?);
    let mut secret = if non_interactive {
        Zeroizing::new(String::new())
    } else {
        session_secret(profile)?
    };

    let progress = spinner(&format!("Testing connection to {}...", profile.target()));
    let mut result = check_connection(&connector, profile, &secret).await;
    progress.finish_and_clear();

    if !non_interactive && matches!(result, Err(SessionError::Key { .. })) {
        secret = prompt_passphrase()?;
        let progress = spinner(&format!("Testing connection to {}...", profile.target()));
        result = check_connection(&connector, profile, &secret).await;
        progress.finish_and_clear();
    }

    match result {
        Ok(()) => {
            println!("{}", "✓ Connection successful".green().bold());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗ Connection test failed:".red().bold(), e);
            if !non_interactive
                && Confirm::new()
                    .with_prompt("Save the profile anyway?")
                    .default(false)
                    .interact()?
            {
                return Ok(());
            }
            anyhow::bail!("Profile not saved: connection test failed");
        }
    }
}

/// Secret for a direct session: the password when it is not stored in the profile
fn session_secret(profile: &HostProfile) -> Result<UnlockSecret> {
    let needs_secret =
        profile.connection.auth_type == AuthType::Password && profile.connection.password.is_none();
    if !needs_secret {
        return Ok(Zeroizing::new(String::new()));
    }
    let password = Password::new()
        .with_prompt(format!("Password for {}", profile.target()))
        .interact()
        .context("Failed to read password input")?;
    Ok(Zeroizing::new(password))
}

fn prompt_passphrase() -> Result<UnlockSecret> {
    let passphrase = Password::new()
        .with_prompt("SSH key passphrase")
        .interact()
        .context("Failed to read passphrase")?;
    Ok(Zeroizing::new(passphrase))
}

/// Password auth either stores the password in the profile or falls back to
/// the daemon's unlock secret at connect time
fn prompt_stored_password(non_interactive: bool) -> Result<Option<String>> {
    if non_interactive {
        return Ok(None);
    }

    let store_password = Confirm::new()
        .with_prompt("Store the SSH password in the profile file? (otherwise the unlock secret is used)")
        .default(false)
        .interact()?;
    if !store_password {
        return Ok(None);
    }

    let password = Password::new()
        .with_prompt("SSH password")
        .interact()
        .context("Failed to read password input")?;
    Ok(Some(password))
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}

fn validate_ssh_key(key_path: &Path, non_interactive: bool) -> Result<()> {
    if !key_path.exists() {
        anyhow::bail!(
            "SSH key not found: {}\n  \
             Create a key with: ssh-keygen -t ed25519",
            key_path.display()
        );
    }

    if !key_path.is_file() {
        anyhow::bail!("SSH key path is not a file: {}", key_path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = fs::metadata(key_path)?.permissions().mode();

        // SSH keys should be 0600 or 0400
        if mode & 0o077 != 0 {
            println!(
                "{}",
                format!(
                    "⚠️  SSH key has insecure permissions: {:o}\n   \
                     Fix with: chmod 600 {}",
                    mode & 0o777,
                    key_path.display()
                )
                .yellow()
            );

            if non_interactive {
                anyhow::bail!("Aborted due to insecure key permissions");
            }
            if !Confirm::new()
                .with_prompt("Continue anyway?")
                .default(false)
                .interact()?
            {
                anyhow::bail!("Aborted due to insecure key permissions");
            }
        }
    }

    Ok(())
}

async fn list_profiles(store: &ProfileStore, cli_config: &CliConfig, json: bool) -> Result<()> {
    let profiles = store.load_all_profiles()?;

    if json {
        let redacted: Vec<HostProfile> = profiles
            .into_iter()
            .map(|mut profile| {
                profile.connection.password = None;
                profile
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&redacted)?);
        return Ok(());
    }

    if profiles.is_empty() {
        println!("{}", "No profiles found.".yellow());
        println!("Create one with: {}", "ssh-tunnel add <name>".cyan());
        return Ok(());
    }

    let active = match running_daemon(cli_config).await {
        Some(daemon) => daemon.list_all_tunnels().await.ok(),
        None => None,
    };

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Name")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Remote")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Auth")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Tunnels")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
    ]);

    for profile in &profiles {
        let auth = match profile.connection.auth_type {
            AuthType::Key => "key",
            AuthType::Password => "password",
        };
        let tunnels = match &active {
            Some(active) => active
                .get(profile.name())
                .map(|t| t.len())
                .unwrap_or(0)
                .to_string(),
            None => "-".to_string(),
        };

        table.add_row(vec![
            Cell::new(profile.name()).fg(Color::Green),
            Cell::new(profile.target()),
            Cell::new(auth),
            Cell::new(tunnels).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} profile(s) found", profiles.len().to_string().cyan());
    if active.is_none() {
        println!("{}", "Daemon is not running; tunnel counts unavailable.".dimmed());
    }
    println!();

    Ok(())
}

async fn show_profile_info(store: &ProfileStore, cli_config: &CliConfig, name: &str) -> Result<()> {
    let profile = store.load_profile_by_name(name)?;

    println!();
    println!("{}", format!("Profile: {}", profile.name()).bold().green());
    if let Some(desc) = &profile.metadata.description {
        println!("  Description: {}", desc);
    }

    println!();
    println!("{}", "  Connection:".bold());
    println!("    Remote: {}", profile.target());
    println!("    Auth: {:?}", profile.connection.auth_type);
    if let Some(key_path) = &profile.connection.key_path {
        println!("    Key: {}", key_path.display());
    }
    if profile.connection.auth_type == AuthType::Password {
        let source = if profile.connection.password.is_some() {
            "stored in profile"
        } else {
            "unlock secret"
        };
        println!("    Password: {}", source);
    }

    println!();
    println!("{}", "  Tunnels:".bold());
    let active = match running_daemon(cli_config).await {
        Some(daemon) => {
            let mut active = BTreeMap::new();
            active.insert(name.to_string(), daemon.list_tunnels(name).await?);
            Some(active)
        }
        None => None,
    };
    let rows = tunnel_rows(
        std::slice::from_ref(&profile),
        active.as_ref().unwrap_or(&BTreeMap::new()),
    );
    if rows.is_empty() {
        println!("    {}", "none".dimmed());
    }
    for row in &rows {
        let state = match (&active, row.active) {
            (None, _) => "daemon not running".dimmed(),
            (Some(_), true) => "active".green(),
            (Some(_), false) => "inactive".dimmed(),
        };
        let origin = if row.saved { "saved" } else { "ad hoc" };
        println!("    {}  {} ({})", row.spec, state, origin);
    }

    println!();
    println!(
        "  Created: {}",
        profile
            .metadata
            .created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!(
        "  Modified: {}",
        profile
            .metadata
            .modified_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();

    Ok(())
}

async fn delete_profile(
    store: &ProfileStore,
    cli_config: &CliConfig,
    name: &str,
    yes: bool,
) -> Result<()> {
    let profile = store.load_profile_by_name(name)?;

    if !yes
        && !Confirm::new()
            .with_prompt(format!("Delete profile '{}' ({})?", name, profile.target()))
            .default(false)
            .interact()?
    {
        println!("{}", "Aborted.".yellow());
        return Ok(());
    }

    // Best effort: a stopped daemon has nothing to tear down
    if let Some(daemon) = running_daemon(cli_config).await {
        if let Err(e) = daemon.stop_profile(name).await {
            println!(
                "{}",
                format!("⚠️  Failed to stop tunnels of '{}': {}", name, e).yellow()
            );
        }
    }

    let path = store.delete_profile_by_name(name)?;
    println!("{}", format!("✓ Profile '{}' deleted", name).green().bold());
    println!("  Removed: {}", path.display().to_string().dimmed());
    Ok(())
}

async fn open_shell(store: &ProfileStore, cli_config: &CliConfig, name: &str) -> Result<()> {
    let profile = store.load_profile_by_name(name)?;
    let settings = cli_config.shell.ssh_settings()?;

    let mut secret = session_secret(&profile)?;

    println!("{}", format!("Connecting to {}...", profile.target()).dimmed());
    let mut result = shell::run_shell(&profile, settings.clone(), &secret).await;

    // Encrypted key: ask for the passphrase once and retry
    if let Err(SessionError::Key { .. }) = &result {
        secret = prompt_passphrase()?;
        result = shell::run_shell(&profile, settings, &secret).await;
    }

    result.with_context(|| format!("Shell session to {} failed", profile.target()))?;
    println!();
    println!("{}", "Connection closed.".dimmed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward() {
        let spec = parse_forward("8080:10.0.0.5:80").unwrap();
        assert_eq!(spec, TunnelSpec::new(8080, "10.0.0.5", 80));

        let spec = parse_forward("5432:db.internal:5432").unwrap();
        assert_eq!(spec.destination_host, "db.internal");
    }

    #[test]
    fn test_parse_forward_bracketed_ipv6() {
        let spec = parse_forward("8443:[::1]:443").unwrap();
        assert_eq!(spec.destination_host, "::1");
        assert_eq!(spec.destination_port, 443);
    }

    #[test]
    fn test_parse_forward_rejects_bad_input() {
        assert!(parse_forward("8080").is_err());
        assert!(parse_forward("8080:host").is_err());

        let err = parse_forward("0:host:80").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Source port must be a number between 1 and 65535"
        );

        let err = parse_forward("8080:host:99999").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Destination port must be a number between 1 and 65535"
        );
    }

    fn saved_profile(name: &str, tunnels: &[TunnelSpec]) -> HostProfile {
        let mut profile = HostProfile::new(
            name,
            ConnectionConfig {
                host: format!("{}.example.com", name),
                port: 22,
                user: "deploy".to_string(),
                auth_type: AuthType::Password,
                key_path: None,
                password: Some("hunter2".to_string()),
            },
        );
        for spec in tunnels {
            profile.add_tunnel(spec.clone()).unwrap();
        }
        profile
    }

    #[test]
    fn test_start_defaults_to_saved_tunnels() {
        let web = TunnelSpec::new(8080, "10.0.0.5", 80);
        let profile = saved_profile("box1", &[web.clone()]);

        assert_eq!(forwards_to_start(&profile, &[]).unwrap(), vec![web]);
        assert_eq!(
            forwards_to_start(&profile, &["5432:db:5432".to_string()]).unwrap(),
            vec![TunnelSpec::new(5432, "db", 5432)]
        );

        let err = forwards_to_start(&saved_profile("bare", &[]), &[]).unwrap_err();
        assert!(err.to_string().contains("has no saved tunnels"));
    }

    #[test]
    fn test_tunnel_rows_mark_active_saved_tunnels() {
        let web = TunnelSpec::new(8080, "10.0.0.5", 80);
        let db = TunnelSpec::new(5432, "db", 5432);
        let adhoc = TunnelSpec::new(9000, "10.0.0.9", 9000);
        let profiles = vec![
            saved_profile("box1", &[web.clone(), db.clone()]),
            saved_profile("idle", &[]),
        ];
        let mut active = BTreeMap::new();
        active.insert("box1".to_string(), vec![db.clone(), adhoc.clone()]);
        active.insert("gone".to_string(), vec![web.clone()]);

        let rows = tunnel_rows(&profiles, &active);
        let row = |profile: &str, spec: &TunnelSpec, saved, active| TunnelRow {
            profile: profile.to_string(),
            spec: spec.clone(),
            saved,
            active,
        };
        assert_eq!(
            rows,
            vec![
                row("box1", &web, true, false),
                row("box1", &db, true, true),
                row("box1", &adhoc, false, true),
                row("gone", &web, false, true),
            ]
        );

        // Daemon not running: every saved tunnel is inactive
        let rows = tunnel_rows(&profiles, &BTreeMap::new());
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.saved && !row.active));
    }

    mod connection_test {
        use super::*;
        use async_trait::async_trait;
        use ssh_tunnel_common::remote::{BoxedStream, RemoteTerminal, TerminalRequest};
        use ssh_tunnel_common::RemoteSession;
        use std::net::SocketAddr;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingSession {
            closes: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl RemoteSession for CountingSession {
            async fn open_forward(
                &self,
                _host: &str,
                _port: u16,
                _originator: SocketAddr,
            ) -> Result<BoxedStream, SessionError> {
                Err(SessionError::Closed)
            }

            async fn open_terminal(
                &self,
                _request: &TerminalRequest,
            ) -> Result<RemoteTerminal, SessionError> {
                Err(SessionError::Closed)
            }

            async fn close(&self) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        struct StubConnector {
            refuse: bool,
            closes: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl SessionConnector for StubConnector {
            async fn connect(
                &self,
                profile: &HostProfile,
                _secret: &UnlockSecret,
            ) -> Result<Arc<dyn RemoteSession>, SessionError> {
                if self.refuse {
                    return Err(SessionError::Auth(format!("{} refused", profile.target())));
                }
                Ok(Arc::new(CountingSession {
                    closes: self.closes.clone(),
                }))
            }
        }

        #[tokio::test]
        async fn test_check_connection_hangs_up() {
            let closes = Arc::new(AtomicUsize::new(0));
            let connector = StubConnector {
                refuse: false,
                closes: closes.clone(),
            };
            let secret = Zeroizing::new(String::new());

            check_connection(&connector, &saved_profile("box1", &[]), &secret)
                .await
                .unwrap();
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_check_connection_reports_failure() {
            let connector = StubConnector {
                refuse: true,
                closes: Arc::new(AtomicUsize::new(0)),
            };
            let secret = Zeroizing::new(String::new());

            let err = check_connection(&connector, &saved_profile("box1", &[]), &secret)
                .await
                .unwrap_err();
            assert_eq!(
                err.to_string(),
                "Authentication failed: deploy@box1.example.com:22 refused"
            );
        }
    }
}
