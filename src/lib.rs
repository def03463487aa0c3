pub mod config;
pub mod console;
pub mod flame;
pub mod launch;
pub mod remote;
pub mod setup;
pub mod workflow;

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use colored::{ColoredString, Colorize};
use dialoguer::Password;
use dialoguer::theme::ColorfulTheme;
use tracing_subscriber::EnvFilter;

use config::{AppContext, HostConfig};
use console::{Console, TerminalConsole};
use remote::{SessionManager, read_public_key};
use setup::HostSetup;
use workflow::{ArchiveJob, ArchiveWorkflow, JobStatus, SizeEstimate, WorkspaceRef};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "farc",
    version,
    about = "Archive Flame projects across remote render hosts over SSH"
)]
pub struct Cli {
    /// Config directory (defaults to the platform config dir)
    #[arg(long, global = true, env = "FARC_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage configured hosts
    Hosts {
        #[command(subcommand)]
        action: HostsCommand,
    },
    /// Generate the application key pair if it does not exist yet
    Keygen,
    /// List projects and workspaces on every enabled host
    List {
        /// Print the workspaces as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Estimate the archive size of workspaces
    Estimate(Selection),
    /// Archive workspaces into each host's base path
    Archive(Selection),
    /// Open a workspace in the local Flame viewer
    Launch {
        /// HOST:PROJECT:WORKSPACE
        target: WorkspaceRef,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

#[derive(Subcommand, Debug)]
pub enum HostsCommand {
    /// Show configured hosts
    List,
    /// Verify a host with a password login, install the key, and save it
    Add {
        name: String,
        #[arg(long)]
        user: String,
        /// Archive root on the host
        #[arg(long)]
        base_path: String,
        /// Read the password from stdin instead of prompting
        #[arg(long)]
        password_stdin: bool,
        /// Save the host disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Forget a host
    Remove { name: String },
    /// Include hosts in listing
    Enable {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Exclude hosts from listing
    Disable {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

/// Which workspaces an estimate or archive run covers.
#[derive(clap::Args, Debug)]
pub struct Selection {
    /// Every workspace found on the enabled hosts
    #[arg(long, conflicts_with = "targets")]
    pub all: bool,

    /// HOST:PROJECT:WORKSPACE
    #[arg(required_unless_present = "all")]
    pub targets: Vec<WorkspaceRef>,

    /// Print the results as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        built = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        "farc starting"
    );

    let Cli {
        config_dir,
        command,
        ..
    } = cli;

    match command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "farc", &mut io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
        command => {
            let stop = Arc::new(AtomicBool::new(false));
            if matches!(
                command,
                Commands::List { .. } | Commands::Estimate(_) | Commands::Archive(_)
            ) {
                install_interrupt_handler(Arc::clone(&stop));
            }
            // All remote I/O is blocking.
            tokio::task::spawn_blocking(move || dispatch(command, config_dir, stop))
                .await
                .context("worker thread failed")?
        }
    }
}

/// `-v` raises the crate's level to debug; `RUST_LOG` overrides both.
pub fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("flame_archivist={level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// First Ctrl-C stops after the current job; a second one exits immediately.
fn install_interrupt_handler(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!(
            "{}",
            "Interrupted: finishing the current job (Ctrl-C again to abort)".yellow()
        );
        stop.store(true, Ordering::SeqCst);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

fn session_manager(ctx: &AppContext) -> SessionManager {
    SessionManager::new(ctx.paths.keys.clone(), ctx.paths.known_hosts.clone())
        .with_port(ctx.prefs.port)
        .with_timeout(ctx.prefs.timeout())
}

fn dispatch(command: Commands, config_dir: Option<PathBuf>, stop: Arc<AtomicBool>) -> Result<()> {
    let mut ctx = AppContext::load(config_dir).context("loading configuration")?;

    match command {
        Commands::Hosts { action } => run_hosts(&mut ctx, action),
        Commands::Keygen => {
            let (private_key, public_key) = session_manager(&ctx).provision_key_pair()?;
            println!("{} {}", "Private key:".bold(), private_key.display());
            println!("{} {}", "Public key: ".bold(), public_key.display());
            Ok(())
        }
        Commands::List { json } => {
            let console = console_for(json);
            let manager = session_manager(&ctx);
            let workflow = ArchiveWorkflow::new(&ctx.hosts, &manager, &console)
                .with_timeout(ctx.prefs.timeout())
                .with_stop_flag(stop);
            if ctx.hosts.enabled().next().is_none() {
                console.err("No enabled hosts. Add one with `farc hosts add`.");
            }
            let report = workflow.list_projects();
            if json {
                println!("{}", serde_json::to_string_pretty(&report.workspaces)?);
            } else {
                print_workspaces(&report.workspaces);
            }
            if !report.failed_hosts.is_empty() {
                tracing::warn!(hosts = ?report.failed_hosts, "some hosts could not be listed");
            }
            Ok(())
        }
        Commands::Estimate(selection) => {
            let json = selection.json;
            let console = console_for(json);
            let manager = session_manager(&ctx);
            let workflow = ArchiveWorkflow::new(&ctx.hosts, &manager, &console)
                .with_timeout(ctx.prefs.timeout())
                .with_stop_flag(stop);
            let targets = resolve_targets(selection, &workflow)?;
            let estimates = workflow.estimate(&targets);
            if json {
                println!("{}", serde_json::to_string_pretty(&estimates)?);
            } else {
                print_estimates(&estimates);
            }
            Ok(())
        }
        Commands::Archive(selection) => {
            let json = selection.json;
            let console = console_for(json);
            let manager = session_manager(&ctx);
            let workflow = ArchiveWorkflow::new(&ctx.hosts, &manager, &console)
                .with_timeout(ctx.prefs.timeout())
                .with_stop_flag(stop);
            let targets = resolve_targets(selection, &workflow)?;
            let jobs = workflow.archive(&targets);
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }

            let failed = jobs
                .iter()
                .filter(|j| j.status() == JobStatus::Error)
                .count();
            if failed > 0 {
                bail!("{} of {} archive jobs failed", failed, jobs.len());
            }
            Ok(())
        }
        Commands::Launch { target } => {
            let console = TerminalConsole::new();
            let pid = launch::launch_viewer(&ctx.prefs.viewer_path, &target, &console)?;
            console.ok(&format!("Viewer started (pid {pid})"));
            Ok(())
        }
        Commands::Completions { .. } | Commands::Man => Ok(()),
    }
}

/// Progress goes to stderr when stdout carries JSON.
fn console_for(json: bool) -> TerminalConsole {
    if json {
        TerminalConsole::stderr_only()
    } else {
        TerminalConsole::new()
    }
}

fn resolve_targets(selection: Selection, workflow: &ArchiveWorkflow<'_>) -> Result<Vec<WorkspaceRef>> {
    let targets = if selection.all {
        workflow.list_projects().workspaces
    } else {
        selection.targets
    };
    if targets.is_empty() {
        bail!("no workspaces selected");
    }
    Ok(targets)
}

fn run_hosts(ctx: &mut AppContext, action: HostsCommand) -> Result<()> {
    match action {
        HostsCommand::List => {
            if ctx.hosts.is_empty() {
                println!(
                    "{}",
                    "No hosts configured. Add one with `farc hosts add`.".dimmed()
                );
                return Ok(());
            }
            let rows: Vec<Vec<String>> = ctx
                .hosts
                .iter()
                .map(|h| {
                    vec![
                        h.name.clone(),
                        if h.enabled { "yes" } else { "no" }.to_string(),
                        h.user.clone(),
                        h.base_path.clone(),
                    ]
                })
                .collect();
            print_table(&["HOST", "ENABLED", "USER", "BASE PATH"], &rows, |_, cell| {
                cell.normal()
            });
            Ok(())
        }
        HostsCommand::Add {
            name,
            user,
            base_path,
            password_stdin,
            disabled,
        } => {
            let password = if password_stdin {
                let mut buf = String::new();
                io::stdin()
                    .read_to_string(&mut buf)
                    .context("reading password from stdin")?;
                buf.trim_end_matches(['\r', '\n']).to_string()
            } else {
                Password::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("Password for {}@{}", user, name))
                    .interact()?
            };

            let manager = session_manager(ctx);
            let (_, public_key_path) = manager.provision_key_pair()?;
            let public_key = read_public_key(&public_key_path)?;

            let mut host = HostConfig::new(&name, user, base_path);
            host.enabled = !disabled;

            let console = TerminalConsole::new();
            HostSetup::new(&manager, &console)
                .with_timeout(ctx.prefs.timeout())
                .register(&mut ctx.hosts, host, &password, &public_key)
                .with_context(|| format!("adding host {name}"))?;
            ctx.save_hosts()?;
            Ok(())
        }
        HostsCommand::Remove { name } => {
            ctx.hosts.remove(&name)?;
            ctx.save_hosts()?;
            println!("{} {}", "Removed".green(), name);
            Ok(())
        }
        HostsCommand::Enable { names } => set_enabled(ctx, &names, true),
        HostsCommand::Disable { names } => set_enabled(ctx, &names, false),
    }
}

fn set_enabled(ctx: &mut AppContext, names: &[String], enabled: bool) -> Result<()> {
    for name in names {
        ctx.hosts.set_enabled(name, enabled)?;
    }
    ctx.save_hosts()?;
    let verb = if enabled { "Enabled" } else { "Disabled" };
    println!("{} {}", verb.green(), names.join(", "));
    Ok(())
}

fn print_workspaces(workspaces: &[WorkspaceRef]) {
    if workspaces.is_empty() {
        println!("{}", "No workspaces found.".dimmed());
        return;
    }
    let rows: Vec<Vec<String>> = workspaces
        .iter()
        .map(|w| vec![w.host.clone(), w.project.clone(), w.workspace.clone()])
        .collect();
    print_table(&["HOST", "PROJECT", "WORKSPACE"], &rows, |_, cell| cell.normal());
}

fn print_estimates(estimates: &[SizeEstimate]) {
    let rows: Vec<Vec<String>> = estimates
        .iter()
        .map(|e| {
            vec![
                e.target.host.clone(),
                e.target.project.clone(),
                e.target.workspace.clone(),
                e.size.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(
        &["HOST", "PROJECT", "WORKSPACE", "SIZE"],
        &rows,
        |col, cell| match col {
            3 if cell.trim() == "-" => cell.red(),
            3 => cell.green(),
            _ => cell.normal(),
        },
    );
}

fn print_jobs(jobs: &[ArchiveJob]) {
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            vec![
                j.target.host.clone(),
                j.target.project.clone(),
                j.target.workspace.clone(),
                j.status().to_string(),
                j.note().to_string(),
            ]
        })
        .collect();
    print_table(
        &["HOST", "PROJECT", "WORKSPACE", "STATUS", "NOTE"],
        &rows,
        |col, cell| match (col, cell.trim()) {
            (3, "DONE") => cell.green(),
            (3, "ERROR") => cell.red(),
            (3, _) => cell.yellow(),
            _ => cell.normal(),
        },
    );
}

/// Left-aligned columns; `style` gets each padded cell with its column index.
fn print_table(
    headers: &[&str],
    rows: &[Vec<String>],
    style: impl Fn(usize, &str) -> ColoredString,
) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let header: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, w)| format!("{:<w$}", h, w = *w))
        .collect();
    println!();
    println!("{}", header.join("  ").trim_end().bold());

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, (cell, w))| style(i, &format!("{:<w$}", cell, w = *w)).to_string())
            .collect();
        println!("{}", line.join("  ").trim_end());
    }
}
