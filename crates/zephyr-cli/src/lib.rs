//! CLI adapter for the Zephyr shell-module package manager.
//!
//! Argument parsing, interactive confirmation, and exit-code mapping
//! live here; everything else is the `zephyr` core library. Embedders
//! who want the exact CLI surface programmatically call [`run`].

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use zephyr::audit::{self, ScanSummary, Stream};
use zephyr::emitter;
use zephyr::install::{self, InstallReport, Reporter};
use zephyr::manifest;
use zephyr::signature;
use zephyr::types::{AgentType, InstallOptions, ScanResult};
use zephyr::uninstall::{self, UninstallOptions, UninstallOutcome};
use zephyr::upgrade::{self, UpgradeOptions, UpgradeOutcome};
use zephyr::{config, discover, resolver, session};

#[derive(Parser, Debug)]
#[command(name = "zephyr", version)]
#[command(about = "Shell-module package manager with dependency resolution and security scanning")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a module from a git URL, GitHub shorthand, signed tarball, or local path.
    Install {
        source: String,
        /// Replace an existing module of the same name.
        #[arg(long)]
        force: bool,
        /// Proceed despite critical findings (requires the use_unsafe capability).
        #[arg(long = "unsafe")]
        unsafe_override: bool,
        /// Permit local-path sources.
        #[arg(long)]
        allow_local: bool,
        /// Confirm warning-level findings up front.
        #[arg(long)]
        confirm: bool,
        /// Timeout for git/HTTP acquisition (e.g. 30s, 2m); defaults to
        /// the configured value.
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Re-run the install pipeline against a module's recorded source.
    Update {
        name: String,
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Remove an installed module.
    Uninstall {
        name: String,
        /// Remove even when other modules depend on it.
        #[arg(long)]
        force: bool,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
        /// Skip the role permission check.
        #[arg(long)]
        skip_permission: bool,
    },
    /// List installed modules in load order.
    List,
    /// Validate every manifest in the modules directory.
    Validate,
    /// Emit shell initialization code for the resolved module order.
    Load {
        /// Target shell (zsh or bash); defaults to $SHELL.
        #[arg(long)]
        shell: Option<String>,
    },
    /// Scaffold a new module.
    Init { name: String },
    /// Register a caller session.
    RegisterSession {
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        agent_type: String,
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value = "unknown")]
        parent: String,
    },
    /// Show the current session.
    Session,
    /// Show registered sessions.
    Sessions,
    /// Read back audit events.
    Audit {
        #[arg(long = "type", default_value = "operations")]
        stream: String,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Upgrade the zephyr binary from the release manifest.
    Upgrade {
        /// Report the available version without installing it.
        #[arg(long)]
        check: bool,
        #[arg(long)]
        force: bool,
    },
    /// Print the embedded release signing key.
    ShowSigningKey,
    /// Verify the signed tarball in a local directory.
    Verify { path: PathBuf },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }

    fn confirm(&mut self, prompt: &str) -> bool {
        eprint!("{prompt} [y/N] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

fn acquire_timeout(flag: Option<&str>) -> Result<Duration> {
    match flag {
        Some(raw) => {
            humantime::parse_duration(raw).with_context(|| format!("invalid duration `{raw}`"))
        }
        None => config::acquire_timeout(),
    }
}

fn scan_summary(scan: &ScanResult) -> ScanSummary {
    ScanSummary {
        critical: scan.critical_count,
        warning: scan.warning_count,
        info: scan.info_count,
    }
}

fn log_command(command: &str, scan: Option<ScanSummary>, exit_code: i32, reporter: &mut CliReporter) {
    if let Err(err) = audit::log_command(command, scan, exit_code) {
        reporter.warn(&format!("failed to write command audit event: {err:#}"));
    }
}

/// Parse arguments and execute one command, returning the process exit
/// code. This is the whole CLI surface; the `zephyr` binary forwards
/// straight to it.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    // Pick up the caller's session from the environment before any
    // permission decision.
    let _ = session::ensure_current_from_env();

    let mut reporter = CliReporter;
    match cli.cmd {
        Commands::Install {
            source,
            force,
            unsafe_override,
            allow_local,
            confirm,
            timeout,
        } => {
            let options = InstallOptions {
                force,
                unsafe_override,
                allow_local,
                confirm,
                interactive: std::io::stdin().is_terminal(),
                acquire_timeout: acquire_timeout(timeout.as_deref())?,
            };
            let command = format!("install {source}");
            match install::install(&source, &options, &mut reporter) {
                Ok(report) => {
                    log_command(&command, Some(scan_summary(&report.scan)), 0, &mut reporter);
                    print_install_report(&report);
                    Ok(0)
                }
                Err(err) => {
                    log_command(&command, None, 1, &mut reporter);
                    Err(err)
                }
            }
        }
        Commands::Update { name, timeout } => {
            let options = InstallOptions {
                allow_local: true,
                interactive: std::io::stdin().is_terminal(),
                acquire_timeout: acquire_timeout(timeout.as_deref())?,
                ..InstallOptions::default()
            };
            let command = format!("update {name}");
            match install::update(&name, &options, &mut reporter) {
                Ok(report) => {
                    log_command(&command, Some(scan_summary(&report.scan)), 0, &mut reporter);
                    if report.no_op {
                        println!("{} is already at {}", report.module, report.version);
                    } else {
                        print_install_report(&report);
                    }
                    Ok(0)
                }
                Err(err) => {
                    log_command(&command, None, 1, &mut reporter);
                    Err(err)
                }
            }
        }
        Commands::Uninstall {
            name,
            force,
            yes,
            skip_permission,
        } => {
            let options = UninstallOptions {
                force,
                yes,
                skip_permission,
                interactive: std::io::stdin().is_terminal(),
            };
            let command = format!("uninstall {name}");
            match uninstall::uninstall(&name, &options, &mut reporter) {
                Ok(UninstallOutcome::Removed) => {
                    log_command(&command, None, 0, &mut reporter);
                    println!("removed {name}");
                    Ok(0)
                }
                Ok(UninstallOutcome::AgentBlocked { message }) => {
                    // Advisory denial, clean exit.
                    log_command(&command, None, 0, &mut reporter);
                    println!("{message}");
                    Ok(0)
                }
                Err(err) => {
                    log_command(&command, None, 1, &mut reporter);
                    Err(err)
                }
            }
        }
        Commands::List => {
            let modules = discover::discover_modules()?;
            if modules.is_empty() {
                println!("no modules installed in {}", config::modules_dir()?.display());
                return Ok(0);
            }
            let order = resolver::resolve_cached(&modules)?;
            for module in order {
                println!(
                    "{:<24} {:<10} priority {:<4} {}",
                    module.name,
                    module.version,
                    module.priority,
                    module.description.as_deref().unwrap_or("")
                );
            }
            Ok(0)
        }
        Commands::Validate => {
            let dir = config::modules_dir()?;
            let results = discover::validate_all(&dir)?;
            if results.is_empty() {
                println!("no modules found in {}", dir.display());
                return Ok(0);
            }
            let mut failed = 0;
            let mut modules = Vec::new();
            for (label, outcome) in results {
                match outcome {
                    Ok(module) => {
                        println!("ok      {label}");
                        modules.push(module);
                    }
                    Err(err) => {
                        failed += 1;
                        println!("error   {label}: {err:#}");
                    }
                }
            }
            if let Err(err) = resolver::resolve_cached(&modules) {
                failed += 1;
                println!("error   dependency resolution: {err}");
            }
            Ok(if failed == 0 { 0 } else { 1 })
        }
        Commands::Load { shell } => {
            let modules = discover::discover_modules()?;
            let order = resolver::resolve_cached(&modules)?;
            let loadable: Vec<_> = order
                .into_iter()
                .filter(|m| {
                    let ok = emitter::platform_matches(m);
                    if !ok {
                        reporter.info(&format!("skipping {} (platform filter)", m.name));
                    }
                    ok
                })
                .collect();
            let shell = shell.unwrap_or_else(emitter::shell_from_env);
            let backend = emitter::backend_for(&shell);
            print!("{}", emitter::emit_init(&loadable, backend.as_ref()));
            Ok(0)
        }
        Commands::Init { name } => {
            let dir = config::modules_dir()?;
            manifest::scaffold_module(&dir, &name)?;
            println!("created {}", dir.join(&name).display());
            Ok(0)
        }
        Commands::RegisterSession {
            agent_id,
            agent_type,
            session_id,
            parent,
        } => {
            let Some(agent_type) = AgentType::parse(&agent_type) else {
                bail!("unknown agent type `{agent_type}`");
            };
            let session = session::register(&agent_id, agent_type, &session_id, &parent)?;
            println!(
                "registered session {} ({} as {})",
                session.session_id,
                session.agent_type.as_str(),
                session.role.as_str()
            );
            Ok(0)
        }
        Commands::Session => {
            match session::current() {
                Some(s) => println!("{}", serde_json::to_string_pretty(&s)?),
                None => println!("no current session"),
            }
            Ok(0)
        }
        Commands::Sessions => {
            // Durable view: the sessions audit stream, newest first.
            let lines = audit::read_stream(Stream::Sessions, None)?;
            if lines.is_empty() {
                println!("no registered sessions");
            }
            for line in lines {
                println!("{line}");
            }
            Ok(0)
        }
        Commands::Audit { stream, filter } => {
            let Some(stream) = Stream::parse(&stream) else {
                bail!("unknown audit stream `{stream}` (sessions|commands|operations)");
            };
            for line in audit::read_stream(stream, filter.as_deref())? {
                println!("{line}");
            }
            Ok(0)
        }
        Commands::Upgrade { check, force } => {
            let options = UpgradeOptions {
                check_only: check,
                force,
                ..UpgradeOptions::default()
            };
            match upgrade::upgrade(env!("CARGO_PKG_VERSION"), &options, &mut reporter)? {
                UpgradeOutcome::UpToDate { version } => {
                    println!("zephyr {version} is current");
                }
                UpgradeOutcome::Available { version } => {
                    println!("zephyr {version} is available (run `zephyr upgrade`)");
                }
                UpgradeOutcome::Upgraded { version } => {
                    println!("upgraded to zephyr {version}");
                }
            }
            Ok(0)
        }
        Commands::ShowSigningKey => {
            let key = signature::embedded_key()?;
            println!("ed25519 public key: {}", signature::SIGNING_KEY_HEX);
            println!("sha256 fingerprint: {}", signature::key_fingerprint(&key));
            Ok(0)
        }
        Commands::Verify { path } => {
            let (set, outcome) = signature::verify_directory(&path)?;
            match outcome {
                signature::VerifyOutcome::Verified { fingerprint } => {
                    println!(
                        "ok: {} (key {fingerprint})",
                        set.tarball.display()
                    );
                    Ok(0)
                }
                signature::VerifyOutcome::Failed { reason } => {
                    println!("failed: {reason}");
                    Ok(1)
                }
            }
        }
    }
}

fn print_install_report(report: &InstallReport) {
    println!(
        "installed {} {} ({}signature {})",
        report.module,
        report.version,
        if report.scan.warning_count > 0 {
            format!("{} warning(s), ", report.scan.warning_count)
        } else {
            String::new()
        },
        if report.signature_verified {
            "verified"
        } else {
            "not present"
        }
    );
}
