//! WineCellar CLI

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;
use winecellar_lib::wine::WineTool;
use winecellar_lib::{
    Bundle, InstalledApp, NewPrefix, OutputSink, ProcessOutput, ProgressSink, Storage, WineArch,
    WineCellar, WindowsVersion, Winetricks,
};

#[derive(Parser)]
#[command(name = "winecellar")]
#[command(about = "Manage Wine prefixes, Windows dependencies and Steam")]
#[command(version)]
struct Cli {
    /// Application data directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wine installations
    #[command(subcommand)]
    Wine(WineCommand),
    /// Prefixes
    #[command(subcommand)]
    Prefix(PrefixCommand),
    /// Applications registered in a prefix
    #[command(subcommand)]
    App(AppCommand),
    /// winetricks dependencies
    #[command(subcommand)]
    Deps(DepsCommand),
    /// DXVK
    #[command(subcommand)]
    Dxvk(DxvkCommand),
    /// Steam client and library
    #[command(subcommand)]
    Steam(SteamCommand),
}

#[derive(Subcommand)]
enum WineCommand {
    /// Rescan for Wine installations
    Detect,
    List,
    /// Make an installation the default
    Default { id: String },
}

#[derive(Subcommand)]
enum PrefixCommand {
    List,
    Create {
        name: String,
        #[arg(long, default_value = "win64")]
        arch: WineArch,
        #[arg(long, default_value = "win10")]
        windows: WindowsVersion,
        #[arg(long)]
        dxvk: bool,
        /// Pin a Wine installation by id or version
        #[arg(long)]
        wine: Option<String>,
    },
    Delete { prefix: String },
    Duplicate { prefix: String, name: String },
    Rename { prefix: String, name: String },
    /// Change the emulated Windows version
    Windows { prefix: String, version: WindowsVersion },
    /// Toggle the DXVK environment for the prefix
    DxvkFlag { prefix: String, state: Toggle },
    Size { prefix: String },
    /// Run a Windows program
    Run {
        prefix: String,
        executable: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a Windows installer
    Install {
        prefix: String,
        installer: PathBuf,
        /// Show the installer UI instead of installing silently
        #[arg(long)]
        interactive: bool,
    },
    /// Open a built-in Wine tool (winecfg, regedit, taskmgr, explorer, control, uninstaller)
    Tool { prefix: String, tool: WineTool },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum AppCommand {
    List { prefix: String },
    /// Register an executable (absolute, or relative to drive_c)
    Add {
        prefix: String,
        name: String,
        path: PathBuf,
    },
    Remove { prefix: String, app: String },
    Launch { prefix: String, app: String },
}

#[derive(Subcommand)]
enum DepsCommand {
    /// List the curated verbs
    Catalog,
    Installed { prefix: String },
    Install {
        prefix: String,
        #[arg(required = true)]
        verbs: Vec<String>,
    },
    /// Minimal set for the Steam client
    Steam { prefix: String },
    /// Common game runtimes
    Games { prefix: String },
    Dotnet { prefix: String },
}

#[derive(Subcommand)]
enum DxvkCommand {
    Install {
        prefix: String,
        #[arg(long)]
        version: Option<String>,
    },
    Uninstall { prefix: String },
    Status { prefix: String },
}

#[derive(Subcommand)]
enum SteamCommand {
    /// Create a Steam prefix and install the client
    Install,
    Find,
    Launch {
        #[arg(long)]
        big_picture: bool,
    },
    /// Launch a game by Steam app id
    Game { app_id: u32 },
    /// List games in the Steam library
    Scan,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let storage = match storage_for(cli.root.clone()) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    init_logging(cli.verbose, &storage.logs_dir());

    if let Err(e) = run(cli, storage).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// An explicit root keeps everything, logs included, below it
fn storage_for(root: Option<PathBuf>) -> winecellar_lib::Result<Storage> {
    if let Some(root) = root {
        return Ok(Storage::new(root));
    }
    let storage = Storage::new(Storage::default_root()?);
    Ok(match Storage::default_logs_dir() {
        Some(logs) => storage.with_logs_dir(logs),
        None => storage,
    })
}

/// stderr plus a plain-text daily file under the logs directory
fn init_logging(verbose: u8, logs_dir: &Path) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("winecellar_lib={level},winecellar={level},warn")));

    let log_path = logs_dir.join(format!(
        "winecellar-{}.log",
        chrono::Local::now().format("%Y-%m-%d")
    ));
    let file = std::fs::create_dir_all(logs_dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&log_path));
    let file_layer = match file {
        Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
        Err(e) => {
            eprintln!("Logging to {:?} disabled: {}", log_path, e);
            None
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();
}

fn progress_bar(message: &'static str) -> anyhow::Result<(ProgressBar, ProgressSink)> {
    let bar = ProgressBar::new(1000);
    let style = ProgressStyle::default_bar()
        .template("{msg} {bar:40.cyan/blue} {percent}%")
        .context("Progress bar template error")?;
    bar.set_style(style);
    bar.set_message(message);

    let handle = bar.clone();
    let sink: ProgressSink = Arc::new(move |fraction: f64| {
        handle.set_position((fraction.clamp(0.0, 1.0) * 1000.0) as u64);
    });
    Ok((bar, sink))
}

fn stdout_sink() -> OutputSink {
    Arc::new(|chunk: &str| print!("{}", chunk))
}

fn prefix_id(cellar: &WineCellar, query: &str) -> anyhow::Result<Uuid> {
    cellar
        .prefixes()
        .lookup(query)
        .map(|prefix| prefix.id)
        .ok_or_else(|| anyhow!("No prefix named or identified by '{}'", query))
}

fn app_id(cellar: &WineCellar, prefix: Uuid, query: &str) -> anyhow::Result<Uuid> {
    let prefix = cellar
        .prefixes()
        .prefix(prefix)
        .ok_or_else(|| anyhow!("Prefix {} disappeared", prefix))?;
    let by_id = Uuid::parse_str(query).ok();
    prefix
        .installed_apps
        .iter()
        .find(|app| Some(app.id) == by_id || app.name == query)
        .map(|app| app.id)
        .ok_or_else(|| anyhow!("No app named or identified by '{}' in '{}'", query, prefix.name))
}

fn report_exit(output: &ProcessOutput) {
    if !output.success() {
        eprintln!("Process exited with code {}", output.exit_code);
    }
}

async fn run(cli: Cli, storage: Storage) -> anyhow::Result<()> {
    let mut cellar = WineCellar::open_storage(storage).await?;
    cellar.refresh().await?;

    match cli.command {
        Command::Wine(command) => wine_command(&mut cellar, command).await,
        Command::Prefix(command) => prefix_command(&mut cellar, command).await,
        Command::App(command) => app_command(&mut cellar, command).await,
        Command::Deps(command) => deps_command(&mut cellar, command).await,
        Command::Dxvk(command) => dxvk_command(&mut cellar, command).await,
        Command::Steam(command) => steam_command(&mut cellar, command).await,
    }
}

async fn wine_command(cellar: &mut WineCellar, command: WineCommand) -> anyhow::Result<()> {
    match command {
        WineCommand::Detect | WineCommand::List => {
            let versions = match command {
                WineCommand::Detect => cellar.detect_wine().await?,
                _ => cellar.wine().versions(),
            };
            if versions.is_empty() {
                println!("No Wine installations found");
            }
            for version in versions {
                println!(
                    "{} Wine {:<12} {:<10} {}",
                    if version.is_default { "*" } else { " " },
                    version.version,
                    version.source.display_name(),
                    version.path.display()
                );
            }
        }
        WineCommand::Default { id } => {
            let id = cellar
                .wine()
                .find(&id)
                .map(|version| version.id)
                .unwrap_or(id);
            cellar.set_default_wine(&id).await?;
            println!("Default Wine set to {}", id);
        }
    }
    Ok(())
}

async fn prefix_command(cellar: &mut WineCellar, command: PrefixCommand) -> anyhow::Result<()> {
    match command {
        PrefixCommand::List => {
            for prefix in cellar.prefixes().prefixes() {
                let last_used = prefix
                    .last_used
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  {:<24} {} {:<18} dxvk:{:<5} apps:{:<3} last used: {}",
                    prefix.id,
                    prefix.name,
                    prefix.architecture,
                    prefix.windows_version.display_name(),
                    prefix.dxvk_enabled,
                    prefix.installed_apps.len(),
                    last_used
                );
            }
        }
        PrefixCommand::Create {
            name,
            arch,
            windows,
            dxvk,
            wine,
        } => {
            let prefix = cellar
                .create_prefix(NewPrefix {
                    name,
                    architecture: arch,
                    windows_version: windows,
                    dxvk_enabled: dxvk,
                    wine_version: wine,
                })
                .await?;
            println!("Created prefix '{}' ({})", prefix.name, prefix.id);
        }
        PrefixCommand::Delete { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar.delete_prefix(id).await?;
            println!("Deleted prefix '{}'", prefix);
        }
        PrefixCommand::Duplicate { prefix, name } => {
            let id = prefix_id(cellar, &prefix)?;
            let (bar, sink) = progress_bar("Copying")?;
            let copy = cellar.duplicate_prefix(id, &name, Some(sink)).await;
            bar.finish_and_clear();
            let copy = copy?;
            println!("Created prefix '{}' ({})", copy.name, copy.id);
        }
        PrefixCommand::Rename { prefix, name } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar.rename_prefix(id, &name).await?;
        }
        PrefixCommand::Windows { prefix, version } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar.set_windows_version(id, version).await?;
        }
        PrefixCommand::DxvkFlag { prefix, state } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar
                .set_dxvk_enabled(id, matches!(state, Toggle::On))
                .await?;
        }
        PrefixCommand::Size { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            let bytes = cellar.prefix_size(id).await?;
            println!("{:.1} MiB ({} bytes)", bytes as f64 / (1024.0 * 1024.0), bytes);
        }
        PrefixCommand::Run {
            prefix,
            executable,
            args,
        } => {
            let id = prefix_id(cellar, &prefix)?;
            let output = cellar
                .run_program(id, &executable, &args, Some(stdout_sink()))
                .await?;
            report_exit(&output);
        }
        PrefixCommand::Install {
            prefix,
            installer,
            interactive,
        } => {
            let id = prefix_id(cellar, &prefix)?;
            let output = cellar
                .run_installer(id, &installer, !interactive, Some(stdout_sink()))
                .await?;
            report_exit(&output);
            println!("Register the installed program with `winecellar app add`.");
        }
        PrefixCommand::Tool { prefix, tool } => {
            let id = prefix_id(cellar, &prefix)?;
            let output = cellar.open_tool(id, tool, Some(stdout_sink())).await?;
            report_exit(&output);
        }
    }
    Ok(())
}

async fn app_command(cellar: &mut WineCellar, command: AppCommand) -> anyhow::Result<()> {
    match command {
        AppCommand::List { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            let prefix = cellar
                .prefixes()
                .prefix(id)
                .ok_or_else(|| anyhow!("Prefix {} disappeared", id))?;
            for app in &prefix.installed_apps {
                println!(
                    "{}  {:<24} launched {:>4}x  C:/{}",
                    app.id, app.name, app.launch_count, app.executable_path
                );
            }
        }
        AppCommand::Add { prefix, name, path } => {
            let id = prefix_id(cellar, &prefix)?;
            let app = if path.is_absolute() {
                let prefix = cellar
                    .prefixes()
                    .prefix(id)
                    .ok_or_else(|| anyhow!("Prefix {} disappeared", id))?;
                InstalledApp::from_absolute(name, prefix, &path)
                    .ok_or_else(|| anyhow!("{:?} is not inside the prefix's C: drive", path))?
            } else {
                InstalledApp::new(name, path.to_string_lossy())
            };
            let app = cellar.add_app(id, app).await?;
            println!("Added '{}' ({})", app.name, app.id);
        }
        AppCommand::Remove { prefix, app } => {
            let id = prefix_id(cellar, &prefix)?;
            let app = app_id(cellar, id, &app)?;
            cellar.remove_app(id, app).await?;
        }
        AppCommand::Launch { prefix, app } => {
            let id = prefix_id(cellar, &prefix)?;
            let app = app_id(cellar, id, &app)?;
            let output = cellar.launch_app(id, app, Some(stdout_sink())).await?;
            report_exit(&output);
        }
    }
    Ok(())
}

async fn deps_command(cellar: &mut WineCellar, command: DepsCommand) -> anyhow::Result<()> {
    let report = match command {
        DepsCommand::Catalog => {
            for (category, verbs) in Winetricks::catalog() {
                println!("{}:", category.display_name());
                for verb in verbs {
                    println!("  {:<16} {}", verb.as_str(), verb.display_name());
                }
            }
            return Ok(());
        }
        DepsCommand::Installed { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            for verb in cellar.installed_verbs(id).await? {
                println!("{}", verb);
            }
            return Ok(());
        }
        DepsCommand::Install { prefix, verbs } => {
            let id = prefix_id(cellar, &prefix)?;
            let verbs: Vec<&str> = verbs.iter().map(String::as_str).collect();
            cellar.install_verbs(id, &verbs, Some(stdout_sink())).await?
        }
        DepsCommand::Steam { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar.install_bundle(id, Bundle::Steam, Some(stdout_sink())).await?
        }
        DepsCommand::Games { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar.install_bundle(id, Bundle::Games, Some(stdout_sink())).await?
        }
        DepsCommand::Dotnet { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar.install_bundle(id, Bundle::DotNet, Some(stdout_sink())).await?
        }
    };

    println!("Installed: {}", report.succeeded.join(", "));
    for (verb, code) in &report.failed {
        eprintln!("Failed: {} (exit code {})", verb, code);
    }
    Ok(())
}

async fn dxvk_command(cellar: &mut WineCellar, command: DxvkCommand) -> anyhow::Result<()> {
    match command {
        DxvkCommand::Install { prefix, version } => {
            let id = prefix_id(cellar, &prefix)?;
            let (bar, sink) = progress_bar("Installing DXVK")?;
            let result = cellar.install_dxvk(id, version.as_deref(), Some(sink)).await;
            bar.finish_and_clear();
            result?;
            println!("DXVK installed");
        }
        DxvkCommand::Uninstall { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            cellar.uninstall_dxvk(id).await?;
            println!("DXVK removed");
        }
        DxvkCommand::Status { prefix } => {
            let id = prefix_id(cellar, &prefix)?;
            let installed = cellar.dxvk_installed(id).await?;
            println!("{}", if installed { "installed" } else { "not installed" });
        }
    }
    Ok(())
}

async fn steam_command(cellar: &mut WineCellar, command: SteamCommand) -> anyhow::Result<()> {
    match command {
        SteamCommand::Install => {
            let (bar, sink) = progress_bar("Installing Steam")?;
            let result = cellar.install_steam(Some(sink)).await;
            bar.finish_and_clear();
            let prefix = result?;
            println!("Steam installed in prefix '{}' ({})", prefix.name, prefix.id);
        }
        SteamCommand::Find => match cellar.find_steam_prefix() {
            Some(prefix) => println!("{}  {}", prefix.id, prefix.name),
            None => println!("Steam is not installed"),
        },
        SteamCommand::Launch { big_picture } => {
            let output = cellar.launch_steam(big_picture, Some(stdout_sink())).await?;
            report_exit(&output);
        }
        SteamCommand::Game { app_id } => {
            let output = cellar.launch_game(app_id, Some(stdout_sink())).await?;
            report_exit(&output);
        }
        SteamCommand::Scan => {
            let library = cellar.scan_steam_library().await?;
            for game in &library.games {
                let last_played = game
                    .last_played
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:>8}  {:<40} {:<13} last played: {}",
                    game.id,
                    game.name,
                    if game.is_installed { "installed" } else { "not installed" },
                    last_played
                );
            }
        }
    }
    Ok(())
}
