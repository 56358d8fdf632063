//! vsync: Mirror a directory tree into a vector-clock stamped store
//!
//! - Full, delta and watch-driven scans
//! - Native .gitignore support
//! - LMDB-backed tree with a parent index
//! - Cargo-style progress output

mod debug_log;
mod progress;

use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail, eyre};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use vsync_core::clock::{self, VectorClock};
use vsync_core::dispatch::{META_PARTITION, tree_namespace};
use vsync_core::{
    DispatchEvent, Dispatcher, DispatcherOptions, Entry, JobOutcome, SourceSpec, SourceWatcher,
    Store, TreeAdapter, VsyncConfig,
};

use crate::progress::ScanProgress;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

/// Source name used for the single root a CLI invocation manages
const SOURCE: &str = "root";

#[derive(Parser)]
#[command(name = "vsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Mirror a directory tree and emit a vector-clock stamped changelog")]
#[command(long_about = r#"
vsync keeps an indexed copy of a directory tree and records every change
against a per-device vector clock.

Examples:
  vsync scan ./project            Scan once (full first, delta after)
  vsync watch ./project           Scan, then follow filesystem events
  vsync ls ./project src -r       Dump the stored subtree under src
  vsync clock ./project           Print the persisted vector clock
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan job and print a summary
    Scan {
        /// Source root
        root: PathBuf,

        /// Print the job outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Scan, then watch and apply changes until interrupted
    Watch {
        /// Source root
        root: PathBuf,

        /// Debounce delay in milliseconds (overrides .vsync.toml)
        #[arg(short, long)]
        debounce: Option<u64>,
    },

    /// List stored entries
    Ls {
        /// Source root
        root: PathBuf,

        /// Root-relative directory to list (defaults to the root)
        path: Option<PathBuf>,

        /// Dump the whole subtree instead of direct children
        #[arg(short, long)]
        recursive: bool,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the persisted vector clock
    Clock {
        /// Source root
        root: PathBuf,
    },

    /// Show version and build info
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    debug!(log = %session.path.display(), "session log");

    match cli.command {
        Commands::Version => {
            eprintln!("vsync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Scan { root, json } => scan_command(&root, json).await?,
        Commands::Watch { root, debounce } => watch_command(&root, debounce).await?,
        Commands::Ls {
            root,
            path,
            recursive,
            json,
        } => {
            let path = listing_path(&path.unwrap_or_default())?;
            ls_command(&root, &path, recursive, json)?;
        }
        Commands::Clock { root } => clock_command(&root)?,
    }

    drop(session);
    Ok(())
}

/// A source root opened with its config and state store
struct Opened {
    config: VsyncConfig,
    spec: SourceSpec,
    store: Store,
}

fn open_root(root: &Path) -> Result<Opened> {
    let root = root
        .canonicalize()
        .wrap_err_with(|| format!("cannot open {}", root.display()))?;
    let config = VsyncConfig::load(&root)?;
    let state = config.state_path(&root);
    let store = Store::open(&state)?;
    let spec = SourceSpec::from_config(SOURCE, &root, &config)?;
    info!(root = %root.display(), state = %state.display(), "opened source");
    Ok(Opened {
        config,
        spec,
        store,
    })
}

async fn start(opened: &Opened) -> Result<(Dispatcher, mpsc::UnboundedReceiver<DispatchEvent>)> {
    let (dispatcher, events) = Dispatcher::open(
        opened.store.clone(),
        DispatcherOptions {
            device_id: opened.config.device_id.clone(),
        },
    )?;
    dispatcher.add_source(opened.spec.clone()).await?;
    Ok((dispatcher, events))
}

/// Drive the progress display until job `id` finishes.
async fn follow_job(
    id: u64,
    events: &mut mpsc::UnboundedReceiver<DispatchEvent>,
    progress: &ScanProgress,
) -> Result<JobOutcome> {
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::Progress { job, report, .. } if job == id => progress.update(&report),
            DispatchEvent::Finished(outcome) if outcome.job == id => return Ok(outcome),
            _ => {}
        }
    }
    Err(eyre!("dispatcher stopped before job {id} finished"))
}

async fn scan_command(root: &Path, json: bool) -> Result<()> {
    let opened = open_root(root)?;
    let (dispatcher, mut events) = start(&opened).await?;

    let progress = ScanProgress::new();
    let id = dispatcher.scan(SOURCE)?;
    let outcome = follow_job(id, &mut events, &progress).await?;
    dispatcher.shutdown().await;

    if json {
        progress.clear();
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        progress.finish(&outcome);
    }
    if let Some(error) = outcome.error {
        bail!("scan failed: {error}");
    }
    Ok(())
}

async fn watch_command(root: &Path, debounce: Option<u64>) -> Result<()> {
    let opened = open_root(root)?;
    let (dispatcher, mut events) = start(&opened).await?;

    let progress = ScanProgress::new();
    let id = dispatcher.scan(SOURCE)?;
    let outcome = follow_job(id, &mut events, &progress).await?;
    progress.finish(&outcome);
    if let Some(error) = outcome.error {
        dispatcher.shutdown().await;
        bail!("initial scan failed: {error}");
    }

    let debounce = Duration::from_millis(debounce.unwrap_or(opened.config.watch.debounce_ms));
    let _watcher = SourceWatcher::spawn(dispatcher.clone(), &opened.spec, debounce)?;
    progress::watching(&opened.spec.root);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DispatchEvent::Commit(commit)) => {
                    for record in &commit.changes {
                        progress::change(record);
                    }
                }
                Some(DispatchEvent::Finished(outcome)) => {
                    debug!(job = outcome.job, clock = %outcome.clock, "watch job finished");
                    if let Some(error) = outcome.error {
                        error!(job = outcome.job, %error, "watch job failed");
                    }
                }
                Some(DispatchEvent::Progress { .. }) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    Ok(())
}

#[derive(Serialize)]
struct Listed {
    path: PathBuf,
    #[serde(flatten)]
    entry: Entry,
}

/// Root-relative form of a typed listing path, without `.` components or
/// trailing separators.
fn listing_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => out.push(name),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("{} is not relative to the source root", path.display())
            }
        }
    }
    Ok(out)
}

fn ls_command(root: &Path, path: &Path, recursive: bool, json: bool) -> Result<()> {
    let opened = open_root(root)?;
    let tree = TreeAdapter::open(opened.store.partition(&tree_namespace(SOURCE)))?;

    let mut listed = Vec::new();
    if recursive {
        tree.scan_sub_tree(path, |path, entry| {
            listed.push(Listed {
                path: path.to_path_buf(),
                entry: entry.clone(),
            });
            ControlFlow::Continue(())
        })?;
    } else {
        listed.extend(
            tree.get_children(path)?
                .into_iter()
                .map(|(path, entry)| Listed { path, entry }),
        );
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(());
    }
    let device = opened_device(&opened)?;
    for Listed { path, entry } in &listed {
        let size = entry
            .blob
            .as_ref()
            .map(|blob| humansize::format_size(blob.size, humansize::BINARY))
            .unwrap_or_default();
        println!(
            "{:>9} {:>10} {:>8} {}",
            entry.kind.label(),
            size,
            entry.modification.get(&device),
            path.display()
        );
    }
    Ok(())
}

fn opened_device(opened: &Opened) -> Result<String> {
    let meta = opened.store.partition(META_PARTITION);
    meta.prepare()?;
    Ok(clock::device_id(&meta, opened.config.device_id.as_deref())?)
}

fn clock_command(root: &Path) -> Result<()> {
    let opened = open_root(root)?;
    let device = opened_device(&opened)?;
    let clock = VectorClock::load(&opened.store.partition(META_PARTITION), device.clone())?;
    println!("{device} {}", clock.snapshot());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_path_normalizes() {
        assert_eq!(listing_path(Path::new("./x")).unwrap(), PathBuf::from("x"));
        assert_eq!(listing_path(Path::new("x/")).unwrap(), PathBuf::from("x"));
        assert_eq!(listing_path(Path::new("a/./b/")).unwrap(), PathBuf::from("a/b"));
        assert_eq!(listing_path(Path::new(".")).unwrap(), PathBuf::new());
        assert_eq!(listing_path(Path::new("")).unwrap(), PathBuf::new());
    }

    #[test]
    fn test_listing_path_rejects_escapes() {
        assert!(listing_path(Path::new("../x")).is_err());
        assert!(listing_path(Path::new("/etc")).is_err());
    }
}
