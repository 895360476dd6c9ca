#![forbid(unsafe_code)]
//! fcache command-line tool.
//!
//! Small front end over the cache: inspect a file's cache state, stream a
//! file through the cache, or copy between files with both ends cached.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fcache::{CacheConfig, CachePolicy, CachedFile, OpenMode, PAGE_SIZE, PageCache};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "fcache", about = "fcache — paged file cache toolkit")]
struct Cli {
    /// Replacement policy for opened files.
    #[arg(long, global = true, value_enum, default_value_t = PolicyArg::Lru)]
    policy: PolicyArg,

    /// Number of frames in the pool.
    #[arg(long, global = true)]
    frames: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prefetch a file and print the cache state and metrics as JSON.
    Stat {
        /// Path to inspect.
        path: PathBuf,
    },
    /// Stream a file to stdout through the cache.
    Cat {
        /// Path to read.
        path: PathBuf,
    },
    /// Copy a file with both ends going through the cache.
    Copy {
        /// Source path.
        src: PathBuf,
        /// Destination path (created or truncated).
        dst: PathBuf,
        /// Print metrics after the copy.
        #[arg(long)]
        stats: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Keep,
    Lru,
    Fifo,
}

impl std::fmt::Display for PolicyArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Keep => "keep",
            Self::Lru => "lru",
            Self::Fifo => "fifo",
        };
        f.write_str(name)
    }
}

impl From<PolicyArg> for CachePolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Keep => Self::Keep,
            PolicyArg::Lru => Self::Lru,
            PolicyArg::Fifo => Self::Fifo,
        }
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let cache = build_cache(cli.frames)?;
    let policy = CachePolicy::from(cli.policy);

    match cli.command {
        Command::Stat { path } => stat(&cache, &path, policy),
        Command::Cat { path } => cat(&cache, &path, policy),
        Command::Copy { src, dst, stats } => copy(&cache, &src, &dst, policy, stats),
    }
}

fn build_cache(frames: Option<usize>) -> Result<Arc<PageCache>> {
    let mut config = CacheConfig::default();
    if let Some(frames) = frames {
        config.num_frames = frames;
    }
    let cache = PageCache::with_config(config).context("failed to start the cache")?;
    Ok(Arc::new(cache))
}

fn stat(cache: &Arc<PageCache>, path: &PathBuf, policy: CachePolicy) -> Result<()> {
    let file = CachedFile::open(cache, path, OpenMode::Read, policy)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(0).context("prefetch failed")?;

    let report = serde_json::json!({
        "state": cache.state_dump(),
        "metrics": cache.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    drop(file);
    Ok(())
}

fn cat(cache: &Arc<PageCache>, path: &PathBuf, policy: CachePolicy) -> Result<()> {
    let file = CachedFile::open(cache, path, OpenMode::Read, policy)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(0).context("prefetch failed")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0_u8; 8 * PAGE_SIZE];
    loop {
        let n = file.read(&mut buf).context("read failed")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("write to stdout failed")?;
        if n < buf.len() {
            break;
        }
    }
    out.flush().context("flush stdout failed")?;
    Ok(())
}

fn copy(
    cache: &Arc<PageCache>,
    src: &PathBuf,
    dst: &PathBuf,
    policy: CachePolicy,
    stats: bool,
) -> Result<()> {
    let source = CachedFile::open(cache, src, OpenMode::Read, policy)
        .with_context(|| format!("failed to open {}", src.display()))?;
    let mut dest = CachedFile::open(cache, dst, OpenMode::WriteRead, policy)
        .with_context(|| format!("failed to open {}", dst.display()))?;
    source.seek(0).context("prefetch failed")?;

    let mut copied = 0_u64;
    let mut buf = vec![0_u8; 8 * PAGE_SIZE];
    loop {
        let n = source.read(&mut buf).context("read failed")?;
        if n == 0 {
            break;
        }
        let written = dest.write(&buf[..n]).context("write failed")?;
        anyhow::ensure!(written == n, "short write to {}", dst.display());
        copied += n as u64;
        if n < buf.len() {
            break;
        }
    }

    // Close the destination first so its dirty pages hit the disk before
    // we report success.
    dest.close().context("close destination failed")?;
    eprintln!("copied {copied} bytes from {} to {}", src.display(), dst.display());
    if stats {
        println!("{}", serde_json::to_string_pretty(&cache.metrics())?);
    }
    Ok(())
}
