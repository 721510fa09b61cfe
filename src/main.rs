use anyhow::{Context, Result};
use clap::Parser;
use feedrelay::{feed, Config, CursorStore, ExportOptions, Fetcher, Session};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Get the config directory path (~/.config/feedrelay/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedrelay"))
}

/// Atomically write a file using write-to-temp-then-rename pattern.
/// This ensures the destination is never left in a partial state.
fn atomic_write(dst: &Path, content: &[u8]) -> Result<()> {
    // Randomized temp filename so a stale or hostile file at a predictable path is never reused
    use std::time::{SystemTime, UNIX_EPOCH};
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions or disk space",
                temp_path.display()
            )
        })?;

    temp_file.write_all(content).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to write to temporary file '{}': disk may be full",
            temp_path.display()
        )
    })?;

    temp_file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to sync temporary file '{}' to disk: disk may be full",
            temp_path.display()
        )
    })?;

    drop(temp_file);

    // On Windows, rename fails if destination exists, so remove it first
    #[cfg(windows)]
    if dst.exists() {
        std::fs::remove_file(dst).with_context(|| {
            let _ = std::fs::remove_file(&temp_path);
            format!(
                "Failed to remove existing '{}' before atomic replace",
                dst.display()
            )
        })?;
    }

    std::fs::rename(&temp_path, dst).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}': check permissions",
            temp_path.display(),
            dst.display()
        )
    })?;

    Ok(())
}

fn load_cursors(path: &Path) -> Result<CursorStore> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(CursorStore::new()),
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cursor store '{}'", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No cursor store found, starting fresh");
            Ok(CursorStore::new())
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read cursor store '{}'", path.display()))
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "feedrelay",
    about = "Poll RSS feeds once and print the items not seen before"
)]
struct Args {
    /// Config file (default: ~/.config/feedrelay/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cursor store (default: cursors.json next to the config file)
    #[arg(long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Forget every seen item before polling
    #[arg(long)]
    reset_state: bool,

    /// Include the source registry in the output
    #[arg(long)]
    sources: bool,

    /// Include destination routing in the output
    #[arg(long)]
    destinations: bool,

    /// Include cursors in the output
    #[arg(long)]
    cursors: bool,

    /// Include per-source failures in the output
    #[arg(long)]
    failures: bool,

    /// Leave new items out of the output
    #[arg(long)]
    no_data: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => get_config_dir()?.join("config.toml"),
    };
    let state_path = match &args.state {
        Some(path) => path.clone(),
        None => config_path.with_file_name("cursors.json"),
    };

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    if args.reset_state && state_path.exists() {
        std::fs::remove_file(&state_path).context("Failed to delete cursor store")?;
        eprintln!("Cursor store reset.");
    }

    let cursors = load_cursors(&state_path)?;
    let mut session = Session::from_config(&config).with_cursors(cursors);
    let fetcher = Fetcher::from_config(&config).context("Failed to build HTTP client")?;
    tracing::debug!(
        sources = session.sources().len(),
        max_concurrent = fetcher.options().max_concurrent,
        retries = fetcher.options().retry.max_retries,
        "Starting poll"
    );

    if fetcher.fetch(&mut session, None).await.is_none() {
        eprintln!("No feeds configured in {}", config_path.display());
        eprintln!();
        eprintln!("Add a [sources] table, for example:");
        eprintln!("  [sources]");
        eprintln!("  example = \"https://example.com/feed.xml\"");
        return Ok(());
    }

    if let Some(parsed) = feed::parse(&mut session) {
        let fresh: usize = parsed.values().map(Vec::len).sum();
        tracing::info!(sources = parsed.len(), new_items = fresh, "Poll complete");
    }

    let export = session.export(ExportOptions {
        data: !args.no_data,
        sources: args.sources,
        destinations: args.destinations,
        cursors: args.cursors,
        failures: args.failures,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&export).context("Failed to serialize output")?
    );

    if let Some(parent) = state_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let cursors = session.into_cursors();
    let encoded = serde_json::to_vec_pretty(&cursors).context("Failed to encode cursors")?;
    atomic_write(&state_path, &encoded)?;
    tracing::debug!(path = %state_path.display(), "Cursor store saved");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = std::env::temp_dir().join("feedrelay_main_test_atomic");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cursors.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        // No temp files left behind
        let leftovers = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp."))
            .count();
        assert_eq!(leftovers, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_cursors_missing_file_is_empty() {
        let path = Path::new("/tmp/feedrelay_test_nonexistent_cursors.json");
        assert!(load_cursors(path).unwrap().is_empty());
    }

    #[test]
    fn test_load_cursors_accepts_legacy_strings() {
        let dir = std::env::temp_dir().join("feedrelay_main_test_legacy");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cursors.json");
        std::fs::write(&path, r#"{"feedA": "g1", "feedB": ["x", "y"]}"#).unwrap();

        let cursors = load_cursors(&path).unwrap();
        assert_eq!(cursors["feedA"].last(), "g1");
        assert_eq!(cursors["feedB"].last(), "y");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_cursors_rejects_garbage() {
        let dir = std::env::temp_dir().join("feedrelay_main_test_garbage");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cursors.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(load_cursors(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
