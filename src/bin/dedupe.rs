use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use musickera::duplicates::{DuplicateReport, RemovalMode, RemovalStatus, remove_duplicates, scan_tree};

#[derive(Parser)]
#[command(name = "dedupe")]
#[command(about = "Find and remove duplicate tracks, keeping the best format", long_about = None)]
struct Cli {
    /// Directory to clean
    #[arg(env = "MUSIC_DIR", default_value = "musics")]
    dir: PathBuf,

    /// Also clean every playlist directory inside `dir`
    #[arg(short, long)]
    recursive: bool,

    /// Delete the duplicates instead of only listing them
    #[arg(long)]
    apply: bool,

    /// Do not ask for confirmation before deleting
    #[arg(short, long)]
    yes: bool,
}

fn run(dir: &Path, recursive: bool, mode: RemovalMode) -> Result<Vec<DuplicateReport>> {
    if recursive {
        scan_tree(dir, mode)
    } else {
        Ok(vec![remove_duplicates(dir, mode)?])
    }
}

fn print_report(report: &DuplicateReport) {
    if report.groups.is_empty() {
        println!("{}: no duplicates", report.directory.display());
        return;
    }

    println!(
        "{}: {} songs with duplicates",
        report.directory.display(),
        report.groups.len()
    );
    for group in &report.groups {
        println!("  {}", group.identity);
        println!("    KEEP:   {}", group.keep);
        for outcome in &group.remove {
            match (&outcome.status, &outcome.error) {
                (RemovalStatus::Failed, Some(error)) => {
                    println!("    FAILED: {} ({})", outcome.file, error)
                }
                (RemovalStatus::Removed, _) => println!("    REMOVED: {}", outcome.file),
                _ => println!("    REMOVE: {}", outcome.file),
            }
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} (y/N): ", prompt);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read answer")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let cli = Cli::parse();

    if !cli.dir.is_dir() {
        anyhow::bail!("Directory does not exist: {}", cli.dir.display());
    }

    let preview = run(&cli.dir, cli.recursive, RemovalMode::Preview)?;
    for report in &preview {
        print_report(report);
    }

    let planned: usize = preview.iter().map(|r| r.planned).sum();
    if planned == 0 {
        return Ok(());
    }

    if !cli.apply {
        println!("\nDRY RUN: would remove {} files. Re-run with --apply to delete them.", planned);
        return Ok(());
    }

    if !cli.yes && !confirm(&format!("\nRemove {} duplicate files?", planned))? {
        println!("Operation cancelled.");
        return Ok(());
    }

    let applied = run(&cli.dir, cli.recursive, RemovalMode::Delete)?;
    for report in &applied {
        print_report(report);
    }

    let removed: usize = applied.iter().map(|r| r.removed).sum();
    let failed: usize = applied.iter().map(|r| r.failed).sum();
    println!("\nRemoved {} files, {} failures.", removed, failed);

    if failed > 0 {
        anyhow::bail!("{} files could not be removed", failed);
    }
    Ok(())
}
