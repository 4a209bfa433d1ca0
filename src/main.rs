use clap::Parser as ClapParser;
use log::{error, LevelFilter};
use regex::Regex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use wastrun::config::{DEFAULT_WORKER, HarnessConfig};
use wastrun::report::Summary;
use wastrun::run_script;

const DEFAULT_DIR: &str = "test/spec/json";

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Run wast2json conformance scripts against a WebAssembly runtime", long_about = None)]
struct Cli {
    /// Script files to run; overrides --dir
    #[arg(long = "file", value_name = "PATH")]
    files: Vec<PathBuf>,

    /// Directory of *.json scripts
    #[arg(long, default_value = DEFAULT_DIR)]
    dir: PathBuf,

    /// Only run scripts whose stem matches this glob, e.g. `i32*`
    #[arg(long)]
    filter: Option<String>,

    /// Runtime binary under test
    #[arg(long, env = "WASTRUN_WORKER", default_value = DEFAULT_WORKER)]
    worker: PathBuf,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Per-wait timeout in seconds
    #[arg(long, default_value_t = 60)]
    thread_timeout: u64,

    /// Failures tolerated before exiting non-zero
    #[arg(long, default_value_t = 0)]
    allow_failures: usize,

    /// Print every failure
    #[arg(short, long)]
    verbose: bool,

    /// Print a PASS/FAIL line per file
    #[arg(long)]
    summary: bool,
}

/// Translate a shell-style glob into an anchored regex.
fn glob_regex(glob: &str) -> Result<Regex, regex::Error> {
    let pattern = regex::escape(glob).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{pattern}$"))
}

fn script_files(cli: &Cli) -> io::Result<Vec<PathBuf>> {
    if !cli.files.is_empty() {
        return Ok(cli.files.clone());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(&cli.dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |e| e == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { LevelFilter::Info } else { LevelFilter::Warn };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    let config = HarnessConfig::default()
        .with_worker(&cli.worker)
        .with_call_timeout(Duration::from_secs(cli.timeout))
        .with_thread_timeout(Duration::from_secs(cli.thread_timeout))
        .with_allowed_failures(cli.allow_failures)
        .with_verbose(cli.verbose);

    let filter = match cli.filter.as_deref().map(glob_regex).transpose() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Bad --filter: {e}");
            process::exit(2);
        }
    };

    let mut files = match script_files(&cli) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("Error reading {}: {e}", cli.dir.display());
            process::exit(2);
        }
    };
    if let Some(filter) = &filter {
        files.retain(|f| filter.is_match(&stem(f)));
    }
    if files.is_empty() {
        eprintln!("No test files found");
        process::exit(2);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut summary = Summary::default();
    for file in &files {
        match run_script(&config, file) {
            Ok(report) => {
                if cli.summary || config.verbose || report.tally.failed > 0 {
                    let _ = Summary::write_file_line(&mut out, &report, config.verbose);
                }
                summary.add(report);
            }
            Err(e) => {
                error!("{}: {e}", file.display());
                let _ = writeln!(out, "  ERROR {}: {e}", stem(file));
                summary.add_error(stem(file), e);
            }
        }
    }
    if let Err(e) = summary.write_totals(&mut out) {
        eprintln!("Error writing summary: {e}");
        process::exit(2);
    }
    let _ = out.flush();

    if !summary.is_success(config.allowed_failures) {
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs() {
        let re = glob_regex("i32*").unwrap();
        assert!(re.is_match("i32"));
        assert!(re.is_match("i32_ops"));
        assert!(!re.is_match("xi32"));
        let re = glob_regex("f?4.x").unwrap();
        assert!(re.is_match("f64.x"));
        assert!(!re.is_match("f64_x"));
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["wastrun"]);
        assert_eq!(cli.dir, PathBuf::from(DEFAULT_DIR));
        assert_eq!(cli.timeout, 10);
        assert_eq!(cli.allow_failures, 0);
        let cli = Cli::parse_from(["wastrun", "--file", "a.json", "--file", "b.json", "-v"]);
        assert_eq!(cli.files.len(), 2);
        assert!(cli.verbose);
    }
}
