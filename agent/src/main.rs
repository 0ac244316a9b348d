//! `patch-agent` command-line entry point.
//!
//! `run` turns a task file into a verified, published change. `check` runs the
//! extractor and validator over a saved model response. `config` prints the
//! effective configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use patch_agent::check::check_response;
use patch_agent::exit_codes;
use patch_agent::io::config::{AgentConfig, DEFAULT_CONFIG_FILE, load_effective_config, render_config};
use patch_agent::io::harness::CommandHarness;
use patch_agent::io::hosting::GitHubHost;
use patch_agent::io::model::OllamaBackend;
use patch_agent::logging;
use patch_agent::run::{AgentError, RunOptions, run_agent};

#[derive(Parser)]
#[command(
    name = "patch-agent",
    version,
    about = "Generate, verify and publish a code change from a task description"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the generate/apply/test/repair loop and publish the result.
    Run {
        /// File containing the natural-language task.
        #[arg(long)]
        task_file: PathBuf,
        /// Branch to create or reset (default `agent/<YYYYMMDD-HHMMSS>`).
        #[arg(long)]
        branch: Option<String>,
        /// Open a pull request after pushing.
        #[arg(long)]
        pr: bool,
        /// Repository root.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Config file (default `<repo>/patch-agent.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override `max_diff_attempts`.
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Override the sampling temperature.
        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Extract and validate a saved model response without touching the repository.
    Check {
        response_file: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run {
            task_file,
            branch,
            pr,
            repo,
            config,
            max_attempts,
            temperature,
        } => cmd_run(
            RunOptions {
                task_file,
                branch,
                repo,
            },
            pr,
            config,
            max_attempts,
            temperature,
        ),
        Command::Check {
            response_file,
            config,
        } => report(cmd_check(&response_file, config)),
        Command::Config { repo, config } => report(cmd_config(&repo, config)),
    };
    std::process::exit(code);
}

fn report(result: Result<i32>) -> i32 {
    result.unwrap_or_else(|err| {
        eprintln!("error: {err:#}");
        exit_codes::INVALID
    })
}

fn config_path(repo: &Path, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| repo.join(DEFAULT_CONFIG_FILE))
}

fn effective_config(
    repo: &Path,
    explicit: Option<PathBuf>,
    max_attempts: Option<u32>,
    temperature: Option<f32>,
) -> Result<AgentConfig> {
    let mut cfg = load_effective_config(&config_path(repo, explicit))?;
    if let Some(max) = max_attempts {
        cfg.max_diff_attempts = max;
    }
    if let Some(temperature) = temperature {
        cfg.temperature = temperature;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn cmd_run(
    options: RunOptions,
    pr: bool,
    config: Option<PathBuf>,
    max_attempts: Option<u32>,
    temperature: Option<f32>,
) -> i32 {
    let setup = (|| -> Result<(AgentConfig, OllamaBackend, Option<GitHubHost>)> {
        let cfg = effective_config(&options.repo, config, max_attempts, temperature)?;
        let model = OllamaBackend::new(&cfg.model)?;
        let host = if pr {
            Some(GitHubHost::from_env(&cfg.github).context("pull request requested")?)
        } else {
            None
        };
        Ok((cfg, model, host))
    })();
    let (cfg, model, host) = match setup {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("error: {err:#}");
            return exit_codes::INVALID;
        }
    };
    let harness = CommandHarness::new(&options.repo, &cfg.harness);

    match run_agent(&options, &cfg, &model, &harness, host.as_ref()) {
        Ok(report) => {
            println!("branch: {}", report.publication.branch);
            if let Some(pr) = &report.publication.pull_request {
                println!("pull request: {}", pr.url);
            }
            println!(
                "attempts: {} (repair rounds: {})",
                report.session.attempts.len(),
                report.session.repair_attempts
            );
            println!("attempt log: {}", report.log_dir.display());
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("error: {err}");
            if let AgentError::Publish(_) = err {
                eprintln!("the verified change is committed locally");
            }
            err.exit_code()
        }
    }
}

fn cmd_check(response_file: &Path, config: Option<PathBuf>) -> Result<i32> {
    let cfg = effective_config(Path::new("."), config, None, None)?;
    let response = fs::read_to_string(response_file)
        .with_context(|| format!("read {}", response_file.display()))?;
    match check_response(&response, &cfg.validator)? {
        Ok(diff) => {
            print!("{diff}");
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("rejected ({}): {err}", err.kind());
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_config(repo: &Path, config: Option<PathBuf>) -> Result<i32> {
    let cfg = effective_config(repo, config, None, None)?;
    print!("{}", render_config(&cfg)?);
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_defaults() {
        let cli = Cli::parse_from(["patch-agent", "run", "--task-file", "task.md"]);
        match cli.command {
            Command::Run {
                task_file,
                branch,
                pr,
                repo,
                max_attempts,
                ..
            } => {
                assert_eq!(task_file, PathBuf::from("task.md"));
                assert_eq!(branch, None);
                assert!(!pr);
                assert_eq!(repo, PathBuf::from("."));
                assert_eq!(max_attempts, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "patch-agent",
            "run",
            "--task-file",
            "task.md",
            "--branch",
            "agent/clamp",
            "--pr",
            "--max-attempts",
            "5",
            "--temperature",
            "0.5",
        ]);
        assert!(matches!(
            cli.command,
            Command::Run {
                pr: true,
                max_attempts: Some(5),
                ..
            }
        ));
    }

    #[test]
    fn run_requires_task_file() {
        assert!(Cli::try_parse_from(["patch-agent", "run"]).is_err());
    }

    #[test]
    fn cli_overrides_are_validated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = effective_config(temp.path(), None, Some(7), Some(0.0)).expect("config");
        assert_eq!(cfg.max_diff_attempts, 7);
        assert!(effective_config(temp.path(), None, Some(0), None).is_err());
    }
}
