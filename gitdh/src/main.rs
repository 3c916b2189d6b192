//! `git-dh`: deploy git branches from post-receive hooks and cron jobs.
//!
//! Product output goes to stdout as `key=value` lines, diagnostics to stderr.
//! The exit code is one of [`gitdh::exit_codes`].

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{ArgAction, Args, Parser, Subcommand};

use gitdh::core::install::{
    CRON_DIR, CRON_MODE, DEFAULT_CRON_INTERVAL, DEFAULT_MAILTO, HOOK_MODE, parse_mode,
};
use gitdh::deploy::DeployConfig;
use gitdh::exit_codes;
use gitdh::install::{CronInstall, install_cron, install_post_receive};
use gitdh::io::install::InstallOptions;
use gitdh::logging;
use gitdh::orchestrate::{PushLine, TargetReport, run_cron, run_post_receive};
use gitdh::pool::DEFAULT_WORKERS;

#[derive(Parser)]
#[command(
    name = "git-dh",
    version,
    about = "Deploy git branches automatically from post-receive hooks and cron jobs"
)]
struct Cli {
    /// Raise diagnostic verbosity on stderr (repeatable).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Branches checked and deployed concurrently.
    #[arg(short = 'j', long, default_value_t = DEFAULT_WORKERS, value_parser = parse_jobs, global = true)]
    jobs: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every configured branch of each target and deploy the ones that moved.
    Cron {
        /// Configuration files or repositories.
        #[arg(required = true)]
        targets: Vec<PathBuf>,
    },
    /// Deploy one ref update as reported by a post-receive hook.
    Postreceive {
        /// Configuration file or repository.
        target: PathBuf,
        oldrev: String,
        newrev: String,
        refname: String,
    },
    /// Install post-receive hooks or cron jobs.
    Install {
        #[command(subcommand)]
        command: InstallCommand,
    },
}

#[derive(Subcommand)]
enum InstallCommand {
    /// Write a post-receive hook into each target's repository.
    Postreceive {
        #[arg(required = true)]
        targets: Vec<PathBuf>,
        #[command(flatten)]
        flags: InstallFlags,
        /// Permission bits of the hook (octal).
        #[arg(short, long, default_value = HOOK_MODE)]
        mode: String,
    },
    /// Write a cron job polling every target.
    Cron {
        /// File name of the cron job.
        name: String,
        #[arg(required = true)]
        targets: Vec<PathBuf>,
        #[command(flatten)]
        flags: InstallFlags,
        /// User running the job (defaults to the current user).
        #[arg(short, long)]
        user: Option<String>,
        #[arg(long, default_value = DEFAULT_MAILTO)]
        mailto: String,
        /// PATH for the job (defaults to the current PATH).
        #[arg(long = "unixPath", alias = "path")]
        unix_path: Option<String>,
        /// Cron schedule.
        #[arg(short, long, default_value = DEFAULT_CRON_INTERVAL)]
        interval: String,
        /// Permission bits of the cron file (octal).
        #[arg(short, long, default_value = CRON_MODE)]
        mode: String,
    },
}

#[derive(Args)]
struct InstallFlags {
    /// Only print the files' content.
    #[arg(short = 'p', long = "printOnly", alias = "print")]
    print_only: bool,
    /// Overwrite existing files.
    #[arg(short, long)]
    force: bool,
    /// Only print errors.
    #[arg(short, long)]
    quiet: bool,
}

impl InstallFlags {
    fn options(&self, mode: &str) -> Result<InstallOptions> {
        let mode = parse_mode(mode).ok_or_else(|| anyhow!("invalid mode '{mode}'"))?;
        Ok(InstallOptions {
            print_only: self.print_only,
            force: self.force,
            quiet: self.quiet,
            mode,
        })
    }
}

fn parse_jobs(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(jobs) if jobs > 0 => Ok(jobs),
        _ => Err(format!("expected a positive number, got '{raw}'")),
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("git-dh: {:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let deploy = DeployConfig {
        workers: cli.jobs,
        ..DeployConfig::default()
    };
    match cli.command {
        Command::Cron { targets } => {
            let report = run_cron(&targets, &deploy, print_target)?;
            Ok(report.exit_code())
        }
        Command::Postreceive {
            target,
            oldrev,
            newrev,
            refname,
        } => {
            let line = PushLine {
                oldrev,
                newrev,
                refname,
            };
            let report = run_post_receive(&target, &line, &deploy)?;
            report.targets.iter().for_each(print_target);
            Ok(report.exit_code())
        }
        Command::Install { command } => {
            let lines = match command {
                InstallCommand::Postreceive {
                    targets,
                    flags,
                    mode,
                } => install_post_receive(&targets, &flags.options(&mode)?)?,
                InstallCommand::Cron {
                    name,
                    targets,
                    flags,
                    user,
                    mailto,
                    unix_path,
                    interval,
                    mode,
                } => {
                    let cron = CronInstall {
                        name,
                        user,
                        mailto,
                        unix_path,
                        interval,
                        cron_dir: PathBuf::from(CRON_DIR),
                    };
                    install_cron(&cron, &targets, &flags.options(&mode)?)?
                }
            };
            for line in lines {
                println!("{line}");
            }
            Ok(exit_codes::OK)
        }
    }
}

fn print_target(report: &TargetReport) {
    for line in report.lines() {
        println!("{line}");
    }
}
