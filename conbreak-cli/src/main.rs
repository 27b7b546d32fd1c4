//! conbreak CLI - コマンドラインインターフェース
//!
//! レース検出器のレポートを読み込み、デバッグ対象を起動（またはアタッチ）して
//! ブレークポイント駆動のスケジューラでデータ競合の再現を試みます。

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use conbreak_core::{
    load_race, RaceDescriptor, Scheduler, SchedulerConfig, SessionLog, SourceTree, Substrate, Verdict,
};
use conbreak_target::PtraceSubstrate;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// conbreak - Breakpoint-driven data race reproducer
#[derive(Parser)]
#[command(name = "conbreak")]
#[command(version)]
#[command(about = "Reproduce a reported data race by steering thread interleavings with breakpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: TargetCommand,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Subcommand)]
enum TargetCommand {
    /// Launch and steer an executable
    Run {
        /// Path to the executable binary
        binary: PathBuf,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Path to the executable binary
        binary: PathBuf,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Race report with the write and read locations
    #[arg(long, global = true, default_value = "report.txt")]
    report: PathBuf,

    /// Directory holding the target's source code
    #[arg(long, global = true, default_value = "source_code")]
    source_root: PathBuf,

    /// Session log file
    #[arg(long, global = true, default_value = "conbreak_out.txt")]
    log: PathBuf,

    /// TOML file with scheduler settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// File whose first line supplies the target arguments
    #[arg(long, global = true)]
    args_file: Option<PathBuf>,

    /// Echo the session log to stdout and disable the startup timeout
    #[arg(long, global = true)]
    interactive: bool,

    /// Release a parked thread after this many milliseconds without activity
    #[arg(long, global = true)]
    stability_window_ms: Option<u64>,

    /// Give up after this many milliseconds without breakpoint activity
    #[arg(long, global = true)]
    kill_timeout_ms: Option<u64>,

    /// Give up if no breakpoint is hit within this many milliseconds
    #[arg(long, global = true)]
    startup_timeout_ms: Option<u64>,

    /// Attempts for each process/thread control operation
    #[arg(long, global = true)]
    retry_attempts: Option<u32>,

    /// Seed for choosing which parked thread to release
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Enable trace-level diagnostics on stderr
    #[arg(long, global = true)]
    debug: bool,
}

impl SessionArgs {
    /// 既定値 → TOMLファイル → コマンドライン引数 の順に設定を組み立てる
    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => SchedulerConfig::load(path)?,
            None => SchedulerConfig::default(),
        };

        if self.interactive {
            config.interactive = true;
        }
        if let Some(ms) = self.stability_window_ms {
            config.stability_window_ms = ms;
        }
        if let Some(ms) = self.kill_timeout_ms {
            config.kill_timeout_ms = ms;
        }
        if let Some(ms) = self.startup_timeout_ms {
            config.startup_timeout_ms = ms;
        }
        if let Some(attempts) = self.retry_attempts {
            config.retry_attempts = attempts;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(config)
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.session.debug);

    let config = cli.session.scheduler_config()?;
    let log = Arc::new(
        SessionLog::create(&cli.session.log, config.interactive)
            .with_context(|| format!("Failed to create session log {:?}", cli.session.log))?,
    );

    let substrate = match launch(&cli.command, &cli.session) {
        Ok(substrate) => substrate,
        Err(e) => return Ok(fail(&log, format!("{:#}", e))),
    };

    let race = match locate_race(&cli.session, &substrate) {
        Ok(race) => race,
        Err(e) => return Ok(fail(&log, format!("{:#}", e))),
    };

    let verdict = steer(substrate, race, config, Arc::clone(&log))?;
    println!("{}", verdict);
    Ok(exit_code(&verdict))
}

/// tracing の出力先（stderr）とフィルタを設定する
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// デバッグ対象を起動またはアタッチする
fn launch(command: &TargetCommand, session: &SessionArgs) -> Result<PtraceSubstrate> {
    match command {
        TargetCommand::Run { binary, args } => {
            let args = if args.is_empty() {
                match &session.args_file {
                    Some(path) => read_args_file(path)?,
                    None => Vec::new(),
                }
            } else {
                args.clone()
            };
            tracing::info!("launching {:?} {:?}", binary, args);
            PtraceSubstrate::launch(binary, &args)
        }
        TargetCommand::Attach { binary, pid } => {
            tracing::info!("attaching to {} ({:?})", pid, binary);
            PtraceSubstrate::attach(binary, *pid)
        }
    }
}

/// 引数ファイルの1行目を空白で区切って引数にする
fn read_args_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(text
        .lines()
        .next()
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default())
}

/// レポートを読み込み、各位置のソース行を取得する
///
/// ソースツリーにない場合はデバッグ情報に記録されたパスから読みます。
fn locate_race(session: &SessionArgs, substrate: &PtraceSubstrate) -> Result<RaceDescriptor> {
    let tree = SourceTree::new(&session.source_root);
    let race = load_race(&session.report, |file, line| match tree.line_text(file, line) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::debug!("{}; falling back to debug info paths", e);
            substrate.source_line_text(file, line)
        }
    })?;
    Ok(race)
}

/// ブレークポイントを設置して対象を走らせ、判定が出るまでスケジューラを回す
fn steer(
    substrate: PtraceSubstrate,
    race: RaceDescriptor,
    config: SchedulerConfig,
    log: Arc<SessionLog>,
) -> Result<Verdict> {
    let mut scheduler = Scheduler::new(substrate, race, config, Arc::clone(&log));
    if let Err(e) = scheduler.arm() {
        log.error(&e);
        let verdict = Verdict::Failed(e.to_string());
        scheduler.terminate(verdict.clone());
        return Ok(verdict);
    }

    if let Err(e) = scheduler.start() {
        let verdict = Verdict::Failed(format!("failed to start target: {}", e));
        log.error(&e);
        scheduler.terminate(verdict.clone());
        return Ok(verdict);
    }

    Ok(scheduler.run()?)
}

/// ブレークポイント設置前の失敗をセッションログに記録する
fn fail(log: &SessionLog, reason: String) -> ExitCode {
    log.error(&reason);
    let verdict = Verdict::Failed(reason);
    log.line(format!("####### {} #######", verdict.log_line()));
    log.close();
    eprintln!("{}", verdict);
    exit_code(&verdict)
}

fn exit_code(verdict: &Verdict) -> ExitCode {
    ExitCode::from(verdict.exit_code() as u8)
}
