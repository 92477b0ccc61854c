//! crashpost - CLI tool for managing the crash report queue
//!
//! This tool provides commands for:
//! - Checking configuration and queue status
//! - Listing, approving and discarding queued reports
//! - Sending approved reports and running startup reconciliation
//! - Filing a report by hand (useful for testing a sender setup)
//!
//! Uses XDG Base Directory specification for file locations:
//! - Reports: $XDG_DATA_HOME/crashpost/reports (~/.local/share/crashpost/reports)
//! - Config: $XDG_CONFIG_HOME/crashpost/config.toml (~/.config/crashpost/config.toml)
//! - Logs: $XDG_STATE_HOME/crashpost/ (~/.local/state/crashpost/)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crashpost_core::{
    Config, CrashContext, ErrorReporter, QueueState, ReportFile, ReportOutcome, Scheduler,
    UserComment,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "crashpost")]
#[command(about = "Manage the crash report queue")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long)]
    verbose: bool,

    /// Report directory (default: from config)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queue status
    Status,

    /// List queued reports, oldest first
    List {
        /// Only approved reports
        #[arg(long, conflicts_with = "pending")]
        approved: bool,

        /// Only pending reports
        #[arg(long)]
        pending: bool,
    },

    /// Send approved reports (one batch)
    Send {
        /// Only send silent reports
        #[arg(long)]
        only_silent: bool,

        /// Use the senders that require the foreground instead of the others
        #[arg(long)]
        foreground_only: bool,
    },

    /// Prune leftover reports as on process start
    Reconcile,

    /// Approve a pending report
    Approve {
        /// Report file name
        file: String,

        /// Comment to attach
        #[arg(long)]
        comment: Option<String>,

        /// Contact email to attach
        #[arg(long)]
        email: Option<String>,
    },

    /// Delete a pending report
    Discard {
        /// Report file name
        file: String,
    },

    /// Clear the rate limiter ledger
    ResetLedger,

    /// File a report by hand
    Report {
        /// Failure message
        #[arg(short, long)]
        message: String,

        /// Exception class (default: "manual")
        #[arg(long, default_value = "manual")]
        class: String,

        /// Mark the report silent (no approval needed)
        #[arg(long)]
        silent: bool,
    },
}

/// Ignores send requests raised while handling a command.
///
/// The reporter runtime stops when a command returns, so reports are only
/// sent by the `send` command.
struct SendCommandOnly;

impl Scheduler for SendCommandOnly {
    fn schedule_send(&self, only_silent: bool) {
        tracing::debug!(only_silent, "Send requested; deferring to the send command");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging if verbose; the guard must live until exit
    let _log_guard = if args.verbose {
        Some(crashpost_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    let mut builder = ErrorReporter::builder(config).scheduler(Arc::new(SendCommandOnly));
    if let Some(dir) = &args.dir {
        builder = builder.report_dir(dir);
    }
    let reporter = builder.build().context("failed to open report queue")?;
    tracing::debug!(report_dir = %reporter.store().root().display(), "Opened report queue");

    match args.command {
        Command::Status => cmd_status(&reporter),
        Command::List { approved, pending } => cmd_list(&reporter, approved, pending),
        Command::Send {
            only_silent,
            foreground_only,
        } => cmd_send(&reporter, only_silent, foreground_only),
        Command::Reconcile => cmd_reconcile(&reporter),
        Command::Approve {
            file,
            comment,
            email,
        } => cmd_approve(&reporter, &file, comment, email),
        Command::Discard { file } => cmd_discard(&reporter, &file),
        Command::ResetLedger => cmd_reset_ledger(&reporter),
        Command::Report {
            message,
            class,
            silent,
        } => cmd_report(&reporter, message, class, silent),
    }
}

fn cmd_status(reporter: &ErrorReporter) -> Result<()> {
    let config = reporter.config();

    println!("crashpost Configuration");
    println!("=======================");
    println!();
    println!("Enabled:         {}", config.reporter.enabled);
    println!("Application:     {} {}", config.reporter.app_name, config.reporter.app_version);
    println!("Report Dir:      {}", reporter.store().root().display());
    println!(
        "Dev Mode:        {}{}",
        config.reporter.dev_mode,
        if config.reporter.sending_suppressed() {
            " (sending suppressed)"
        } else {
            ""
        }
    );

    let senders = reporter.coordinator().sender_names();
    println!(
        "Senders:         {}",
        if senders.is_empty() {
            "<none>".to_string()
        } else {
            senders.join(", ")
        }
    );
    println!("Batch Limit:     {}", config.sending.batch_limit);

    let counts = reporter.store().counts().context("failed to read report queue")?;
    println!();
    println!("Pending:         {}", counts.pending);
    println!("Approved:        {}", counts.approved);

    let limits = &config.limiter;
    println!();
    if limits.enabled {
        println!(
            "Ledger:          {} entries in window (overall limit {})",
            reporter.limiter().entries().len(),
            limits.overall_limit
        );
        println!("Queue Limit:     {}", limits.failed_report_limit);
    } else {
        println!("Ledger:          disabled");
    }

    Ok(())
}

fn cmd_list(reporter: &ErrorReporter, approved_only: bool, pending_only: bool) -> Result<()> {
    let store = reporter.store();
    let files = if approved_only {
        store.list_approved()?
    } else if pending_only {
        store.list_pending()?
    } else {
        store.list_all()?
    };

    if files.is_empty() {
        println!("No reports queued.");
        return Ok(());
    }

    println!("{:<9} {:<7} {:<19} NAME", "STATE", "SILENT", "CREATED");
    for file in &files {
        print_file(file);
    }
    Ok(())
}

fn print_file(file: &ReportFile) {
    println!(
        "{:<9} {:<7} {:<19} {}",
        file.state.as_str(),
        if file.is_silent { "yes" } else { "no" },
        file.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        file.file_name()
    );
}

fn cmd_send(reporter: &ErrorReporter, only_silent: bool, foreground_only: bool) -> Result<()> {
    if reporter.coordinator().sender_names().is_empty() {
        println!("No senders configured. Enable one in config.toml:");
        println!();
        println!("  [http]");
        println!("  enabled = true");
        println!("  url = \"https://reports.example.com/api/crashes\"");
        return Ok(());
    }

    let summary = reporter
        .block_on(reporter.coordinator().send_all(foreground_only, only_silent))?
        .context("failed to send reports")?;

    println!("Attempted:  {}", summary.attempted);
    println!("Sent:       {}", summary.sent);
    println!("Retained:   {}", summary.retained);
    println!("Discarded:  {}", summary.discarded);
    Ok(())
}

fn cmd_reconcile(reporter: &ErrorReporter) -> Result<()> {
    let summary = reporter
        .reconcile_now()
        .context("failed to reconcile reports")?;

    println!("Examined:   {}", summary.examined);
    println!("Skipped:    {}", summary.skipped);
    println!("Deleted:    {}", summary.deleted);
    println!("Approved:   {}", summary.approved);
    println!("Failed:     {}", summary.failed);
    if summary.send_scheduled {
        println!();
        println!("Approved reports remain; run 'send' to deliver them.");
    }
    Ok(())
}

fn cmd_approve(
    reporter: &ErrorReporter,
    file: &str,
    comment: Option<String>,
    email: Option<String>,
) -> Result<()> {
    let comment = if comment.is_some() || email.is_some() {
        Some(UserComment { comment, email })
    } else {
        None
    };

    let approved = reporter
        .approve_pending(file, comment)
        .with_context(|| format!("failed to approve {}", file))?;
    println!("Approved {}", approved.file_name());
    Ok(())
}

fn cmd_discard(reporter: &ErrorReporter, file: &str) -> Result<()> {
    reporter
        .discard_pending(file)
        .with_context(|| format!("failed to discard {}", file))?;
    println!("Discarded {}", file);
    Ok(())
}

fn cmd_reset_ledger(reporter: &ErrorReporter) -> Result<()> {
    let entries = reporter.limiter().entries().len();
    reporter
        .limiter()
        .reset()
        .context("failed to reset limiter ledger")?;
    println!("Cleared {} ledger entries", entries);
    Ok(())
}

fn cmd_report(reporter: &ErrorReporter, message: String, class: String, silent: bool) -> Result<()> {
    let trace = format!("{}: {}", class, message);
    let mut ctx = CrashContext::new()
        .with_message(message)
        .with_exception(class, trace);
    if silent {
        ctx = ctx.silent();
    }

    let outcome = reporter
        .block_on(reporter.handle(ctx))?
        .context("failed to file report")?;

    match outcome {
        ReportOutcome::Disabled => println!("Reporting is disabled."),
        ReportOutcome::Dropped(reason) => println!("Dropped: {}", reason),
        ReportOutcome::Queued(file) | ReportOutcome::Approved(file) => {
            let next = match file.state {
                QueueState::Pending => "awaiting approval",
                QueueState::Approved => "ready to send",
            };
            println!("{} ({})", file.file_name(), next);
        }
    }
    Ok(())
}
