//! smsarchive - command-line client for the SMS archive backend.
//!
//! Logs in, keeps the session fresh, and follows streaming import jobs.

use std::io::{self, Write};

use anyhow::Result;
use smsarchive_core::api::DEFAULT_IMPORT_POLL_INTERVAL;
use smsarchive_core::{ApiError, ArchiveContext, Config};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name in the cache directory
const LOG_FILE: &str = "smsarchive.log";

const USAGE: &str = "\
Usage: smsarchive <command>

Commands:
  login [username]                 Log in and store the session
  register [username]              Create an account and log in
  logout                           Forget the stored session
  status                           Show session status
  whoami                           Show the logged-in user
  import-progress <job-id> [--wait] Show (or follow) an import job
";

/// Initialize the tracing subscriber for logging.
///
/// Console output honours `RUST_LOG` (default `warn`); the log file in the
/// cache directory always records `debug` and above for this crate.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let console = fmt::layer().with_writer(io::stderr).with_filter(filter);

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("smsarchive_core=debug,smsarchive=debug"));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default()
        }
    };
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let ctx = ArchiveContext::from_config(&config)?;
    let restored = ctx.session.hydrate().await?;
    info!(restored, "Session hydrated");

    let result = match command.as_str() {
        "login" => authenticate(&ctx, &mut config, args.get(1), false).await,
        "register" => authenticate(&ctx, &mut config, args.get(1), true).await,
        "logout" => {
            ctx.session.logout()?;
            println!("Logged out.");
            Ok(())
        }
        "status" => {
            println!("Status: {}", ctx.session.status());
            if let Some(user) = ctx.session.user() {
                println!("User:   {}", user.username);
            }
            Ok(())
        }
        "whoami" => whoami(&ctx).await,
        "import-progress" => {
            let Some(job_id) = args.get(1) else {
                eprint!("{}", USAGE);
                return Ok(());
            };
            let wait = args.iter().any(|a| a == "--wait");
            import_progress(&ctx, job_id, wait).await
        }
        "-h" | "--help" | "help" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    };

    if let Err(ref e) = result {
        if let Some(api_error) = e.downcast_ref::<ApiError>() {
            if api_error.is_session_ended() {
                eprintln!("Session ended. Please run `smsarchive login`.");
            }
        }
    }
    result
}

async fn authenticate(
    ctx: &ArchiveContext,
    config: &mut Config,
    username_arg: Option<&String>,
    register: bool,
) -> Result<()> {
    let username = match username_arg {
        Some(u) => u.clone(),
        None => std::env::var("SMS_ARCHIVE_USERNAME")
            .ok()
            .map_or_else(|| prompt_username(config.last_username.as_deref()), Ok)?,
    };
    let secret = match std::env::var("SMS_ARCHIVE_PASSWORD") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => rpassword::prompt_password("Password: ")?,
    };

    let profile = if register {
        ctx.session.register(&username, &secret).await
    } else {
        ctx.session.login(&username, &secret).await
    };
    let profile = match profile {
        Ok(profile) => profile,
        Err(ApiError::InvalidCredentials) => {
            return Err(anyhow::anyhow!("Invalid username or password"));
        }
        Err(e) => return Err(e.into()),
    };

    config.last_username = Some(username.trim().to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    match profile {
        Some(user) => println!("Logged in as {}.", user.username),
        None => println!("Logged in."),
    }
    Ok(())
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    Ok(match (input.is_empty(), last) {
        (true, Some(last)) => last.to_string(),
        _ => input.to_string(),
    })
}

async fn whoami(ctx: &ArchiveContext) -> Result<()> {
    if !ctx.session.is_authenticated() {
        println!("Not logged in.");
        return Ok(());
    }
    let user = ctx.session.fetch_profile().await?;
    println!("{}", user.username);
    if let Some(since) = user.member_since() {
        println!("Member since {}", since);
    }
    Ok(())
}

async fn import_progress(ctx: &ArchiveContext, job_id: &str, wait: bool) -> Result<()> {
    if !wait {
        let progress = ctx.api.import_progress(job_id).await?;
        println!("{}", progress.summary());
        return Ok(());
    }

    let progress = ctx
        .api
        .wait_for_import(job_id, DEFAULT_IMPORT_POLL_INTERVAL, |p| {
            println!("{}", p.summary())
        })
        .await?;
    if progress.status == smsarchive_core::ImportStatus::Failed {
        return Err(anyhow::anyhow!(
            "Import failed: {}",
            progress.error.unwrap_or_else(|| "unknown error".to_string())
        ));
    }
    Ok(())
}
