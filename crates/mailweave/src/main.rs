//! `mailweave` - terminal email client
//!
//! Reads commands from stdin and drives the synchronization engine of
//! `mailweave-core`.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod frontend;
mod settings;

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, bail};
use mailweave_core::credentials::{Protocol, store_password};
use mailweave_core::{MailStore, StatusLog};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use frontend::LineFrontend;
use settings::{LogSettings, Settings};

const DEFAULT_FILTER: &str = "mailweave=info,mailweave_core=info";

const USAGE: &str = "usage: mailweave [CONFIG] | mailweave set-password <account> <imap|smtp>";

/// Reads a password from stdin and stores it in the system keyring.
fn set_password(account: &str, protocol: &str) -> anyhow::Result<()> {
    let protocol = match protocol {
        "imap" => Protocol::Imap,
        "smtp" => Protocol::Smtp,
        other => bail!("unknown protocol `{other}`\n{USAGE}"),
    };

    eprint!("password for {account}: ");
    let mut password = String::new();
    std::io::stdin()
        .read_line(&mut password)
        .context("reading password")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("empty password");
    }

    store_password(account, protocol, password)?;
    eprintln!("stored");
    Ok(())
}

fn init_tracing(log: &LogSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log.level.as_deref().unwrap_or(DEFAULT_FILTER)))
        .context("invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    if let Some(path) = &log.output {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // stdout belongs to the front end.
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let explicit = match args.as_slice() {
        [] => None,
        [flag] if flag == "-h" || flag == "--help" => {
            println!("{USAGE}");
            return Ok(());
        }
        [cmd, account, protocol] if cmd == "set-password" => return set_password(account, protocol),
        [path] => Some(PathBuf::from(path)),
        _ => bail!("{USAGE}"),
    };
    let config = settings::config_path(explicit);
    let data_dir = settings::data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("creating {}", data_dir.display()))?;

    let settings = Settings::load(&config, &data_dir).await?;
    init_tracing(&settings.log)?;

    std::panic::set_hook(Box::new(|panic| {
        error!("{panic}");
    }));

    info!("Starting mailweave with {}", config.display());

    let store = MailStore::new(&data_dir.join("mailweave.db"))
        .await
        .context("opening the mail store")?;

    let (commands_tx, commands_rx) = mpsc::channel(16);
    std::thread::spawn(move || frontend::read_commands(std::io::stdin().lock(), &commands_tx));

    let control = tokio::spawn(async move {
        let status = StatusLog::new();
        let mut orchestrator = mailweave_core::start(
            &settings.accounts,
            store,
            &settings.engine,
            status.clone(),
        );
        let mut frontend = LineFrontend::new(status, settings.filters);
        orchestrator.run(&mut frontend, commands_rx).await;
        orchestrator.shutdown().await;
    });

    if let Err(e) = control.await
        && e.is_panic()
    {
        frontend::restore();
        eprintln!("mailweave crashed, see the log for details");
        std::process::exit(1);
    }

    frontend::restore();
    info!("Bye");
    Ok(())
}
