use std::collections::BTreeMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dmclient::{
    ClientConfig, ClientError, DISCONNECTED_TAG, EventDispatcher, EventRecord, Session, SyncOutcome,
};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("missing login; pass --login or set DMCLIENT_LOGIN")]
    MissingLogin,
    #[error("missing password; pass --password or set DMCLIENT_PASSWORD")]
    MissingPassword,
    #[error("invalid field `{0}`; expected key=value")]
    InvalidField(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "dmclient", about = "Console client for a dungeon master server")]
struct Cli {
    #[arg(long, env = "DMCLIENT_HOST", default_value = "127.0.0.1")]
    host: String,

    /// HTTP port; defaults to `DMCLIENT_DEFAULT_PORT` or 5000.
    #[arg(long, env = "DMCLIENT_PORT")]
    port: Option<u16>,

    #[arg(long, env = "DMCLIENT_LOGIN")]
    login: Option<String>,

    #[arg(long, env = "DMCLIENT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Create the account before logging in.
    #[arg(long, default_value_t = false)]
    register: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server is online and print its endpoint.
    Probe,
    /// Connect and print events with the given tags until Ctrl-C.
    Listen { tags: Vec<String> },
    /// Connect and send one event.
    Send {
        tag: String,
        /// `key=value` pairs; values parse as JSON, else as plain strings.
        fields: Vec<String>,
    },
    /// Sync server content without opening the stream.
    Sync,
    ChangePassword { new_password: String },
    ChangeAccess {
        login: String,
        #[arg(long)]
        grant: Vec<String>,
        #[arg(long)]
        revoke: Vec<String>,
    },
    Access { login: String },
    DeleteUser { login: String },
    Users,
    Settings,
    SetSetting { key: String, value: String },
}

impl Command {
    fn needs_login(&self) -> bool {
        !matches!(self, Self::Probe | Self::Sync)
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env();
    let port = cli.port.unwrap_or(config.default_port);
    let session = Session::new(config, Arc::new(EventDispatcher::new()))?;

    let endpoint = session.check_server(&cli.host, port).await?;
    if matches!(cli.command, Command::Probe) {
        return print_json(&json!({
            "server_name": endpoint.server_name,
            "http": endpoint.http_base(),
            "stream": endpoint.stream_url(),
        }));
    }

    if cli.command.needs_login() {
        let login = cli.login.as_deref().ok_or(CliError::MissingLogin)?;
        let password = cli.password.as_deref().ok_or(CliError::MissingPassword)?;
        if cli.register {
            session.register(login, password).await?;
        } else {
            session.login(login, password).await?;
        }
    }

    let result = run(&session, cli.command).await;
    session.disconnect().await;
    result
}

async fn run(session: &Session, command: Command) -> Result<(), CliError> {
    match command {
        Command::Probe => Ok(()),
        Command::Listen { tags } => run_listen(session, tags).await,
        Command::Send { tag, fields } => {
            let record = EventRecord::new(tag).with_fields(parse_fields(&fields)?);
            connect(session).await?;
            session.send(&record).await?;
            eprintln!("sent `{}`", record.tag());
            Ok(())
        }
        Command::Sync => {
            let outcome = session.sync_content(Some(&report_progress)).await?;
            print_sync(&outcome);
            Ok(())
        }
        Command::ChangePassword { new_password } => {
            session.admin()?.change_password(&new_password).await?;
            eprintln!("password changed");
            Ok(())
        }
        Command::ChangeAccess { login, grant, revoke } => {
            let admin = session.admin()?;
            let mut access = admin.get_access(&login).await?;
            access.extend(grant.into_iter().map(|name| (name, true)));
            access.extend(revoke.into_iter().map(|name| (name, false)));
            admin.change_access(&login, &access).await?;
            print_json(&json!(access))
        }
        Command::Access { login } => {
            let access: BTreeMap<String, bool> = session.admin()?.get_access(&login).await?;
            print_json(&json!(access))
        }
        Command::DeleteUser { login } => {
            session.admin()?.delete_user(&login).await?;
            eprintln!("deleted `{login}`");
            Ok(())
        }
        Command::Users => print_json(&json!(session.admin()?.list_users().await?)),
        Command::Settings => print_json(&Value::Object(session.admin()?.get_server_settings().await?)),
        Command::SetSetting { key, value } => {
            session.admin()?.change_server_settings(&key, parse_value(&value)).await?;
            eprintln!("setting `{key}` updated");
            Ok(())
        }
    }
}

async fn run_listen(session: &Session, tags: Vec<String>) -> Result<(), CliError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();
    let mut handles = Vec::new();
    for tag in tags.iter().map(String::as_str).chain([DISCONNECTED_TAG]) {
        let tx = tx.clone();
        handles.push(session.dispatcher().register(tag, move |record| {
            let _ = tx.send(record);
            Ok(())
        }));
    }
    drop(tx);

    connect(session).await?;
    eprintln!("listening; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            record = rx.recv() => {
                let Some(record) = record else { break };
                print_json(&serde_json::to_value(&record)?)?;
                if record.tag() == DISCONNECTED_TAG {
                    break;
                }
            }
        }
    }

    for handle in &handles {
        session.dispatcher().unregister(handle);
    }
    Ok(())
}

async fn connect(session: &Session) -> Result<(), CliError> {
    let outcome = session.connect(Some(&report_progress)).await?;
    eprintln!("connected to {} ({})", outcome.server_name, outcome.content_dir.display());
    match &outcome.sync {
        Ok(sync) => print_sync(sync),
        Err(e) => eprintln!("content sync failed: {e}"),
    }
    Ok(())
}

fn report_progress(done: u64, total: u64) {
    if total == 0 {
        eprint!("\rdownloaded {done} bytes");
    } else {
        eprint!("\rdownloaded {done}/{total} bytes");
    }
}

fn print_sync(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::UpToDate { hash } => eprintln!("content up to date ({hash})"),
        SyncOutcome::Updated { hash, bytes, entries } => {
            eprintln!("\ncontent updated to {hash}: {entries} entries, {bytes} bytes");
        }
    }
}

fn parse_fields(pairs: &[String]) -> Result<Map<String, Value>, CliError> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| CliError::InvalidField(pair.clone()))?;
            Ok((key.to_owned(), parse_value(value)))
        })
        .collect()
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
