#![allow(clippy::cognitive_complexity)]
use std::{path::Path, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, anyhow};

use config::{SessionConfig, StoreConfig};
use lease_store::{AccountId, LeaseStore, MemoryStore, NatsLeaseStore};
use session_core::{
    LeaseEngine, SessionError, SessionEvent, SessionManager,
    config::{
        cli::{self, Command, Parser},
        trace,
    },
    identity::{Credentials, FileDeviceIdentity, TrustedAuthenticator},
    metrics,
    tokio::{self, runtime::Builder, signal},
    tracing::*,
};
use tokio_util::sync::CancellationToken;

/// another device holds the account
const EXIT_CONFLICT: u8 = 2;
/// another device took the session over while we held it
const EXIT_EVICTED: u8 = 3;

fn main() -> Result<ExitCode> {
    // load .env first so clap's env fallbacks can see it
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.session_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    let code = rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "failed to start");
                ExitCode::FAILURE
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                ExitCode::FAILURE
            }
            Ok(Ok(code)) => {
                debug!("exiting...");
                code
            }
        }
    });

    Ok(code)
}

async fn start(config: cli::Config) -> Result<ExitCode> {
    let session_cfg = match &config.config_path {
        Some(path) => {
            debug!(?path, "parsing session config");
            SessionConfig::parse(path)?
        }
        None => {
            debug!("no config path given, using defaults");
            SessionConfig::default()
        }
    };
    let backend_mode = session_cfg.backend_mode();
    info!(?backend_mode, policy = ?session_cfg.policy(), "lease backend mode");

    let store = connect_store(session_cfg.store()).await?;
    let engine = LeaseEngine::new(store, *session_cfg.policy(), *session_cfg.retry());

    match config.command {
        Command::Hold { account } => hold(&config.device_id_path, engine, account).await,
        Command::Inspect { account } => {
            inspect(&engine, account.into()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect_store(store: &StoreConfig) -> Result<Arc<dyn LeaseStore>> {
    match store {
        StoreConfig::Memory => {
            warn!("memory backend is process-local, sessions are not shared with other devices");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreConfig::Nats(nats) => {
            info!(servers = ?nats.servers, bucket = %nats.bucket, "connecting to NATS lease store");
            let store = NatsLeaseStore::connect(nats.clone())
                .await
                .map_err(|e| anyhow!("NATS connection failed: {e}"))?;
            info!("NATS lease store ready");
            Ok(Arc::new(store))
        }
    }
}

/// Sign in and hold the session until ctrl-c (sign out) or eviction.
async fn hold(device_id_path: &Path, engine: LeaseEngine, account: String) -> Result<ExitCode> {
    let device = FileDeviceIdentity::load_or_create(device_id_path)
        .context("failed to load device identity")?;
    let manager = SessionManager::new(
        engine,
        Arc::new(TrustedAuthenticator::new()),
        Arc::new(device),
    );

    let mut session = match manager.sign_in(&Credentials::new(account, "")).await {
        Ok(session) => session,
        Err(SessionError::AlreadySignedInElsewhere { holder_info }) => {
            error!(%holder_info, "account is signed in on another device");
            return Ok(ExitCode::from(EXIT_CONFLICT));
        }
        Err(err) => return Err(err.into()),
    };
    info!(
        account = %session.account(),
        holder = %session.holder_info(),
        "holding session, ctrl-c to sign out"
    );

    let token = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(token.clone()));

    enum Exit {
        Shutdown,
        Event(Option<SessionEvent>),
    }
    let exit = tokio::select! {
        _ = token.cancelled() => Exit::Shutdown,
        event = session.next_event() => Exit::Event(event),
    };
    signal_task.abort();

    let code = match exit {
        Exit::Shutdown => {
            let outcome = session.sign_out().await?;
            info!(?outcome, "signed out");
            ExitCode::SUCCESS
        }
        Exit::Event(Some(SessionEvent::Evicted { by })) => {
            error!(%by, "session taken over by another device");
            ExitCode::from(EXIT_EVICTED)
        }
        Exit::Event(event) => {
            warn!(?event, "session ended");
            ExitCode::FAILURE
        }
    };
    match metrics::render() {
        Ok(text) => debug!(metrics = %text, "final lease metrics"),
        Err(err) => debug!(?err, "failed to render metrics"),
    }
    Ok(code)
}

/// Print the account's lease record as JSON, `null` when absent.
async fn inspect(engine: &LeaseEngine, account: AccountId) -> Result<()> {
    let now = engine.store().server_time().await?;
    let current = engine.current(&account).await?;
    let out = match current {
        Some(current) => serde_json::json!({
            "revision": current.revision,
            "expired": current.value.is_expired(now, chrono_grace(engine)),
            "serverTime": now,
            "record": current.value,
        }),
        None => serde_json::Value::Null,
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn chrono_grace(engine: &LeaseEngine) -> session_core::chrono::Duration {
    session_core::chrono::Duration::from_std(engine.policy().takeover_grace)
        .unwrap_or(session_core::chrono::Duration::zero())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
