mod cli;
mod config;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use listing_search::{AzureListingSearch, EmbeddingClient, ListingSearch};
use rt_relay::{RealtimeConnector, RelayServer, RelayServerConfig, SessionServices, ToolRegistry};
use session_policy::{DownstreamFilter, PolicyEnforcer};
use upstream_auth::{Credential, COGNITIVE_SERVICES_SCOPE, SEARCH_SCOPE};

use crate::cli::Cli;
use crate::config::{Config, LogFormat, LoggingConfig, Secrets};

/// How long the audit writer gets to drain after the server stops.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

/// Build the search backend, or `None` when no index is configured.
async fn build_search(
    cfg: &Config,
    secrets: &Secrets,
    openai_credential: &Credential,
    background: &mut Vec<JoinHandle<()>>,
) -> Result<Option<Arc<dyn ListingSearch>>> {
    let Some(settings) = cfg.search_settings() else {
        warn!("no search service configured; search tools disabled");
        return Ok(None);
    };
    let (endpoint, _) = cfg.upstream_target()?;

    let (search_credential, refresher) = Credential::resolve(
        secrets.search_api_key.clone(),
        &secrets.identity(),
        SEARCH_SCOPE,
    )
    .await
    .context("failed to obtain Azure AI Search credential")?;
    background.extend(refresher);

    let embedder = EmbeddingClient::new(
        endpoint,
        &cfg.search.embedding_deployment,
        &cfg.search.embedding_api_version,
        openai_credential.clone(),
    )
    .context("failed to create embedding client")?;

    let search = AzureListingSearch::new(&settings, search_credential, embedder)
        .context("failed to create search client")?;

    info!(
        service = %settings.service_name,
        index = %settings.index,
        embedding_deployment = %cfg.search.embedding_deployment,
        "listing search configured"
    );
    Ok(Some(Arc::new(search)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then environment, then CLI overrides.
    let mut cfg = config::load(&cli.config)?;
    cfg.apply_env(|key| std::env::var(key).ok());

    if let Some(ref policy) = cli.policy {
        cfg.policy_file = policy.clone();
    }
    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(ref path) = cli.path {
        cfg.network.path = path.clone();
    }

    // 3. Init tracing-subscriber.
    init_tracing(&cfg.logging);

    cfg.validate().context("invalid configuration")?;
    let (endpoint, deployment) = cfg.upstream_target()?;
    let listen_addr = cfg.listen_addr()?;
    let secrets = Secrets::from_env();

    info!(
        config_file = %cli.config.display(),
        policy_file = %cfg.policy_file.display(),
        listen = %listen_addr,
        path = %cfg.network.path,
        endpoint,
        deployment,
        ?secrets,
        "voicerag starting"
    );

    // 4. Start audit logger.
    let (audit, audit_task) = if cfg.logging.audit_enabled {
        let (sink, handle) = AuditSink::start(&cfg.logging.audit_log_path)
            .await
            .context("failed to start audit logger")?;
        (sink, Some(handle))
    } else {
        info!("audit trail disabled");
        (AuditSink::disabled(), None)
    };

    audit
        .log(AuditEntry::new(
            AuditEventType::ProcessStarted,
            AuditSource::new("voicerag"),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config.display().to_string(),
                "policy_file": cfg.policy_file.display().to_string(),
            }),
        ))
        .await;

    // 5. Load session policy.
    let mut policy = session_policy::loader::load_policy(&cfg.policy_file)
        .context("failed to load policy file")?;
    policy.session.voice = Some(config::effective_voice(
        cfg.upstream.voice.as_deref(),
        policy.session.voice.as_deref(),
    ));

    // 6. Credentials. One refresher per service when no API key is set.
    let mut background: Vec<JoinHandle<()>> = Vec::new();
    let (openai_credential, refresher) = Credential::resolve(
        secrets.openai_api_key.clone(),
        &secrets.identity(),
        COGNITIVE_SERVICES_SCOPE,
    )
    .await
    .context("failed to obtain Azure OpenAI credential")?;
    background.extend(refresher);
    info!(kind = openai_credential.kind(), "Azure OpenAI credential ready");

    // 7. Tools, enforcer, downstream filter.
    let search = build_search(&cfg, &secrets, &openai_credential, &mut background).await?;

    let mut registry = ToolRegistry::new();
    tools::register_tools(&mut registry, search).context("failed to register tools")?;
    registry
        .ensure_registered(&policy.session.tools)
        .context("policy enables a tool that is not available")?;

    let enforcer = PolicyEnforcer::new(
        policy.session.clone(),
        registry.schemas(&policy.session.tools),
    );
    let filter = DownstreamFilter::new(&policy.downstream)
        .context("invalid downstream.blocked_events")?;

    info!(?enforcer, ?registry, "session policy loaded");

    let services = SessionServices {
        enforcer: Arc::new(enforcer),
        filter: Arc::new(filter),
        tools: Arc::new(registry),
        audit: audit.clone(),
    };

    // 8. Upstream connector and relay server.
    let connector = RealtimeConnector::new(
        endpoint,
        deployment,
        &cfg.upstream.api_version,
        openai_credential,
        Duration::from_secs(cfg.upstream.connect_timeout_secs),
    )
    .context("invalid realtime endpoint")?;
    info!(url = %connector.url(), "realtime upstream configured");

    let server = RelayServer::new(
        RelayServerConfig {
            listen_addr,
            origin_allowlist: cfg.network.origin_allowlist.clone(),
        },
        services,
        Arc::new(connector),
    )
    .attach(cfg.network.path.clone());

    // 9. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx_signal.send(());
    });

    // 10. Serve until the listener fails or a signal arrives.
    info!(listen = %listen_addr, paths = ?server.paths(), "starting realtime relay");

    let server_result = tokio::select! {
        r = server.run() => {
            info!("relay server exited");
            r
        }
        _ = shutdown_rx.recv() => {
            info!("shutdown requested");
            Ok(())
        }
    };
    drop(shutdown_tx);

    for task in background {
        task.abort();
    }

    // 11. Log shutdown.
    info!("voicerag shutting down");

    audit
        .log(AuditEntry::new(
            AuditEventType::ProcessStopped,
            AuditSource::new("voicerag"),
            serde_json::json!({
                "server_result": format!("{:?}", server_result),
            }),
        ))
        .await;

    drop(audit);
    if let Some(task) = audit_task {
        if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, task).await.is_err() {
            warn!("audit writer still busy at exit; trailing entries may be lost");
        }
    }

    server_result
}
