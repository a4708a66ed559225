use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use forward_auth::{
    AppState,
    auth::{IdentityHeaders, OidcAuthenticator},
    authz::{AccessReviewer, AuthorizationDecider},
    config::{ConfigError, ForwardAuthConfig, SessionStorageConfig},
    observability::{self, metrics::MetricsError},
    routes,
    rules::RuleMatcher,
    session::{CookieSessionStore, GarbageCollector, GcError, SharedSessionStore, SupervisedGc},
};

#[derive(Parser, Debug)]
#[command(version, about = "Forward-authentication service for reverse proxies", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "forward-auth.toml")]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the server (default)
    Serve,
    /// Load and validate the configuration, compile every rule, then exit
    Check,
}

/// Failures that stop the process before or while serving.
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tracing(#[from] observability::TracingError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("Session garbage collection failed: {0}")]
    Gc(#[from] GcError),

    #[error("Identity provider setup failed: {0}")]
    Auth(#[from] forward_auth::auth::AuthError),

    #[error("Kubernetes client: {0}")]
    Kube(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ForwardAuthConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration in {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Some(Command::Check) => {
            println!(
                "{}: OK ({} rules, {} session storage)",
                args.config.display(),
                config.rules.rules.len(),
                if config.session.is_cluster() { "cluster" } else { "cookie" }
            );
            ExitCode::SUCCESS
        }
        Some(Command::Serve) | None => match serve(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Forward-auth stopped");
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn serve(config: ForwardAuthConfig) -> Result<(), StartupError> {
    let _tracing_guard = observability::init_tracing(&config.observability)?;
    observability::metrics::init_metrics(&config.observability.metrics)?;

    config.cookie.warn_if_weak_secret();

    let kube_client = cluster_client(&config).await?;
    let (store, gc) = build_session_store(&config, kube_client.as_ref())?;
    let reviewer = build_reviewer(&config, kube_client.as_ref());

    let supervised_gc = match gc {
        Some(gc) => Some(gc.start_supervised().await?),
        None => None,
    };

    let authenticator = OidcAuthenticator::new(config.oidc.clone())?;
    // The provider may come up after us; discovery is retried on demand.
    if let Err(e) = authenticator.get_discovery().await {
        tracing::warn!(
            error = %e,
            issuer = %config.oidc.issuer_url,
            "OIDC discovery warm-up failed"
        );
    }

    let identity_headers = IdentityHeaders::from_config(
        &config.headers,
        &config.authorization.rbac,
        config.headers.impersonation.read_service_account_token()?,
    )?;
    let matcher = Arc::new(RuleMatcher::compile(&config.rules).map_err(ConfigError::from)?);
    let decider = AuthorizationDecider::new(&config, matcher, store, reviewer);

    let addr = std::net::SocketAddr::new(config.server.host, config.server.port);
    let shutdown_grace = config.server.shutdown_grace();
    let state = AppState {
        config: Arc::new(config),
        decider: Arc::new(decider),
        identity_provider: Arc::new(authenticator),
        identity_headers: Arc::new(identity_headers),
    };

    let app = routes::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;

    tracing::info!(
        address = %addr,
        session_backend = state.session_store().backend(),
        rbac = state.config.authorization.rbac.enabled,
        rule_syntax = ?state.decider.matcher().syntax(),
        "Forward-auth listening"
    );
    tracing::info!(
        headers = ?state.identity_headers.names(),
        "Proxy must copy these response headers upstream"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve);

    if let Some(gc) = supervised_gc {
        stop_gc(gc, shutdown_grace).await;
    }
    tracing::info!("Forward-auth stopped");
    result
}

#[cfg(feature = "kubernetes")]
type ClusterClient = kube::Client;
#[cfg(not(feature = "kubernetes"))]
type ClusterClient = std::convert::Infallible;

/// A Kubernetes client, only when cluster sessions or RBAC need one.
async fn cluster_client(config: &ForwardAuthConfig) -> Result<Option<ClusterClient>, StartupError> {
    if !config.session.is_cluster() && !config.authorization.rbac.enabled {
        return Ok(None);
    }
    #[cfg(feature = "kubernetes")]
    {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| StartupError::Kube(e.to_string()))?;
        Ok(Some(client))
    }
    #[cfg(not(feature = "kubernetes"))]
    {
        Err(StartupError::Kube(
            "cluster sessions and RBAC require the 'kubernetes' feature".into(),
        ))
    }
}

fn build_reviewer(
    config: &ForwardAuthConfig,
    kube_client: Option<&ClusterClient>,
) -> Option<Arc<dyn AccessReviewer>> {
    if !config.authorization.rbac.enabled {
        return None;
    }
    #[cfg(feature = "kubernetes")]
    {
        kube_client.cloned().map(|client| {
            Arc::new(forward_auth::authz::KubeAccessReviewer::new(client))
                as Arc<dyn AccessReviewer>
        })
    }
    #[cfg(not(feature = "kubernetes"))]
    {
        let _ = kube_client;
        None
    }
}

#[allow(clippy::type_complexity)]
fn build_session_store(
    config: &ForwardAuthConfig,
    kube_client: Option<&ClusterClient>,
) -> Result<(SharedSessionStore, Option<GarbageCollector>), StartupError> {
    match &config.session {
        SessionStorageConfig::Cookie(storage) => {
            let store = CookieSessionStore::from_config(&config.cookie, storage)?;
            Ok((Arc::new(store), None))
        }
        #[cfg(feature = "kubernetes")]
        SessionStorageConfig::Cluster(cluster) => {
            use forward_auth::session::{ClusterSessionStore, KeyValueStore, KubeSecretStore};

            let client = kube_client.cloned().ok_or_else(|| {
                ConfigError::Validation("cluster session storage needs a Kubernetes client".into())
            })?;
            let remote: Arc<dyn KeyValueStore> =
                Arc::new(KubeSecretStore::new(client, &cluster.namespace));
            let store = ClusterSessionStore::from_config(remote.clone(), cluster);
            let gc = GarbageCollector::new(remote, cluster.gc_interval());
            Ok((Arc::new(store), Some(gc)))
        }
        #[cfg(not(feature = "kubernetes"))]
        SessionStorageConfig::Cluster(_) => {
            let _ = kube_client;
            Err(ConfigError::Validation(
                "session.type = \"cluster\" requires the 'kubernetes' feature".into(),
            )
            .into())
        }
    }
}

async fn stop_gc(gc: SupervisedGc, grace: std::time::Duration) {
    if tokio::time::timeout(grace, gc.stop()).await.is_err() {
        tracing::warn!(
            grace_secs = grace.as_secs(),
            "Session garbage collector did not stop in time"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
