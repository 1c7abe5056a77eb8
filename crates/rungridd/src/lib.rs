//! rungridd: assembles the rungrid control plane.
//!
//! A [`Context`] is built once per process and owns everything the loops
//! share: the state store, the provider client cache, the decision
//! counters, the capacity batching scaler and the shutdown signal. Tests
//! build their own context over an in-memory store.

use std::net::SocketAddr;
use std::sync::Arc;

use rungrid_api::ApiState;
use rungrid_autoscale::{AutoscaleController, BatchScaler, DecisionCounters, DecisionEngine};
use rungrid_core::RungridConfig;
use rungrid_lifecycle::{AgentLifecycle, LifecycleTimings};
use rungrid_provider::{ClientCache, GithubClient, GithubFactory, Provider, ProviderFactory};
use rungrid_rollout::{OwnerMaterializer, OwnerSync, TargetSyncController};
use rungrid_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct Context {
    pub config: RungridConfig,
    pub store: StateStore,
    pub clients: Arc<ClientCache>,
    pub counters: Arc<DecisionCounters>,
    pub batch: Arc<BatchScaler>,
    webhook_secret: Option<Arc<str>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Context {
    pub fn new(
        config: RungridConfig,
        store: StateStore,
        default_client: Option<Arc<dyn Provider>>,
        factory: Arc<dyn ProviderFactory>,
        webhook_secret: Option<String>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let batch = Arc::new(BatchScaler::new(
            store.clone(),
            config.autoscale.batch_interval(),
            shutdown_rx,
        ));
        Self {
            clients: Arc::new(ClientCache::new(store.clone(), factory, default_client)),
            counters: Arc::new(DecisionCounters::default()),
            batch,
            webhook_secret: webhook_secret.map(Arc::from),
            shutdown_tx,
            store,
            config,
        }
    }

    /// Open the on-disk store and the GitHub clients named by `config`.
    pub fn from_config(config: RungridConfig) -> anyhow::Result<Self> {
        let data_dir = &config.store.data_dir;
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("rungrid.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        let api_url = config.provider.api_url.clone();
        let default_client: Option<Arc<dyn Provider>> = match std::env::var(&config.provider.token_env) {
            Ok(token) if !token.is_empty() => {
                Some(Arc::new(GithubClient::new(&api_url, &token)?) as Arc<dyn Provider>)
            }
            _ => {
                warn!(
                    env = %config.provider.token_env,
                    "no default provider token; targets need a credential"
                );
                None
            }
        };
        let secret = config
            .server
            .webhook_secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|s| !s.is_empty());
        if secret.is_none() {
            warn!("no webhook secret configured; deliveries are not authenticated");
        }

        Ok(Self::new(
            config,
            store,
            default_client,
            Arc::new(GithubFactory::new(&api_url)),
            secret,
        ))
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            clients: self.clients.clone(),
            batch: self.batch.clone(),
            counters: self.counters.clone(),
            webhook_secret: self.webhook_secret.clone(),
        }
    }

    pub fn autoscale_controller(&self) -> AutoscaleController {
        AutoscaleController::new(
            self.store.clone(),
            self.clients.clone(),
            DecisionEngine::new(self.config.autoscale.default_scale_down_delay()),
            self.counters.clone(),
        )
    }

    pub fn target_sync(&self) -> TargetSyncController {
        let timings = self.lifecycle_timings();
        TargetSyncController::new(
            self.store.clone(),
            OwnerSync::new(timings.registration_timeout, self.config.sync.recreation_delay()),
        )
    }

    pub fn materializer(&self) -> OwnerMaterializer {
        OwnerMaterializer::new(self.store.clone())
    }

    pub fn lifecycle(&self) -> AgentLifecycle {
        AgentLifecycle::new(self.store.clone(), self.clients.clone(), self.lifecycle_timings())
    }

    fn lifecycle_timings(&self) -> LifecycleTimings {
        LifecycleTimings::from_config(&self.config.lifecycle)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Start every control loop, serve the API on `port` and run until
    /// Ctrl-C.
    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let cfg = &self.config;

        // ── Start background tasks ─────────────────────────────────

        let mut autoscaler = self.autoscale_controller();
        let interval = cfg.autoscale.interval();
        let shutdown = self.shutdown_signal();
        let autoscale_handle = tokio::spawn(async move {
            autoscaler.run(interval, shutdown).await;
        });

        let sync = self.target_sync();
        let interval = cfg.sync.interval();
        let shutdown = self.shutdown_signal();
        let sync_handle = tokio::spawn(async move {
            sync.run(interval, shutdown).await;
        });

        let materializer = self.materializer();
        let shutdown = self.shutdown_signal();
        let materialize_handle = tokio::spawn(async move {
            materializer.run(interval, shutdown).await;
        });

        let lifecycle = self.lifecycle();
        let interval = cfg.lifecycle.interval();
        let shutdown = self.shutdown_signal();
        let lifecycle_handle = tokio::spawn(async move {
            lifecycle.run(interval, shutdown).await;
        });

        // ── Start API server ───────────────────────────────────────

        let router = rungrid_api::build_router(self.api_state());
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        info!(%addr, "API server starting");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let shutdown_tx = self.shutdown_tx.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        let _ = autoscale_handle.await;
        let _ = sync_handle.await;
        let _ = materialize_handle.await;
        let _ = lifecycle_handle.await;

        info!("rungrid daemon stopped");
        Ok(())
    }
}
