//! HTTP server assembly for Tollway
//!
//! Wires the stores, ledger, pricing cache, account pool, and relay into
//! one axum router, and owns the background billing and maintenance tasks.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod auth;
mod backends;
mod health;
pub mod scheduler;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tollway_accounts::{AccountManager, AccountSettings, OAuthRefresher};
use tollway_config::Config;
use tollway_core::{SharedClock, SystemClock};
use tollway_ledger::{Ledger, LedgerSettings};
use tollway_pricing::{CostCalculator, PricingResolver};
use tollway_relay::{BillingQueue, Biller, RelaySettings, RelayState};
use tower_http::trace::TraceLayer;

pub use auth::{ApiKeys, KeyGuard};
pub use backends::Backends;
pub use scheduler::Scheduler;

/// How long shutdown waits for queued billing to finish
const BILLING_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Assembled server with all routes, middleware, and background work
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
    ledger: Arc<Ledger>,
    accounts: Arc<AccountManager>,
    scheduler: Arc<Scheduler>,
    billing: JoinHandle<()>,
}

impl Server {
    /// Build the server from configuration
    ///
    /// Opens the configured store, seeds users and upstream accounts, and
    /// starts the billing queue. Maintenance jobs start with [`Self::serve`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or seeding fails
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let listen_address = config
            .server
            .listen_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let backends = Backends::from_config(&config).await?;

        let ledger_settings = LedgerSettings::from_config(&config.ledger)?;
        let timezone = ledger_settings.timezone.clone();
        let ledger = Arc::new(Ledger::new(backends.ledger, clock.clone(), ledger_settings));
        ledger.seed(&config.users).await?;

        let resolver = PricingResolver::new(backends.pricing, clock.clone(), config.pricing.refresh_interval);
        let calculator = CostCalculator::new(Arc::new(resolver));

        let refresher = OAuthRefresher::from_config(&config.upstream.oauth)?;
        let accounts = Arc::new(AccountManager::new(
            backends.accounts,
            Arc::new(refresher),
            clock.clone(),
            AccountSettings::from_config(&config.upstream),
        ));
        accounts.seed(&config.accounts).await?;

        let (billing_queue, billing) = BillingQueue::spawn(Biller::new(ledger.clone(), calculator, clock.clone()));

        let relay_state = RelayState::new(
            ledger.clone(),
            accounts.clone(),
            billing_queue,
            RelaySettings::from_config(&config.upstream, &config.ledger),
        )?;

        let guard = Arc::new(KeyGuard::new(
            ApiKeys::from_config(&config.keys),
            ledger.clone(),
            clock.clone(),
        ));
        if guard.keys().is_empty() {
            tracing::warn!("no API keys configured, every relay request will be rejected");
        }

        let relay = tollway_relay::relay_router(relay_state).layer(axum::middleware::from_fn(move |req, next| {
            let guard = guard.clone();
            async move { auth::auth_middleware(guard, req, next).await }
        }));

        let mut app = Router::new();

        if config.server.health.enabled {
            app = app.route(
                &config.server.health.path,
                axum::routing::get(health::health_handler).with_state(accounts.clone()),
            );
        }

        app = app.merge(relay);
        app = app.layer(TraceLayer::new_for_http());

        let scheduler = Arc::new(Scheduler::new(
            ledger.clone(),
            accounts.clone(),
            clock,
            timezone,
            config.scheduler,
        ));

        tracing::info!(
            users = config.users.len(),
            accounts = config.accounts.len(),
            keys = config.keys.len(),
            "tollway initialized"
        );

        Ok(Self {
            router: app,
            listen_address,
            ledger,
            accounts,
            scheduler,
            billing,
        })
    }

    /// Get the configured listen address
    #[must_use]
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    /// Start serving requests on the configured address
    ///
    /// Blocks until the cancellation token is triggered.
    ///
    /// # Errors
    ///
    /// Returns an error if binding the TCP listener or serving fails
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// Runs maintenance jobs alongside the listener. After the listener
    /// stops, waits for queued billing to be charged.
    ///
    /// # Errors
    ///
    /// Returns an error if serving fails
    pub async fn serve_with_listener(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        let jobs = if self.scheduler.enabled() {
            Arc::clone(&self.scheduler).spawn(&shutdown)
        } else {
            Vec::new()
        };

        let job_shutdown = shutdown.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("graceful shutdown initiated");
            })
            .await?;

        job_shutdown.cancel();
        for job in jobs {
            let _ = job.await;
        }

        match tokio::time::timeout(BILLING_DRAIN_TIMEOUT, self.billing).await {
            Ok(_) => tracing::info!("billing queue drained"),
            Err(_) => tracing::error!(
                target: tollway_telemetry::metrics::UNBILLED_TARGET,
                "billing queue did not drain before shutdown, queued usage may be unbilled"
            ),
        }

        Ok(())
    }
}
