//! Test server wrapper that starts Tollway on a random port

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tollway_accounts::{AccountManager, AccountStore, UpstreamAccount};
use tollway_config::Config;
use tollway_ledger::Ledger;
use tollway_server::Server;

/// A running test server instance
pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    client: reqwest::Client,
    ledger: Arc<Ledger>,
    accounts: Arc<AccountManager>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    /// Start a test server with the given configuration
    ///
    /// Binds to port 0 for automatic port assignment
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let server = Server::new(config).await?;
        let ledger = Arc::clone(server.ledger());
        let accounts = Arc::clone(server.accounts());
        let shutdown = CancellationToken::new();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(server.serve_with_listener(listener, shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
            ledger,
            accounts,
            task: Some(task),
        })
    }

    /// Base URL of the running test server
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// POST a messages request authenticated with `key`
    pub async fn send_message(&self, key: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url("/v1/messages"))
            .header("x-api-key", key)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub async fn account(&self, id: &str) -> UpstreamAccount {
        self.accounts.store().get(id).await.unwrap().unwrap()
    }

    /// Stop accepting requests and wait for queued billing to finish
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("server did not stop")
                .expect("server task panicked")
                .expect("server failed");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
