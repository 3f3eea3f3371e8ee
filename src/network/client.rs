//! Network Client
//!
//! Reconnecting outbound connection used by masters in TCP-client role
//! and by slaves connecting to a master. Each established connection is
//! handed to an async handler; when the handler returns (cleanly or
//! with an error) the client waits out the reconnection interval and
//! connects again, until shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::Result;

pub struct ReplicationClient {
    address: String,
    reconnection_interval: Duration,
}

impl ReplicationClient {
    pub fn new(address: String, reconnection_interval: Duration) -> Self {
        Self {
            address,
            reconnection_interval,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect in a loop, handing each established connection to
    /// `handler`. Returns when shutdown is signalled.
    pub async fn run<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, mut handler: F)
    where
        F: FnMut(TcpStream) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match TcpStream::connect(&self.address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::info!("Connected to {}", self.address);
                    tokio::select! {
                        result = handler(stream) => {
                            if let Err(e) = result {
                                tracing::warn!("Connection to {} ended: {}", self.address, e);
                            } else {
                                tracing::info!("Connection to {} closed", self.address);
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {}: {}", self.address, e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnection_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
