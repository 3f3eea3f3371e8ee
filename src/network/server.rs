//! Network Server
//!
//! TCP replication server working for both masters and slaves: the
//! first frame on an accepted connection decides who handles it. A
//! REQUEST is routed to the registered master of that instance, which
//! starts pushing the log; a WAKEUP is routed to the registered slave,
//! which answers with its own REQUEST. Unknown instances or unexpected
//! first frames get an error RESPONSE and the connection is closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::replication::protocol::{Message, Response};
use crate::replication::{MasterSession, ReplicationMaster, ReplicationSlave};

pub struct ReplicationServer {
    listen: String,
    max_frame_size: usize,
    masters: Mutex<HashMap<String, Arc<ReplicationMaster>>>,
    slaves: Mutex<HashMap<String, Arc<ReplicationSlave>>>,
    shutdown: watch::Sender<bool>,
}

impl ReplicationServer {
    pub fn new(listen: String, max_frame_size: usize) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            listen,
            max_frame_size,
            masters: Mutex::new(HashMap::new()),
            slaves: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn register_master(&self, master: Arc<ReplicationMaster>) {
        self.masters
            .lock()
            .unwrap()
            .insert(master.instance().to_string(), master);
    }

    pub fn register_slave(&self, slave: Arc<ReplicationSlave>) {
        self.slaves
            .lock()
            .unwrap()
            .insert(slave.instance().to_string(), slave);
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Replication server listening on {}", addr);

        let server = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            tracing::debug!("New connection from {}", peer);
                            let _ = socket.set_nodelay(true);
                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(socket).await {
                                    tracing::warn!("Connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(addr)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = socket.into_split();
        let frame = read_frame(&mut reader, self.max_frame_size).await?;
        let message = match Message::decode(&frame) {
            Ok(m) => m,
            Err(e) => {
                send_error(&mut writer, 0, &format!("failed to decode message: {}", e)).await;
                return Err(e);
            }
        };

        match message {
            Message::Request(req) => {
                let master = self.masters.lock().unwrap().get(&req.instance).cloned();
                let master = match master {
                    Some(m) => m,
                    None => {
                        tracing::warn!(
                            "Received a replication request for unregistered master '{}'",
                            req.instance
                        );
                        send_error(
                            &mut writer,
                            req.request_seq,
                            &format!("no replication master registered for instance '{}'", req.instance),
                        )
                        .await;
                        return Ok(());
                    }
                };
                tracing::debug!(
                    "Replication request for {} starting at {:?}",
                    req.instance,
                    req.start_tx_id
                );
                let shutdown = master.shutdown_signal();
                MasterSession::new(master).run(reader, writer, req, shutdown).await
            }
            Message::Wakeup(wakeup) => {
                let slave = self.slaves.lock().unwrap().get(&wakeup.instance).cloned();
                let slave = match slave {
                    Some(s) => s,
                    None => {
                        tracing::warn!(
                            "No replication slave registered for instance '{}'",
                            wakeup.instance
                        );
                        send_error(
                            &mut writer,
                            0,
                            &format!("no replication slave registered for instance '{}'", wakeup.instance),
                        )
                        .await;
                        return Ok(());
                    }
                };
                tracing::debug!("Received wakeup for slave {}", wakeup.instance);
                let socket = reader
                    .reunite(writer)
                    .map_err(|e| Error::Network(e.to_string()))?;
                match slave.handle_connection(socket).await {
                    // the master connecting twice to the same slave
                    Err(Error::Replication(msg)) => {
                        tracing::warn!("Rejecting wakeup: {}", msg);
                        Err(Error::Replication(msg))
                    }
                    other => other,
                }
            }
            other => {
                tracing::warn!(
                    "Unexpected first message type {}, closing the connection",
                    other.type_name()
                );
                Ok(())
            }
        }
    }
}

async fn send_error<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, request_seq: u32, msg: &str) {
    let response = Message::Response(Response {
        request_seq,
        result: -1,
        error_msg: Some(msg.to_string()),
    });
    if let Ok(frame) = response.encode() {
        let _ = write_frame(writer, &frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::{Request, Wakeup};

    #[tokio::test]
    async fn test_unknown_instance_gets_error_response() {
        let server = ReplicationServer::new("127.0.0.1:0".to_string(), 65536);
        let addr = server.start().await.unwrap();

        let socket = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = socket.into_split();
        let req = Message::Request(Request {
            instance: "nowhere".to_string(),
            request_seq: 7,
            start_tx_id: None,
        });
        write_frame(&mut writer, &req.encode().unwrap()).await.unwrap();

        let frame = read_frame(&mut reader, 65536).await.unwrap();
        match Message::decode(&frame).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.request_seq, 7);
                assert_eq!(resp.result, -1);
                assert!(resp.error_msg.unwrap().contains("nowhere"));
            }
            other => panic!("expected RESPONSE, got {}", other.type_name()),
        }
        server.stop();
    }

    #[tokio::test]
    async fn test_unknown_slave_wakeup_rejected() {
        let server = ReplicationServer::new("127.0.0.1:0".to_string(), 65536);
        let addr = server.start().await.unwrap();

        let socket = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = socket.into_split();
        let wakeup = Message::Wakeup(Wakeup {
            instance: "nowhere".to_string(),
        });
        write_frame(&mut writer, &wakeup.encode().unwrap()).await.unwrap();

        let frame = read_frame(&mut reader, 65536).await.unwrap();
        match Message::decode(&frame).unwrap() {
            Message::Response(resp) => assert_eq!(resp.result, -1),
            other => panic!("expected RESPONSE, got {}", other.type_name()),
        }
        server.stop();
    }
}
