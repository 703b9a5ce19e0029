use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use mpr_reconcile::{Presence, RecordId, VerificationClient, VerifyError};
use serde_json::json;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::connection::{BoxStream, CallError, Connection};
use crate::{tls, ElectrumEndpoint, Transport};

/// Client name announced in `server.version`.
pub const CLIENT_NAME: &str = concat!("mpr/", env!("CARGO_PKG_VERSION"));
/// Protocol version requested in `server.version`.
pub const PROTOCOL_VERSION: &str = "1.4";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Verification client that checks transaction ids with
/// `blockchain.transaction.get`.
///
/// `connect` and `close` are idempotent. `verify` may be called from many
/// tasks at once; all calls share one connection.
pub struct ElectrumClient {
    endpoint: ElectrumEndpoint,
    connect_timeout: Duration,
    conn: RwLock<Option<Arc<Connection>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ElectrumClient {
    pub fn new(endpoint: ElectrumEndpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            conn: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Bound TCP connect, TLS handshake and `server.version` together.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &ElectrumEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.conn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    fn replace(&self, next: Option<Arc<Connection>>) -> Option<Arc<Connection>> {
        let mut slot = self.conn.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, next)
    }

    async fn open(&self) -> Result<Arc<Connection>, VerifyError> {
        let addr = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| VerifyError::Transport(format!("connect {addr}: {e}")))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        let stream: BoxStream = match self.endpoint.transport {
            Transport::Tcp => Box::new(tcp),
            Transport::Tls => Box::new(tls::wrap(tcp, &self.endpoint.host).await?),
        };
        let conn = Arc::new(Connection::start(stream));

        let banner = conn
            .call("server.version", json!([CLIENT_NAME, PROTOCOL_VERSION]))
            .await
            .map_err(|e| match e {
                CallError::Rpc { code, message } => VerifyError::Handshake(match code {
                    Some(c) => format!("server.version rejected code={c}: {message}"),
                    None => format!("server.version rejected: {message}"),
                }),
                CallError::Transport(m) => VerifyError::Transport(m),
                CallError::Decode(m) => VerifyError::Decode(m),
            })?;
        info!(endpoint = %self.endpoint, server = %banner, "electrum connected");
        Ok(conn)
    }
}

impl std::fmt::Debug for ElectrumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectrumClient")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait::async_trait]
impl VerificationClient for ElectrumClient {
    fn name(&self) -> &'static str {
        "electrum"
    }

    async fn connect(&self) -> Result<(), VerifyError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current().is_some() {
            return Ok(());
        }
        let conn = tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| {
                VerifyError::Transport(format!(
                    "connect {} timed out after {}ms",
                    self.endpoint,
                    self.connect_timeout.as_millis()
                ))
            })??;
        self.replace(Some(conn));
        Ok(())
    }

    async fn verify(&self, record_id: &RecordId) -> Result<Presence, VerifyError> {
        let conn = self.current().ok_or(VerifyError::NotConnected)?;
        match conn
            .call("blockchain.transaction.get", json!([record_id.as_str()]))
            .await
        {
            Ok(_) => Ok(Presence::Found),
            Err(CallError::Rpc { code, message }) => Ok(Presence::NotFound { code, message }),
            Err(CallError::Transport(m)) => Err(VerifyError::Transport(m)),
            Err(CallError::Decode(m)) => Err(VerifyError::Decode(m)),
        }
    }

    async fn close(&self) -> Result<(), VerifyError> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(conn) = self.replace(None) {
            conn.shutdown().await;
            debug!(endpoint = %self.endpoint, "electrum connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Single-connection fake server. Transactions in `known` are found; any
    /// other id gets the usual Electrum "not found" error object.
    async fn fake_server(known: &'static [&'static str]) -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut lines = BufReader::new(rd).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let id = req["id"].clone();
                let resp = match req["method"].as_str().unwrap_or_default() {
                    "server.version" => json!({"jsonrpc": "2.0", "id": id, "result": ["fake 1.0", "1.4"]}),
                    "blockchain.transaction.get" => {
                        let txid = req["params"][0].as_str().unwrap_or_default();
                        if known.iter().any(|k| *k == txid) {
                            json!({"jsonrpc": "2.0", "id": id, "result": "0100000001"})
                        } else {
                            json!({"jsonrpc": "2.0", "id": id, "error": {
                                "code": 2,
                                "message": format!("daemon error: No such mempool or blockchain transaction. {txid}")
                            }})
                        }
                    }
                    _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "unknown method"}}),
                };
                wr.write_all(format!("{resp}\n").as_bytes()).await.unwrap();
            }
        });
        (port, task)
    }

    fn client_for(port: u16) -> ElectrumClient {
        ElectrumClient::new(ElectrumEndpoint::new("127.0.0.1", Some(port), Transport::Tcp))
    }

    #[tokio::test]
    async fn found_and_not_found_are_classified() {
        let (port, server) = fake_server(&["aa"]).await;
        let client = client_for(port);
        client.connect().await.unwrap();

        assert_eq!(
            client.verify(&RecordId::from("aa")).await.unwrap(),
            Presence::Found
        );
        match client.verify(&RecordId::from("bb")).await.unwrap() {
            Presence::NotFound { code, message } => {
                assert_eq!(code, Some(2));
                assert!(message.contains("No such mempool"), "{message}");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn verify_before_connect_is_not_connected() {
        let client = client_for(1);
        let err = client.verify(&RecordId::from("aa")).await.unwrap_err();
        assert_eq!(err, VerifyError::NotConnected);
    }

    #[tokio::test]
    async fn connect_and_close_are_idempotent() {
        let (port, server) = fake_server(&[]).await;
        let client = client_for(port);

        client.connect().await.unwrap();
        client.connect().await.unwrap();
        assert!(client.is_connected());

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert_eq!(
            client.verify(&RecordId::from("aa")).await.unwrap_err(),
            VerifyError::NotConnected
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn many_concurrent_calls_share_one_connection() {
        let (port, server) = fake_server(&["t0", "t2", "t4"]).await;
        let client = Arc::new(client_for(port));
        client.connect().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..6 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                let id = RecordId::from(format!("t{i}"));
                client.verify(&id).await.unwrap().is_found()
            }));
        }
        let mut found = Vec::new();
        for h in handles {
            found.push(h.await.unwrap());
        }
        assert_eq!(found, vec![true, false, true, false, true, false]);

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client_for(port).connect().await.unwrap_err();
        assert!(matches!(err, VerifyError::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn silent_server_hits_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let err = client_for(port)
            .with_connect_timeout(Duration::from_millis(200))
            .connect()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 200ms"), "{err}");
        hold.abort();
    }
}
