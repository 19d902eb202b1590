//! Subscriber endpoint: end-user connections, activation, channel queries,
//! and liveness pings.
//!
//! The registry is a `user_id -> connections` multimap with a secondary
//! uniqueness index on `(user_id, device_id)` -- that tuple is what "double
//! connection" means.  Watcher counting walks the live connections' current
//! stream ids, the caller included once its own current stream is set.

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use tv_core::now_ms;
use tv_proto::commands::{
    AuthInfo, ChannelType, ChannelsInfo, ClientPingInfo, RuntimeChannelInfo,
    RuntimeChannelRequest, ServerInfo, ServerPingInfo, pack, server_ping_request, unpack,
};
use tv_proto::{ErrorKind, Message, Request, Response, RpcCodec, RpcError, methods};

use crate::pending::{PendingScope, PendingTable};
use crate::users::UserDirectory;

/// Deadline for a subscriber's reply to `server_ping`.
const PING_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity stamped on a connection by a successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAuthInfo {
    pub user_id: String,
    pub auth: AuthInfo,
}

struct ConnState {
    tx: mpsc::Sender<Message>,
    auth: Option<ServerAuthInfo>,
    current_stream: Option<String>,
}

#[derive(Default)]
struct Registry {
    next_conn_id: u64,
    conns: HashMap<u64, ConnState>,
    by_user: HashMap<String, Vec<u64>>,
    by_device: HashSet<(String, String)>,
}

struct HubInner {
    directory: RwLock<Box<dyn UserDirectory + Send + Sync>>,
    bandwidth_host: String,
    ping_interval: Duration,
    seq: AtomicU64,
    pending: PendingTable,
    registry: RwLock<Registry>,
    online: Arc<AtomicU64>,
}

#[derive(Clone)]
pub struct SubscriberHub {
    inner: Arc<HubInner>,
}

impl SubscriberHub {
    pub fn new(
        directory: Box<dyn UserDirectory + Send + Sync>,
        bandwidth_host: String,
        ping_interval: Duration,
        online: Arc<AtomicU64>,
    ) -> Self {
        SubscriberHub {
            inner: Arc::new(HubInner {
                directory: RwLock::new(directory),
                bandwidth_host,
                ping_interval,
                seq: AtomicU64::new(0),
                pending: PendingTable::new(),
                registry: RwLock::new(Registry::default()),
                online,
            }),
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    /// Swap in a freshly loaded directory (SIGHUP reload).
    pub async fn replace_directory(&self, directory: Box<dyn UserDirectory + Send + Sync>) {
        *self.inner.directory.write().await = directory;
    }

    fn next_seq(&self) -> String {
        self.inner.seq.fetch_add(1, Ordering::Relaxed).to_string()
    }

    // -----------------------------------------------------------------------
    // Connection handling
    // -----------------------------------------------------------------------

    pub async fn run_listener(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "subscriber connected");
                    tokio::spawn(self.clone().handle_conn(stream));
                }
                Err(e) => warn!(error = %e, "subscriber accept error"),
            }
        }
    }

    async fn handle_conn(self, stream: TcpStream) {
        let framed = Framed::new(stream, RpcCodec::new());
        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Message>(32);

        let conn_id = {
            let mut registry = self.inner.registry.write().await;
            registry.next_conn_id += 1;
            let conn_id = registry.next_conn_id;
            registry.conns.insert(
                conn_id,
                ConnState {
                    tx,
                    auth: None,
                    current_stream: None,
                },
            );
            conn_id
        };

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Request(req)) => {
                    if let Some(resp) = self.dispatch_client(conn_id, req).await {
                        let delivered = {
                            let registry = self.inner.registry.read().await;
                            registry.conns.get(&conn_id).map(|c| c.tx.clone())
                        };
                        match delivered {
                            Some(tx) => {
                                if tx.send(Message::Response(resp)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
                Ok(Message::Response(resp)) => {
                    // server_ping replies land here and are silently
                    // accepted.
                    self.inner.pending.complete(&resp.id, resp.result);
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "subscriber protocol error, closing");
                    break;
                }
            }
        }

        self.unregister(conn_id).await;
        writer.abort();
    }

    async fn dispatch_client(&self, conn_id: u64, req: Request) -> Option<Response> {
        let seq = match req.id.clone() {
            Some(seq) => seq,
            None => {
                debug!(conn_id, method = %req.method, "subscriber notification ignored");
                return None;
            }
        };
        let params = req.params.as_deref();
        let result = match req.method.as_str() {
            methods::CLIENT_ACTIVATE => match unpack::<AuthInfo>(params) {
                Ok(auth) => self.activate_connection(conn_id, auth).await,
                Err(e) => Err(e),
            },
            methods::CLIENT_PING => match unpack::<ClientPingInfo>(params) {
                Ok(_) => Ok(pack(&ServerPingInfo {
                    timestamp: now_ms(),
                })),
                Err(e) => Err(e),
            },
            methods::CLIENT_GET_SERVER_INFO => self.authed(conn_id).await.map(|_| {
                pack(&ServerInfo {
                    bandwidth_host: self.inner.bandwidth_host.clone(),
                })
            }),
            methods::CLIENT_GET_CHANNELS => match self.authed(conn_id).await {
                Ok(identity) => self
                    .inner
                    .directory
                    .read()
                    .await
                    .find_user(&identity.auth)
                    .map(|user| pack(&ChannelsInfo {
                        channels: user.channels,
                    }))
                    .map_err(|_| RpcError::new(ErrorKind::NotFound, "Not found")),
                Err(e) => Err(e),
            },
            methods::CLIENT_GET_RUNTIME_CHANNEL_INFO => match self.authed(conn_id).await {
                Ok(_) => match unpack::<RuntimeChannelRequest>(params) {
                    Ok(req) => Ok(pack(&self.runtime_channel_info(conn_id, &req.channel_id).await)),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            },
            other => Err(RpcError::new(
                ErrorKind::NotFound,
                format!("unknown method '{other}'"),
            )),
        };
        Some(Response { id: seq, result })
    }

    async fn authed(&self, conn_id: u64) -> Result<ServerAuthInfo, RpcError> {
        let registry = self.inner.registry.read().await;
        registry
            .conns
            .get(&conn_id)
            .and_then(|c| c.auth.clone())
            .ok_or_else(|| RpcError::new(ErrorKind::Unauthorized, "Activate the connection first"))
    }

    // -----------------------------------------------------------------------
    // Activation pipeline
    // -----------------------------------------------------------------------

    async fn activate_connection(&self, conn_id: u64, auth: AuthInfo) -> Result<String, RpcError> {
        let user = self
            .inner
            .directory
            .read()
            .await
            .find_user(&auth)
            .map_err(|_| RpcError::new(ErrorKind::NotFound, "Not found"))?;

        if !user.has_device(&auth.device_id) {
            return Err(RpcError::new(
                ErrorKind::Unauthorized,
                "Unknown device reject",
            ));
        }
        if user.banned {
            return Err(RpcError::new(ErrorKind::Unauthorized, "Banned user"));
        }

        let mut registry = self.inner.registry.write().await;
        if registry
            .conns
            .get(&conn_id)
            .is_some_and(|c| c.auth.is_some())
        {
            return Err(RpcError::new(
                ErrorKind::AlreadyExists,
                "Connection is already activated",
            ));
        }
        let device_key = (user.user_id.clone(), auth.device_id.clone());
        if registry.by_device.contains(&device_key) {
            // The socket stays open; the client may retry with another
            // device.
            return Err(RpcError::new(
                ErrorKind::AlreadyExists,
                "Double connection reject",
            ));
        }

        let Some(conn) = registry.conns.get_mut(&conn_id) else {
            return Err(RpcError::new(ErrorKind::PeerGone, "connection is gone"));
        };
        conn.auth = Some(ServerAuthInfo {
            user_id: user.user_id.clone(),
            auth,
        });
        registry
            .by_user
            .entry(user.user_id.clone())
            .or_default()
            .push(conn_id);
        registry.by_device.insert(device_key);
        self.inner
            .online
            .store(registry.by_device.len() as u64, Ordering::Relaxed);

        info!(conn_id, user_id = %user.user_id, "subscriber activated");
        Ok(String::new())
    }

    /// Stamp the caller's current stream, then count watchers (the caller
    /// included).
    async fn runtime_channel_info(&self, conn_id: u64, channel_id: &str) -> RuntimeChannelInfo {
        let mut registry = self.inner.registry.write().await;
        if let Some(conn) = registry.conns.get_mut(&conn_id) {
            conn.current_stream = Some(channel_id.to_owned());
        }
        let watchers_count = registry
            .conns
            .values()
            .filter(|c| c.auth.is_some() && c.current_stream.as_deref() == Some(channel_id))
            .count() as u64;
        RuntimeChannelInfo {
            channel_id: channel_id.to_owned(),
            watchers_count,
            channel_type: ChannelType::Official,
        }
    }

    async fn unregister(&self, conn_id: u64) {
        let mut registry = self.inner.registry.write().await;
        if let Some(conn) = registry.conns.remove(&conn_id) {
            if let Some(identity) = conn.auth {
                registry
                    .by_device
                    .remove(&(identity.user_id.clone(), identity.auth.device_id.clone()));
                if let Some(list) = registry.by_user.get_mut(&identity.user_id) {
                    list.retain(|&c| c != conn_id);
                    if list.is_empty() {
                        registry.by_user.remove(&identity.user_id);
                    }
                }
                self.inner
                    .online
                    .store(registry.by_device.len() as u64, Ordering::Relaxed);
                info!(conn_id, user_id = %identity.user_id, "subscriber unregistered");
            }
        }
        drop(registry);
        self.inner
            .pending
            .cancel_scope(&PendingScope::Subscriber(conn_id));
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Ping every connection on the configured period; a failed write closes
    /// the connection.
    pub async fn run_ping_timer(self) {
        let mut tick = tokio::time::interval(self.inner.ping_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            let conns: Vec<(u64, mpsc::Sender<Message>)> = {
                let registry = self.inner.registry.read().await;
                registry
                    .conns
                    .iter()
                    .map(|(&conn_id, c)| (conn_id, c.tx.clone()))
                    .collect()
            };
            debug!(count = conns.len(), "pinging subscribers");
            for (conn_id, tx) in conns {
                let seq = self.next_seq();
                // The reply is matched and silently accepted; the dropped
                // receiver is completed or swept either way.
                let _rx = self.inner.pending.register(
                    seq.clone(),
                    PendingScope::Subscriber(conn_id),
                    PING_REPLY_TIMEOUT,
                );
                let ping = server_ping_request(seq, &ServerPingInfo {
                    timestamp: now_ms(),
                });
                if tx.send(Message::Request(ping)).await.is_err() {
                    warn!(conn_id, "subscriber write failed, closing");
                    self.unregister(conn_id).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::{InMemoryDirectory, UserInfo};

    fn hub_with_users() -> SubscriberHub {
        let mut directory = InMemoryDirectory::new();
        directory.add_user(
            "u",
            "p",
            UserInfo {
                user_id: "uid-1".to_owned(),
                channels: vec!["A".to_owned(), "B".to_owned()],
                devices: vec!["d1".to_owned(), "d2".to_owned()],
                banned: false,
            },
        );
        directory.add_user(
            "banned",
            "p",
            UserInfo {
                user_id: "uid-2".to_owned(),
                channels: vec![],
                devices: vec!["d1".to_owned()],
                banned: true,
            },
        );
        SubscriberHub::new(
            Box::new(directory),
            "bw.example.com:5000".to_owned(),
            Duration::from_secs(60),
            Arc::new(AtomicU64::new(0)),
        )
    }

    async fn fake_conn(hub: &SubscriberHub) -> (u64, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let mut registry = hub.inner.registry.write().await;
        registry.next_conn_id += 1;
        let conn_id = registry.next_conn_id;
        registry.conns.insert(
            conn_id,
            ConnState {
                tx,
                auth: None,
                current_stream: None,
            },
        );
        (conn_id, rx)
    }

    fn auth(login: &str, password: &str, device: &str) -> AuthInfo {
        AuthInfo {
            login: login.to_owned(),
            password: password.to_owned(),
            device_id: device.to_owned(),
        }
    }

    #[tokio::test]
    async fn activation_pipeline_rejects_in_order() {
        let hub = hub_with_users();
        let (conn, _rx) = fake_conn(&hub).await;

        let miss = hub
            .activate_connection(conn, auth("nobody", "p", "d1"))
            .await
            .unwrap_err();
        assert_eq!((miss.code, miss.message.as_str()), (ErrorKind::NotFound, "Not found"));

        let wrong_pw = hub
            .activate_connection(conn, auth("u", "bad", "d1"))
            .await
            .unwrap_err();
        assert_eq!(wrong_pw.message, "Not found");

        let bad_device = hub
            .activate_connection(conn, auth("u", "p", "d9"))
            .await
            .unwrap_err();
        assert_eq!(bad_device.message, "Unknown device reject");

        let banned = hub
            .activate_connection(conn, auth("banned", "p", "d1"))
            .await
            .unwrap_err();
        assert_eq!(banned.message, "Banned user");

        hub.activate_connection(conn, auth("u", "p", "d1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_device_is_rejected_but_second_device_is_fine() {
        let hub = hub_with_users();
        let (first, _rx1) = fake_conn(&hub).await;
        let (second, _rx2) = fake_conn(&hub).await;

        hub.activate_connection(first, auth("u", "p", "d1"))
            .await
            .unwrap();
        let double = hub
            .activate_connection(second, auth("u", "p", "d1"))
            .await
            .unwrap_err();
        assert_eq!(double.code, ErrorKind::AlreadyExists);
        assert_eq!(double.message, "Double connection reject");

        // Same user on a different registered device is allowed.
        hub.activate_connection(second, auth("u", "p", "d2"))
            .await
            .unwrap();
        assert_eq!(hub.inner.online.load(Ordering::Relaxed), 2);

        // Releasing the device frees the slot.
        hub.unregister(first).await;
        assert_eq!(hub.inner.online.load(Ordering::Relaxed), 1);
        let (third, _rx3) = fake_conn(&hub).await;
        hub.activate_connection(third, auth("u", "p", "d1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn watcher_count_includes_the_caller_and_tracks_switches() {
        let hub = hub_with_users();
        let (a, _rxa) = fake_conn(&hub).await;
        let (b, _rxb) = fake_conn(&hub).await;
        hub.activate_connection(a, auth("u", "p", "d1")).await.unwrap();
        hub.activate_connection(b, auth("u", "p", "d2")).await.unwrap();

        assert_eq!(hub.runtime_channel_info(a, "C").await.watchers_count, 1);
        assert_eq!(hub.runtime_channel_info(b, "C").await.watchers_count, 2);

        // a tunes away; only b still watches C.
        assert_eq!(hub.runtime_channel_info(a, "D").await.watchers_count, 1);
        assert_eq!(hub.runtime_channel_info(b, "C").await.watchers_count, 1);

        // Disconnecting b removes its watch.
        hub.unregister(b).await;
        assert_eq!(hub.runtime_channel_info(a, "C").await.watchers_count, 1);
    }

    #[tokio::test]
    async fn unregister_erases_emptied_user_entry() {
        let hub = hub_with_users();
        let (conn, _rx) = fake_conn(&hub).await;
        hub.activate_connection(conn, auth("u", "p", "d1"))
            .await
            .unwrap();
        assert!(hub.inner.registry.read().await.by_user.contains_key("uid-1"));

        hub.unregister(conn).await;
        let registry = hub.inner.registry.read().await;
        assert!(!registry.by_user.contains_key("uid-1"));
        assert!(registry.by_device.is_empty());
        assert!(registry.conns.is_empty());
    }
}
