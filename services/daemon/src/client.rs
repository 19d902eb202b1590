//! Outbound control client.
//!
//! Used by `--stop` to address a running daemon over its control endpoint,
//! and by anything else that wants to speak the service protocol as the
//! upstream does.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tv_proto::commands::{ActivateInfo, pack};
use tv_proto::{Message, Request, RpcCodec, RpcError, methods};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("control connection closed before a reply")]
    Disconnected,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("daemon refused: {0}")]
    Refused(RpcError),
    #[error("timed out waiting for the daemon")]
    Timeout,
}

/// A connected control client.
pub struct ControlClient {
    framed: Framed<TcpStream, RpcCodec>,
    seq: u64,
}

impl ControlClient {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_owned(),
                source,
            })?;
        Ok(ControlClient {
            framed: Framed::new(stream, RpcCodec::new()),
            seq: 0,
        })
    }

    /// Send one request and wait for its reply, skipping interleaved
    /// notifications.
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<String>,
    ) -> Result<String, ClientError> {
        self.seq += 1;
        let seq = self.seq.to_string();
        let req = Request::new(seq.clone(), method, params);
        self.framed
            .send(Message::Request(req))
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        loop {
            let frame = tokio::time::timeout(Duration::from_secs(30), self.framed.next())
                .await
                .map_err(|_| ClientError::Timeout)?;
            match frame {
                None => return Err(ClientError::Disconnected),
                Some(Err(e)) => return Err(ClientError::Protocol(e.to_string())),
                Some(Ok(Message::Response(resp))) if resp.id == seq => {
                    return resp.result.map_err(ClientError::Refused);
                }
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Ask a running daemon to shut down, authenticated by license.
pub async fn send_stop_service(addr: &str, license: &str) -> Result<(), ClientError> {
    let mut client = ControlClient::connect(addr).await?;
    client
        .call(
            methods::STOP_SERVICE,
            Some(pack(&ActivateInfo {
                license: license.to_owned(),
            })),
        )
        .await?;
    Ok(())
}
