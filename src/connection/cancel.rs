//! Side-channel query cancellation.
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use super::Config;
use crate::common::ByteStr;
use crate::error::Result;
use crate::net::Socket;
use crate::protocol::{backend::BackendKeyData, frontend};

/// Credentials for cancelling an in-flight query.
///
/// A cancel request never traverses the main connection: it is a separate
/// transient transport whose sole job is to deliver the 16-byte request and
/// disconnect. Fire-and-forget; the main connection still drains the
/// resulting error normally, whether or not the cancellation took effect.
#[derive(Debug, Clone)]
pub struct CancelToken {
    process_id: i32,
    secret_key: i32,
    socket: Option<ByteStr>,
    host: ByteStr,
    port: u16,
}

impl CancelToken {
    pub(crate) fn new(key: &BackendKeyData, config: &Config) -> Self {
        Self {
            process_id: key.process_id,
            secret_key: key.secret_key,
            socket: config.socket.clone(),
            host: config.host.clone(),
            port: config.port,
        }
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Open a fresh transport, deliver the cancel request, disconnect.
    ///
    /// No response is expected; the server simply closes the side channel.
    pub async fn cancel(&self) -> Result<()> {
        let mut socket = match &self.socket {
            Some(path) => Socket::connect_path(path).await?,
            None => Socket::connect_tcp(&self.host, self.port).await?,
        };

        let mut buf = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        socket.shutdown().await?;
        Ok(())
    }
}
