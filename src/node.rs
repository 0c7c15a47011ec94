use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::config::DialConfig;
use crate::protocol::{Command, RespCodec, RespValue};

/// A request/response connection to one cluster node.
///
/// Replies come back in FIFO order on the wire, which is what the pipeliner
/// relies on for in-batch ordering. Any transport failure is sticky: the
/// connection refuses further use and reports the fault through [`fault`].
///
/// [`fault`]: NodeConnection::fault
pub struct NodeConnection {
    addr: String,
    framed: Framed<TcpStream, RespCodec>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    fault: Option<String>,
    // sent-but-unreceived replies; a connection abandoned mid-exchange must
    // not be mistaken for a clean one
    pending: usize,
}

impl NodeConnection {
    pub async fn connect(addr: &str, dial: &DialConfig) -> Result<Self> {
        let stream = timeout(dial.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", addr))?
            .with_context(|| format!("failed to connect to {}", addr))?;
        stream
            .set_nodelay(true)
            .with_context(|| format!("failed to set TCP_NODELAY on {}", addr))?;
        Ok(Self {
            addr: addr.to_string(),
            framed: Framed::new(stream, RespCodec),
            read_timeout: dial.read_timeout(),
            write_timeout: dial.write_timeout(),
            fault: None,
            pending: 0,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_healthy(&self) -> bool {
        self.fault.is_none()
    }

    /// Healthy and with no reply still owed by the server. Only such
    /// connections may go back into an idle queue.
    pub fn is_recyclable(&self) -> bool {
        self.fault.is_none() && self.pending == 0
    }

    /// Sticky transport fault, if the connection has one.
    pub fn fault(&self) -> Option<anyhow::Error> {
        self.fault.as_ref().map(|msg| anyhow!("{}", msg))
    }

    /// Issue one command and wait for its reply.
    pub async fn do_cmd(&mut self, command: &Command) -> Result<RespValue> {
        self.send(command).await?;
        self.flush().await?;
        self.receive().await
    }

    /// Queue a command frame in the write buffer without flushing.
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        self.ensure_usable()?;
        let frame = command.to_resp();
        let result = match self.write_timeout {
            Some(limit) => match timeout(limit, self.framed.feed(frame)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!("write timed out")),
            },
            None => self.framed.feed(frame).await,
        };
        if result.is_ok() {
            self.pending += 1;
        }
        self.record(result)
    }

    /// Push buffered frames onto the wire.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let result = match self.write_timeout {
            Some(limit) => match timeout(limit, self.framed.flush()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!("flush timed out")),
            },
            None => self.framed.flush().await,
        };
        self.record(result)
    }

    /// Read the next reply frame, honoring the configured read timeout.
    pub async fn receive(&mut self) -> Result<RespValue> {
        self.ensure_usable()?;
        let result = match self.read_timeout {
            Some(limit) => match timeout(limit, self.framed.next()).await {
                Ok(item) => flatten(item),
                Err(_) => Err(anyhow!("read timed out")),
            },
            None => flatten(self.framed.next().await),
        };
        if result.is_ok() {
            self.pending = self.pending.saturating_sub(1);
        }
        self.record(result)
    }

    /// Read the next reply frame with an explicit one-shot deadline.
    pub async fn receive_timeout(&mut self, limit: Duration) -> Result<RespValue> {
        self.ensure_usable()?;
        let result = match timeout(limit, self.framed.next()).await {
            Ok(item) => flatten(item),
            Err(_) => Err(anyhow!("read timed out")),
        };
        if result.is_ok() {
            self.pending = self.pending.saturating_sub(1);
        }
        self.record(result)
    }

    /// Force a sticky fault, keeping the connection out of any idle queue.
    /// Used when an exchange is abandoned with a reply still in flight.
    pub(crate) fn poison(&mut self, reason: &str) {
        if self.fault.is_none() {
            self.fault = Some(reason.to_string());
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if let Some(msg) = &self.fault {
            bail!("connection to {} unusable: {}", self.addr, msg);
        }
        Ok(())
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fault = Some(format!("{err:#}"));
        }
        result
    }
}

fn flatten(item: Option<Result<RespValue>>) -> Result<RespValue> {
    match item {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(err),
        None => Err(anyhow!("connection closed by peer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn canned_server(replies: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut scratch = [0u8; 512];
            let _ = socket.read(&mut scratch).await;
            let _ = socket.write_all(replies).await;
        });
        addr
    }

    #[tokio::test]
    async fn do_cmd_round_trips_a_reply() {
        let addr = canned_server(b"+PONG\r\n").await;
        let mut conn = NodeConnection::connect(&addr.to_string(), &DialConfig::default())
            .await
            .expect("connect");
        let reply = conn.do_cmd(&Command::new("PING", &[])).await.expect("do");
        assert_eq!(reply, RespValue::simple("PONG"));
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn peer_close_makes_the_connection_sticky_faulted() {
        let addr = canned_server(b"").await;
        let mut conn = NodeConnection::connect(&addr.to_string(), &DialConfig::default())
            .await
            .expect("connect");
        let err = conn.do_cmd(&Command::new("PING", &[])).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        assert!(!conn.is_healthy());
        assert!(conn.fault().is_some());
        // every later call short-circuits on the recorded fault
        let err = conn.receive().await.unwrap_err();
        assert!(err.to_string().contains("unusable"));
    }

    #[tokio::test]
    async fn read_timeout_is_reported_as_such() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let mut conn = NodeConnection::connect(&addr.to_string(), &DialConfig::default())
            .await
            .expect("connect");
        let err = conn
            .receive_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
