//! Minimal QEMU Machine Protocol client.
//!
//! QMP is line-delimited JSON over TCP: the server sends a greeting, the
//! client negotiates capabilities and then issues one command per line.
//! Asynchronous event lines are skipped while waiting for a reply.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ProviderError, Result};

const QMP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connected, capability-negotiated QMP session.
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect to the management port of a local VM.
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = tokio::time::timeout(QMP_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| ProviderError::api("qmp", format!("timed out connecting to port {}", port)))?
            .map_err(|e| ProviderError::api("qmp", format!("connect to port {}: {}", port, e)))?;

        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(ProviderError::api("qmp", format!("unexpected greeting: {}", greeting)));
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Run `command` and return its `return` payload.
    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut request = json!({ "execute": command });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        debug!(request = %request, "Sending QMP command");

        let mut line = request.to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProviderError::api("qmp", format!("write {}: {}", command, e)))?;

        loop {
            let reply = self.read_message().await?;
            if let Some(value) = reply.get("return") {
                return Ok(value.clone());
            }
            if let Some(error) = reply.get("error") {
                let desc = error
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(ProviderError::api("qmp", format!("{}: {}", command, desc)));
            }
            // Asynchronous event; keep waiting for the reply.
        }
    }

    async fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        let read = tokio::time::timeout(QMP_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| ProviderError::api("qmp", "timed out waiting for reply"))?
            .map_err(|e| ProviderError::api("qmp", format!("read: {}", e)))?;
        if read == 0 {
            return Err(ProviderError::api("qmp", "connection closed"));
        }
        serde_json::from_str(line.trim())
            .map_err(|e| ProviderError::api("qmp", format!("invalid reply {:?}: {}", line.trim(), e)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiates_and_executes() {
        let (port, received) = testing::serve(&[]).await;

        let mut client = QmpClient::connect(port).await.unwrap();
        client.execute("stop", None).await.unwrap();

        let commands: Vec<String> = received
            .lock()
            .unwrap()
            .iter()
            .map(|r| r["execute"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(commands, vec!["qmp_capabilities", "stop"]);
    }

    #[tokio::test]
    async fn test_error_reply_is_returned() {
        let (port, _) = testing::serve(&["device_del"]).await;

        let mut client = QmpClient::connect(port).await.unwrap();
        let err = client
            .execute("device_del", Some(json!({ "id": "disk0" })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(QmpClient::connect(port).await.is_err());
    }
}
