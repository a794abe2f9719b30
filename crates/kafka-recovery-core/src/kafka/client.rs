//! Kafka client for protocol-level communication.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::protocol::{Decodable, Encodable};
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::Result;

use super::metadata::{BrokerMetadata, TopicMetadata};

/// Largest response frame accepted from a broker
const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

/// Plaintext connection to one Kafka broker.
///
/// Connects lazily on the first request and drops the socket after any I/O
/// failure, so the next request reconnects.
pub struct KafkaClient {
    config: KafkaConfig,

    /// Addresses tried in order when (re)connecting
    servers: Vec<String>,

    connection: Mutex<Option<TcpStream>>,

    /// Broker metadata cache, refreshed by every metadata call
    brokers: parking_lot::Mutex<HashMap<i32, BrokerMetadata>>,

    correlation_id: AtomicI32,
}

impl KafkaClient {
    /// Client for the cluster's bootstrap servers
    pub fn new(config: KafkaConfig) -> Self {
        let servers = config.bootstrap_servers.clone();
        Self::with_servers(config, servers)
    }

    /// Client pinned to a single broker address
    pub fn for_broker(config: KafkaConfig, address: String) -> Self {
        Self::with_servers(config, vec![address])
    }

    fn with_servers(config: KafkaConfig, servers: Vec<String>) -> Self {
        Self {
            config,
            servers,
            connection: Mutex::new(None),
            brokers: parking_lot::Mutex::new(HashMap::new()),
            correlation_id: AtomicI32::new(1),
        }
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Open a connection now instead of on first request
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.connection.lock().await;
        if conn.is_none() {
            *conn = Some(self.open_stream().await?);
        }
        Ok(())
    }

    async fn open_stream(&self) -> Result<TcpStream> {
        let mut last_error = None;
        for server in &self.servers {
            match self.try_connect(server).await {
                Ok(stream) => {
                    debug!(broker = %server, "Connected to Kafka broker");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(broker = %server, error = %e, "Failed to connect");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| KafkaError::NoBrokersAvailable.into()))
    }

    async fn try_connect(&self, server: &str) -> Result<TcpStream> {
        let timeout = self.request_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(server))
            .await
            .map_err(|_| KafkaError::Timeout(format!("connect to {}", server)))?
            .map_err(|e| KafkaError::ConnectionFailed {
                broker: server.to_string(),
                message: e.to_string(),
            })?;

        self.configure_socket(&stream, server)?;
        Ok(stream)
    }

    /// Configure TCP socket options (keepalive, nodelay) based on connection config.
    fn configure_socket(&self, stream: &TcpStream, server: &str) -> Result<()> {
        let conn_config = &self.config.connection;
        let sock_ref = SockRef::from(stream);

        if conn_config.tcp_nodelay {
            sock_ref
                .set_nodelay(true)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP_NODELAY: {}", e),
                })?;
        }

        if conn_config.tcp_keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(conn_config.keepalive_time_secs))
                .with_interval(Duration::from_secs(conn_config.keepalive_interval_secs));

            sock_ref
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP keepalive: {}", e),
                })?;

            trace!(
                broker = server,
                time_secs = conn_config.keepalive_time_secs,
                interval_secs = conn_config.keepalive_interval_secs,
                "TCP keepalive enabled"
            );
        }

        Ok(())
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connection.request_timeout_ms)
    }

    fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and receive a response
    pub async fn send_request<Req, Resp>(&self, api_key: ApiKey, request: Req) -> Result<Resp>
    where
        Req: Encodable + Default,
        Resp: Decodable + Default,
    {
        let correlation_id = self.next_correlation_id();
        let api_version = api_version(api_key);

        let header = RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(StrBytes::from_string(self.config.client_id.clone())));

        let header_version = api_key.request_header_version(api_version);
        let mut buf = BytesMut::new();

        // Length prefix, patched below
        buf.put_i32(0);

        header
            .encode(&mut buf, header_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode header: {:?}", e)))?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode request: {:?}", e)))?;

        let len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        trace!(
            ?api_key,
            api_version,
            correlation_id,
            len,
            "Sending request"
        );

        let mut conn = self.connection.lock().await;
        if conn.is_none() {
            *conn = Some(self.open_stream().await?);
        }
        let Some(stream) = conn.as_mut() else {
            return Err(KafkaError::NoBrokersAvailable.into());
        };

        let exchange = tokio::time::timeout(self.request_timeout(), exchange(stream, &buf)).await;
        let mut response_bytes = match exchange {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                *conn = None;
                return Err(e);
            }
            Err(_) => {
                *conn = None;
                return Err(KafkaError::Timeout(format!("{:?} request", api_key)).into());
            }
        };
        drop(conn);

        let response_header_version = api_key.response_header_version(api_version);
        let response_header = ResponseHeader::decode(&mut response_bytes, response_header_version)
            .map_err(|e| {
                KafkaError::Protocol(format!("Failed to decode response header: {:?}", e))
            })?;
        if response_header.correlation_id != correlation_id {
            return Err(KafkaError::Protocol(format!(
                "correlation id mismatch: sent {}, got {}",
                correlation_id, response_header.correlation_id
            ))
            .into());
        }

        let response = Resp::decode(&mut response_bytes, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to decode response: {:?}", e)))?;

        Ok(response)
    }

    /// Fetch cluster metadata
    pub async fn fetch_metadata(&self, topics: Option<&[String]>) -> Result<Vec<TopicMetadata>> {
        super::metadata::fetch_metadata(self, topics).await
    }

    /// Get metadata for a specific topic
    pub async fn get_topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let topics = self.fetch_metadata(Some(&[topic.to_string()])).await?;
        topics
            .into_iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| KafkaError::TopicNotExists(topic.to_string()).into())
    }

    /// Get cached broker metadata
    pub fn get_broker(&self, broker_id: i32) -> Option<BrokerMetadata> {
        self.brokers.lock().get(&broker_id).cloned()
    }

    /// Update broker cache
    pub fn update_brokers(&self, brokers: Vec<BrokerMetadata>) {
        let mut cache = self.brokers.lock();
        for broker in brokers {
            cache.insert(broker.node_id, broker);
        }
    }
}

/// Write one framed request and read the framed response body.
async fn exchange(stream: &mut TcpStream, request: &[u8]) -> Result<Bytes> {
    stream
        .write_all(request)
        .await
        .map_err(|e| KafkaError::Protocol(format!("Failed to send request: {}", e)))?;

    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| KafkaError::Protocol(format!("Failed to read response length: {}", e)))?;
    let response_len = i32::from_be_bytes(len_buf);
    if response_len < 0 || response_len as usize > MAX_RESPONSE_SIZE {
        return Err(KafkaError::Protocol(format!("invalid response length {}", response_len)).into());
    }

    let mut response_buf = vec![0u8; response_len as usize];
    stream
        .read_exact(&mut response_buf)
        .await
        .map_err(|e| KafkaError::Protocol(format!("Failed to read response body: {}", e)))?;

    Ok(Bytes::from(response_buf))
}

/// API version used for each request type
fn api_version(api_key: ApiKey) -> i16 {
    match api_key {
        ApiKey::Metadata => 9,
        ApiKey::Fetch => 11,
        ApiKey::Produce => 8,
        ApiKey::ListOffsets => 5,
        ApiKey::OffsetFetch => 5,
        ApiKey::FindCoordinator => 2,
        ApiKey::DescribeGroups => 3,
        _ => 0,
    }
}
