//! Redis counter store.
//!
//! Each batch becomes one pipeline of `INCRBY key hits` followed by
//! `EXPIRE key ttl NX`, so only the increment that creates a counter sets its
//! lifetime (`NX` needs Redis 7 or newer).

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use tracing::{debug, info};

use super::{CounterOp, CounterStore, StoreError};
use crate::config::{SocketType, StoreSettings};
use crate::error::{RateCacheError, Result};

/// Upper bound on one pipeline round trip.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_PORT: u16 = 6379;

/// A pool of multiplexed Redis connections used round-robin.
pub struct RedisStore {
    addr: ConnectionAddr,
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &format_args!("{}", self.addr))
            .field("pool_size", &self.connections.len())
            .finish()
    }
}

impl RedisStore {
    /// Open `pool_size` connections to the store described by `settings`.
    pub async fn connect(settings: &StoreSettings) -> Result<Self> {
        let info = connection_info(settings)?;
        let addr = info.addr.clone();
        info!(
            addr = %addr,
            pool_size = settings.pool_size,
            tls = settings.tls,
            auth = info.redis.password.is_some(),
            "Connecting to counter store"
        );

        let client = redis::Client::open(info).map_err(unavailable)?;
        let mut connections = Vec::with_capacity(settings.pool_size.max(1));
        for _ in 0..settings.pool_size.max(1) {
            let manager = tokio::time::timeout(OPERATION_TIMEOUT, client.get_connection_manager())
                .await
                .map_err(|_| StoreError::Unavailable("timed out connecting".to_string()))?
                .map_err(unavailable)?;
            connections.push(manager);
        }

        Ok(Self {
            addr,
            connections,
            next: AtomicUsize::new(0),
        })
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_batch(&self, ops: &[CounterOp]) -> std::result::Result<Vec<u64>, StoreError> {
        let mut pipe = redis::pipe();
        for op in ops {
            pipe.cmd("INCRBY").arg(&op.key).arg(op.hits);
            pipe.cmd("EXPIRE")
                .arg(&op.key)
                .arg(op.ttl.as_secs())
                .arg("NX")
                .ignore();
        }

        let mut conn = self.connection();
        let counts: Vec<u64> = tokio::time::timeout(OPERATION_TIMEOUT, pipe.query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Unavailable("pipeline timed out".to_string()))?
            .map_err(unavailable)?;

        debug!(size = ops.len(), "Counter pipeline executed");
        Ok(counts)
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Translate store settings into redis-rs connection parameters.
///
/// A `url` carrying a scheme (`redis://`, `rediss://`, `unix://`) is parsed
/// as is; otherwise it is `host[:port]` or a socket path per `socket_type`.
/// A configured password overrides one embedded in a URL.
fn connection_info(settings: &StoreSettings) -> Result<ConnectionInfo> {
    let mut info = if settings.url.contains("://") {
        settings
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| RateCacheError::Config(format!("invalid store url: {}", e)))?
    } else {
        ConnectionInfo {
            addr: connection_addr(settings)?,
            redis: RedisConnectionInfo::default(),
        }
    };
    if let Some(password) = &settings.auth {
        info.redis.password = Some(password.clone());
    }
    Ok(info)
}

fn connection_addr(settings: &StoreSettings) -> Result<ConnectionAddr> {
    if settings.socket_type == SocketType::Unix {
        return Ok(ConnectionAddr::Unix(PathBuf::from(&settings.url)));
    }

    let (host, port) = match settings.url.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                RateCacheError::Config(format!("invalid port in store address '{}'", settings.url))
            })?;
            (host.to_string(), port)
        }
        None => (settings.url.clone(), DEFAULT_PORT),
    };

    Ok(if settings.tls {
        ConnectionAddr::TcpTls {
            host,
            port,
            insecure: false,
            tls_params: None,
        }
    } else {
        ConnectionAddr::Tcp(host, port)
    })
}
