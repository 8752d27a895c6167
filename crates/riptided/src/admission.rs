//! Concurrent-subscriber admission control.
//!
//! Backed by a shared Redis counter so the ceiling holds across replicas.
//! The counter is advisory: any Redis failure fails open, and the whole
//! mechanism is disabled when no Redis URL is configured.

use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// The shared counter key.
const COUNTER_KEY: &str = "realtime:connections";

/// Denied: the ceiling was reached.
#[derive(Debug)]
pub struct OverLimit;

/// Shared admission handle, cheap to clone per connection.
#[derive(Clone)]
pub struct AdmissionCounter {
    conn: Option<ConnectionManager>,
    limit: u64,
}

impl AdmissionCounter {
    /// Connects to Redis when a URL is configured. Connection failures
    /// disable the counter rather than blocking startup.
    pub async fn connect(redis_url: Option<&str>, limit: u64) -> Self {
        let conn = match redis_url {
            None => None,
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        warn!(error = %e, "admission counter unreachable, failing open");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "invalid redis url, admission control disabled");
                    None
                }
            },
        };
        Self { conn, limit }
    }

    /// Counter disabled or unreachable at startup.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.conn.is_none()
    }

    /// Increments the shared counter and compares the post-increment
    /// value against the ceiling; over the ceiling the increment is
    /// rolled back and the connection denied. Counter errors fail open.
    pub async fn acquire(&self) -> Result<AdmissionPermit, OverLimit> {
        let Some(conn) = &self.conn else {
            return Ok(AdmissionPermit { conn: None });
        };
        let mut conn = conn.clone();

        let count: u64 = match redis::cmd("INCR")
            .arg(COUNTER_KEY)
            .query_async(&mut conn)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "admission increment failed, failing open");
                return Ok(AdmissionPermit { conn: None });
            }
        };

        if count > self.limit {
            let _: Result<i64, _> = redis::cmd("DECR")
                .arg(COUNTER_KEY)
                .query_async(&mut conn)
                .await;
            debug!(count, limit = self.limit, "connection denied over ceiling");
            return Err(OverLimit);
        }

        Ok(AdmissionPermit { conn: Some(conn) })
    }
}

/// One admitted connection. Dropping the permit decrements the shared
/// counter from a detached task, so cleanup happens on every session
/// exit path.
pub struct AdmissionPermit {
    conn: Option<ConnectionManager>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            tokio::spawn(async move {
                let result: Result<i64, _> = redis::cmd("DECR")
                    .arg(COUNTER_KEY)
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = result {
                    debug!(error = %e, "admission decrement failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_counter_always_admits() {
        let counter = AdmissionCounter::connect(None, 1).await;
        assert!(counter.disabled());

        let first = counter.acquire().await;
        let second = counter.acquire().await;
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn unreachable_redis_fails_open() {
        // Nothing listens here; the constructor must not error out.
        let counter = AdmissionCounter::connect(Some("redis://127.0.0.1:1"), 1).await;
        assert!(counter.disabled());
        assert!(counter.acquire().await.is_ok());
    }
}
