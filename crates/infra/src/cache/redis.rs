//! Redis-backed contention cache (optional).
//!
//! Strictly best-effort: every Redis failure is logged and treated as a
//! cache miss, so an unreachable Redis only costs extra contention queries.
//! Sample payloads are JSON with a server-side TTL.

use std::time::Duration;

use redis::Commands;
use tracing::warn;

use stocklock_core::ProductId;
use stocklock_engine::cache::StockCache;
use stocklock_ledger::ContentionSample;

fn contention_key(product_id: ProductId) -> String {
    format!("stock:contention:{product_id}")
}

/// Keys invalidated together when a product's stock changes. `available` and
/// `detail` are populated by read-side API layers sharing this Redis.
fn product_keys(product_id: ProductId) -> [String; 3] {
    [
        contention_key(product_id),
        format!("stock:available:{product_id}"),
        format!("stock:detail:{product_id}"),
    ]
}

/// Redis implementation of [`StockCache`].
#[derive(Debug, Clone)]
pub struct RedisStockCache {
    client: redis::Client,
}

impl RedisStockCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self { client })
    }
}

impl StockCache for RedisStockCache {
    fn get_sample(&self, product_id: ProductId) -> Option<ContentionSample> {
        let mut conn = match self.client.get_connection() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "redis unavailable, treating as cache miss");
                return None;
            }
        };

        let payload: Option<String> = match conn.get(contention_key(product_id)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "redis GET failed, treating as cache miss");
                return None;
            }
        };

        match payload {
            Some(json) => match serde_json::from_str(&json) {
                Ok(sample) => Some(sample),
                Err(err) => {
                    warn!(error = %err, "discarding malformed cached sample");
                    None
                }
            },
            None => None,
        }
    }

    fn put_sample(&self, product_id: ProductId, sample: ContentionSample, ttl: Duration) {
        let secs = ttl.as_secs();
        if secs == 0 {
            return;
        }
        let json = match serde_json::to_string(&sample) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize contention sample");
                return;
            }
        };
        let mut conn = match self.client.get_connection() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "redis unavailable, skipping cache write");
                return;
            }
        };
        if let Err(err) = conn.set_ex::<_, _, ()>(contention_key(product_id), json, secs) {
            warn!(error = %err, "redis SETEX failed, skipping cache write");
        }
    }

    fn invalidate_product(&self, product_id: ProductId) {
        let mut conn = match self.client.get_connection() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "redis unavailable, skipping invalidation");
                return;
            }
        };
        if let Err(err) = conn.del::<_, ()>(&product_keys(product_id)[..]) {
            warn!(error = %err, "redis DEL failed, stale keys may linger");
        }
    }
}
