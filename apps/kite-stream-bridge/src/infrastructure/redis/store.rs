//! Redis State Store
//!
//! Each instrument owns two keys: `kt:state:{token}` with the JSON event and
//! `kt:ltp:{token}` with the bare last price, the key existing consumers
//! already read. Both are written in one atomic pipeline.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{ltp_key, state_key};
use crate::application::ports::{StateStore, StoreError};
use crate::domain::ticks::{InstrumentToken, TickEvent};

/// `StateStore` backed by Redis.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    /// Wrap an open connection.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn unavailable(e: &redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Values written under the state and last-price keys.
fn encode_state(event: &TickEvent) -> Result<(String, String), StoreError> {
    let json = serde_json::to_string(event).map_err(|e| StoreError::Encoding(e.to_string()))?;
    Ok((json, event.tick.last_price.to_string()))
}

fn decode_state(json: &str) -> Result<TickEvent, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Encoding(e.to_string()))
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn upsert(&self, event: &TickEvent) -> Result<(), StoreError> {
        let (json, last_price) = encode_state(event)?;
        let token = event.token();

        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .set(state_key(token), json)
            .ignore()
            .set(ltp_key(token), last_price)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(())
    }

    async fn read(&self, token: InstrumentToken) -> Result<Option<TickEvent>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(state_key(token))
            .await
            .map_err(|e| unavailable(&e))?;

        raw.as_deref().map(decode_state).transpose()
    }

    async fn remove(&self, token: InstrumentToken) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let (): () = conn
            .del(vec![state_key(token), ltp_key(token)])
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(())
    }

    async fn check(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(())
    }
}
