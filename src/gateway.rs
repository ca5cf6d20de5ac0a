//! Read-through cache in front of table reads.
//!
//! Entries live in a table-scoped map (`table -> options key -> entry`), so a
//! write to a table drops that table's bucket in one step. There is no size
//! bound and no LRU; staleness is bounded only by the TTL.
//!
//! Each table also carries a write generation. A read only fills the cache if
//! no write or invalidation of its table happened while it was in flight.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use crate::events::{EventBus, WriteOp};
use crate::supabase::{Backend, BackendResult, Query};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Arc<Vec<Value>>,
    stored_at: Instant,
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub data: Arc<Vec<Value>>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub tables: usize,
    pub entries: usize,
}

#[derive(Clone)]
pub struct ApiGateway {
    backend: Arc<dyn Backend>,
    events: EventBus,
    ttl: Duration,
    cache: Arc<DashMap<String, HashMap<String, CacheEntry>>>,
    generations: Arc<DashMap<String, u64>>,
}

impl ApiGateway {
    pub fn new(backend: Arc<dyn Backend>, events: EventBus) -> Self {
        Self::with_ttl(backend, events, DEFAULT_TTL)
    }

    pub fn with_ttl(backend: Arc<dyn Backend>, events: EventBus, ttl: Duration) -> Self {
        Self {
            backend,
            events,
            ttl,
            cache: Arc::new(DashMap::new()),
            generations: Arc::new(DashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn lookup(&self, table: &str, key: &str) -> Option<Arc<Vec<Value>>> {
        let bucket = self.cache.get(table)?;
        let entry = bucket.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(Arc::clone(&entry.data))
        } else {
            None
        }
    }

    /// Cached table read; a miss goes to the backend and fills the cache.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn query(&self, table: &str, query: &Query) -> BackendResult<GatewayResponse> {
        let key = query.cache_key();
        if let Some(data) = self.lookup(table, &key) {
            debug!("cache hit");
            return Ok(GatewayResponse {
                data,
                from_cache: true,
            });
        }

        let generation = *self.generations.entry(table.to_string()).or_insert(0);
        let rows = self.backend.select(table, query).await?;
        let data = Arc::new(rows);
        // The bucket guard is held across the check so a concurrent
        // invalidation either lands first or removes this entry afterwards.
        let mut bucket = self.cache.entry(table.to_string()).or_default();
        if self.generation(table) == generation {
            bucket.insert(
                key,
                CacheEntry {
                    data: Arc::clone(&data),
                    stored_at: Instant::now(),
                },
            );
        } else {
            debug!("table written during read; not caching");
        }
        drop(bucket);
        self.cache.remove_if(table, |_, bucket| bucket.is_empty());
        Ok(GatewayResponse {
            data,
            from_cache: false,
        })
    }

    pub async fn insert(&self, table: &str, rows: Value) -> BackendResult<Vec<Value>> {
        let out = self.backend.insert(table, rows).await?;
        self.after_write(table, WriteOp::Insert);
        Ok(out)
    }

    pub async fn update(&self, table: &str, query: &Query, patch: Value) -> BackendResult<Vec<Value>> {
        let out = self.backend.update(table, query, patch).await?;
        self.after_write(table, WriteOp::Update);
        Ok(out)
    }

    pub async fn delete(&self, table: &str, query: &Query) -> BackendResult<Vec<Value>> {
        let out = self.backend.delete(table, query).await?;
        self.after_write(table, WriteOp::Delete);
        Ok(out)
    }

    /// Uncached stored-procedure call.
    pub async fn rpc(&self, name: &str, args: Value) -> BackendResult<Value> {
        self.backend.rpc(name, args).await
    }

    fn after_write(&self, table: &str, op: WriteOp) {
        self.invalidate(table);
        self.events.emit_data_changed(table, op);
    }

    fn generation(&self, table: &str) -> u64 {
        self.generations.get(table).map(|g| *g).unwrap_or(0)
    }

    pub fn invalidate(&self, table: &str) {
        *self.generations.entry(table.to_string()).or_insert(0) += 1;
        if self.cache.remove(table).is_some() {
            debug!(table, "cache invalidated");
        }
    }

    pub fn clear(&self) {
        for mut generation in self.generations.iter_mut() {
            *generation += 1;
        }
        self.cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            tables: 0,
            entries: 0,
        };
        for bucket in self.cache.iter() {
            stats.tables += 1;
            stats.entries += bucket.value().len();
        }
        stats
    }
}
