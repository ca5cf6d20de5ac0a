#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use school_admin::model::{Role, UserProfile};
use school_admin::supabase::{Backend, BackendError, BackendResult, Query};

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub target: String,
    pub body: Value,
}

/// In-memory tables evaluated with `Query::apply`, with every call recorded.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    rpc: Arc<Mutex<HashMap<String, VecDeque<BackendResult<Value>>>>>,
    functions: Arc<Mutex<HashMap<String, VecDeque<BackendResult<Value>>>>>,
    select_delay: Option<Duration>,
    select_failures: Arc<Mutex<HashMap<String, fn() -> BackendError>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_select_delay(delay: Duration) -> Self {
        Self {
            select_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_rpc(&self, name: &str, result: BackendResult<Value>) {
        self.rpc
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn push_function(&self, name: &str, result: BackendResult<Value>) {
        self.functions
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(result);
    }

    /// Every select on `table` fails with `err()` until `heal` is called.
    pub fn fail_select(&self, table: &str, err: fn() -> BackendError) {
        self.select_failures
            .lock()
            .unwrap()
            .insert(table.to_string(), err);
    }

    pub fn heal(&self, table: &str) {
        self.select_failures.lock().unwrap().remove(table);
    }

    fn select_failure(&self, table: &str) -> Option<BackendError> {
        self.select_failures.lock().unwrap().get(table).map(|make| make())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str, target: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.op == op && c.target == target)
            .count()
    }

    fn record(&self, op: &'static str, target: &str, body: Value) {
        self.calls.lock().unwrap().push(Call {
            op,
            target: target.to_string(),
            body,
        });
    }
}

fn with_defaults(mut row: Value) -> Value {
    if let Some(obj) = row.as_object_mut() {
        obj.entry("id").or_insert_with(|| json!(Uuid::new_v4()));
        obj.entry("created_at").or_insert_with(|| json!(Utc::now()));
    }
    row
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: &str, query: &Query) -> BackendResult<Vec<Value>> {
        self.record("select", table, json!(query.to_params()));
        if let Some(err) = self.select_failure(table) {
            return Err(err);
        }
        // Rows are read up front; the delay models a slow response.
        let rows = query.apply(&self.rows(table));
        if let Some(delay) = self.select_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: Value) -> BackendResult<Vec<Value>> {
        self.record("insert", table, rows.clone());
        let rows: Vec<Value> = match rows {
            Value::Array(rows) => rows.into_iter().map(with_defaults).collect(),
            row => vec![with_defaults(row)],
        };
        self.seed(table, rows.clone());
        Ok(rows)
    }

    async fn update(&self, table: &str, query: &Query, patch: Value) -> BackendResult<Vec<Value>> {
        self.record("update", table, patch.clone());
        let mut tables = self.tables.lock().unwrap();
        let mut updated = Vec::new();
        for row in tables.entry(table.to_string()).or_default().iter_mut() {
            if !query.matches(row) {
                continue;
            }
            if let (Some(obj), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
                for (k, v) in changes {
                    obj.insert(k.clone(), v.clone());
                }
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, query: &Query) -> BackendResult<Vec<Value>> {
        self.record("delete", table, json!(query.to_params()));
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        let (gone, kept): (Vec<Value>, Vec<Value>) = rows.drain(..).partition(|r| query.matches(r));
        *rows = kept;
        Ok(gone)
    }

    async fn rpc(&self, name: &str, args: Value) -> BackendResult<Value> {
        self.record("rpc", name, args);
        self.rpc
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(Value::Null))
    }

    async fn invoke_function(&self, name: &str, bearer: &str, body: Value) -> BackendResult<Value> {
        self.record("function", name, json!({ "bearer": bearer, "body": body }));
        self.functions
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Err(BackendError::NotFound))
    }
}

pub fn profile(role: Role, school_id: Option<Uuid>) -> UserProfile {
    UserProfile {
        id: Uuid::new_v4(),
        email: Some(format!("{}@ecole.sn", role.as_str())),
        full_name: format!("{} test", role.as_str()),
        first_name: None,
        last_name: None,
        phone: None,
        role,
        school_id,
        class_id: None,
        is_active: true,
        created_at: Utc::now(),
    }
}

pub fn user_row(profile: &UserProfile) -> Value {
    serde_json::to_value(profile).unwrap()
}
