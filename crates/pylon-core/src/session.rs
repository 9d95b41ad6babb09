//! Client session: identity, bound user, key/value data and close callbacks.
//!
//! A session is created by and owned 1:1 by a network entity (the agent).
//! It only holds a weak reference back to the entity, so dropping the agent
//! is never blocked by its session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::errors::AgentError;
use crate::serialize::Payload;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Callback run once when the owning agent closes.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Capabilities a session forwards to its owning connection.
#[async_trait]
pub trait NetworkEntity: Send + Sync {
    /// Push a message on `route`.
    async fn push(&self, route: &str, payload: Payload) -> Result<(), AgentError>;
    /// Respond to request `mid`.
    async fn response_mid(&self, mid: u64, payload: Payload) -> Result<(), AgentError>;
    /// Close the underlying connection.
    async fn close(&self) -> Result<(), AgentError>;
    /// Remote address of the client.
    fn remote_addr(&self) -> SocketAddr;
}

/// Session binding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Empty user id.
    #[error("illegal uid")]
    IllegalUid,
    /// The session is already bound to a user.
    #[error("session already bound to uid {0}")]
    AlreadyBound(String),
}

/// Per-connection session.
pub struct Session {
    id: u64,
    uid: RwLock<Option<String>>,
    data: Mutex<HashMap<String, Value>>,
    on_close: Mutex<Vec<CloseCallback>>,
    entity: Weak<dyn NetworkEntity>,
}

impl Session {
    /// Create a session bound to `entity` with a fresh process-unique id.
    pub fn new(entity: Weak<dyn NetworkEntity>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            uid: RwLock::new(None),
            data: Mutex::new(HashMap::new()),
            on_close: Mutex::new(Vec::new()),
            entity,
        }
    }

    /// Session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bound user id, empty when unbound.
    pub fn uid(&self) -> String {
        self.uid.read().clone().unwrap_or_default()
    }

    /// Bind the session to a user.
    pub fn bind(&self, uid: impl Into<String>) -> Result<(), SessionError> {
        let uid = uid.into();
        if uid.is_empty() {
            return Err(SessionError::IllegalUid);
        }
        let mut bound = self.uid.write();
        if let Some(existing) = bound.as_ref() {
            return Err(SessionError::AlreadyBound(existing.clone()));
        }
        *bound = Some(uid);
        Ok(())
    }

    /// Store a value under `key`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let _ = self.data.lock().insert(key.into(), value);
    }

    /// Read a value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    /// Remove a value, returning it.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.lock().remove(key)
    }

    /// Whether a value exists under `key`.
    pub fn has_key(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    /// Drop all stored values.
    pub fn clear(&self) {
        self.data.lock().clear();
    }

    /// Register a callback to run when the connection closes.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close.lock().push(Box::new(callback));
    }

    /// Number of registered close callbacks not yet run.
    pub fn close_callback_count(&self) -> usize {
        self.on_close.lock().len()
    }

    /// Drain the close callbacks so they can only ever run once.
    pub fn take_close_callbacks(&self) -> Vec<CloseCallback> {
        std::mem::take(&mut *self.on_close.lock())
    }

    /// Run every registered close callback, in registration order.
    ///
    /// A panicking callback is logged and does not stop the ones after it.
    /// Returns how many callbacks panicked.
    pub fn run_close_callbacks(&self) -> usize {
        let mut panicked = 0;
        for callback in self.take_close_callbacks() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
                panicked += 1;
                error!(
                    session_id = self.id,
                    uid = %self.uid(),
                    panic = %panic_message(panic.as_ref()),
                    "session close callback panicked"
                );
            }
        }
        panicked
    }

    /// Push a message to this session's client.
    pub async fn push(&self, route: &str, payload: impl Into<Payload>) -> Result<(), AgentError> {
        self.entity()?.push(route, payload.into()).await
    }

    /// Respond to request `mid` from this session's client.
    pub async fn response_mid(
        &self,
        mid: u64,
        payload: impl Into<Payload>,
    ) -> Result<(), AgentError> {
        self.entity()?.response_mid(mid, payload.into()).await
    }

    /// Close this session's connection.
    pub async fn close(&self) -> Result<(), AgentError> {
        self.entity()?.close().await
    }

    /// Remote address of the client, if the connection is still alive.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.entity.upgrade().map(|e| e.remote_addr())
    }

    fn entity(&self) -> Result<std::sync::Arc<dyn NetworkEntity>, AgentError> {
        self.entity.upgrade().ok_or(AgentError::BrokenPipe)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("close_callbacks", &self.close_callback_count())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
