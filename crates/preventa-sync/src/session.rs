//! Session identity and overlap control.
//!
//! A device may not run two sessions over the same watermark window at once:
//! both would push against, and pull into, the same view of its state. The
//! [`SessionRegistry`] admits one session per `(tenant, device, window)` and
//! releases the slot when the returned [`SessionGuard`] is dropped, including
//! when the session future is cancelled.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use preventa_core::{DeviceId, TenantId, Watermark};

use crate::error::{Result, SyncError};

/// Who is syncing, as established by the authenticated session layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
}

impl SessionContext {
    pub fn new(tenant_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            tenant_id: TenantId::new(tenant_id),
            device_id: DeviceId::new(device_id),
        }
    }
}

/// Random identifier of one session, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

type SessionKey = (TenantId, DeviceId, Option<Watermark>);

/// Sessions currently running on one engine instance.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<SessionKey>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a session, or fail with [`SyncError::SessionOverlap`] if the same
    /// device is already syncing from the same watermark.
    pub fn acquire(&self, ctx: &SessionContext, since: Option<Watermark>) -> Result<SessionGuard> {
        let key = (ctx.tenant_id.clone(), ctx.device_id.clone(), since);
        let mut active = self
            .active
            .lock()
            .map_err(|e| SyncError::Internal(format!("session registry poisoned: {e}")))?;

        if !active.insert(key.clone()) {
            return Err(SyncError::SessionOverlap {
                tenant: ctx.tenant_id.clone(),
                device: ctx.device_id.clone(),
                since,
            });
        }

        Ok(SessionGuard {
            id: SessionId::random(),
            key: Some(key),
            active: Arc::clone(&self.active),
        })
    }

    /// Number of sessions currently admitted.
    pub fn active_count(&self) -> usize {
        self.active.lock().map_or(0, |a| a.len())
    }
}

/// Holds a registry slot for the lifetime of one session.
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    key: Option<SessionKey>,
    active: Arc<Mutex<HashSet<SessionKey>>>,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let (Some(key), Ok(mut active)) = (self.key.take(), self.active.lock()) {
            active.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_window_overlaps() {
        let registry = SessionRegistry::new();
        let ctx = SessionContext::new("t1", "d1");

        let guard = registry.acquire(&ctx, Some(Watermark(3))).unwrap();
        let err = registry.acquire(&ctx, Some(Watermark(3))).unwrap_err();
        assert!(matches!(err, SyncError::SessionOverlap { .. }));
        assert!(err.is_retryable());

        drop(guard);
        assert!(registry.acquire(&ctx, Some(Watermark(3))).is_ok());
    }

    #[test]
    fn test_other_window_or_device_is_admitted() {
        let registry = SessionRegistry::new();
        let d1 = SessionContext::new("t1", "d1");
        let d2 = SessionContext::new("t1", "d2");

        let _a = registry.acquire(&d1, None).unwrap();
        let _b = registry.acquire(&d1, Some(Watermark(9))).unwrap();
        let _c = registry.acquire(&d2, None).unwrap();
        assert_eq!(registry.active_count(), 3);
    }

    #[test]
    fn test_registries_are_independent() {
        let ctx = SessionContext::new("t1", "d1");
        let one = SessionRegistry::new();
        let two = SessionRegistry::new();

        let _guard = one.acquire(&ctx, None).unwrap();
        assert!(two.acquire(&ctx, None).is_ok());
    }
}
