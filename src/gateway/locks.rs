use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::{
    domain::UserId,
    error::ErrorCategory,
    gateway::ApiError,
    storage::CoordinationStore,
};

/// A held per-user lease in the coordination store.
///
/// Serializes conflicting order/cancel mutations for one user across gateway
/// replicas. The lease expires on its own after the TTL, so a crashed holder
/// cannot wedge the user; release validates the ownership token.
pub struct UserLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    released: bool,
}

impl UserLock {
    /// Tries to take the user's lock. A busy lock is a 503 for the caller.
    pub async fn acquire(
        store: Arc<dyn CoordinationStore>,
        user_id: &UserId,
        ttl: Duration,
    ) -> Result<Self, ApiError> {
        let key = format!("user-lock:{user_id}");
        let token = Uuid::new_v4().to_string();
        let acquired = store
            .acquire(&key, &token, ttl)
            .await
            .map_err(ApiError::from)?;
        if !acquired {
            return Err(ApiError::new(
                ErrorCategory::Unavailable,
                "another request for this user is in flight",
            ));
        }
        Ok(Self {
            store,
            key,
            token,
            released: false,
        })
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.store.release(&self.key, &self.token).await {
            warn!(key = %self.key, error = %err, "lock release failed");
        }
    }
}

impl Drop for UserLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best effort: the lease TTL is the real safety net.
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        tokio::spawn(async move {
            let _ = store.release(&key, &token).await;
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryCoordinationStore;

    #[tokio::test]
    async fn second_acquire_is_rejected_while_held() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let user = UserId::from("u1");
        let lock = UserLock::acquire(store.clone(), &user, Duration::from_secs(30))
            .await
            .unwrap();

        let busy = UserLock::acquire(store.clone(), &user, Duration::from_secs(30)).await;
        assert!(busy.is_err());

        lock.release().await;
        assert!(
            UserLock::acquire(store, &user, Duration::from_secs(30))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let user = UserId::from("u1");
        let _stale = UserLock::acquire(store.clone(), &user, Duration::ZERO)
            .await
            .unwrap();
        assert!(
            UserLock::acquire(store, &user, Duration::from_secs(30))
                .await
                .is_ok()
        );
    }
}
