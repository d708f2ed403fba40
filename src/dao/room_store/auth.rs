use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::dao::{models::AuthUser, room_store::AuthProvider, storage::StorageResult};

/// Auth session held on the device, backed by a watch channel. Used by backends
/// whose sign-in happens outside this crate.
pub struct LocalAuth {
    user: watch::Sender<Option<AuthUser>>,
}

impl LocalAuth {
    /// Start signed in as `user`, or signed out when `None`.
    pub fn new(user: Option<AuthUser>) -> Self {
        let (user, _rx) = watch::channel(user);
        Self { user }
    }

    /// Sign a user in, notifying watchers.
    pub fn sign_in(&self, user: AuthUser) {
        self.user.send_replace(Some(user));
    }
}

impl AuthProvider for LocalAuth {
    fn current_user(&self) -> BoxFuture<'static, StorageResult<Option<AuthUser>>> {
        let user = self.user.borrow().clone();
        Box::pin(async move { Ok(user) })
    }

    fn sign_out(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.user.send_replace(None);
        Box::pin(async move { Ok(()) })
    }

    fn watch(&self) -> watch::Receiver<Option<AuthUser>> {
        self.user.subscribe()
    }
}
