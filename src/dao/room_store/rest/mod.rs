//! PostgREST-style HTTP backend. It has no push transport, so clients using it run
//! on polling alone.

mod config;
mod error;
mod store;

use std::sync::Arc;

pub use self::config::RestConfig;
pub use self::error::{RestDaoError, RestResult};
pub use self::store::{RestChangeFeed, RestRoomStore};

use crate::dao::room_store::{Backend, LocalAuth};

/// Connect to the REST backend and assemble the bundle a client consumes.
pub async fn connect(config: RestConfig) -> RestResult<(Backend, Arc<LocalAuth>)> {
    let user = config.user.clone();
    let store = RestRoomStore::connect(config).await?;
    let auth = Arc::new(LocalAuth::new(user));
    let backend = Backend::new(Arc::new(store), Arc::new(RestChangeFeed), auth.clone());
    Ok((backend, auth))
}
