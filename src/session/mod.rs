mod secret_manager;
mod store;

pub use secret_manager::KeyringSessionStore;
pub use store::{
    MemorySessionStore, Session, SessionStore, StoreError, KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN,
    KEY_USER_ROLE, KEY_USER_ROLES, SESSION_KEYS,
};
