use std::sync::{Arc, RwLock};

// Type alias, not a new type, so the underlying lock methods stay
// available through `HandyRwLock`.
pub type Pod<T> = Arc<RwLock<T>>;

pub fn pod<T>(value: T) -> Pod<T> {
    Arc::new(RwLock::new(value))
}
