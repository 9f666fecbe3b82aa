pub mod bus;
pub mod models;
mod store;

pub use bus::{MAX_SUBSCRIBERS, NotifyBus, Subscription};
pub use store::{StoreError, TaskStore};
