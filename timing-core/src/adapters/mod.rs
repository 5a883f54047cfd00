pub mod broadcast_hub;
pub mod redis_broker;
pub mod sqlite_store;

pub use broadcast_hub::BroadcastHub;
pub use redis_broker::RedisBroker;
pub use sqlite_store::SqliteStore;
