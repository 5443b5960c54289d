pub mod backend;
pub mod db;
pub mod file_kv;
pub mod memory;
pub mod postgres;
pub mod redis;
pub mod schema;
pub mod stream;
mod url;

pub use backend::connect;
pub use db::DbPool;
pub use file_kv::FileKeyValueStore;
pub use memory::{InMemoryBackend, InMemoryKeyValueStore};
pub use postgres::PgMessageStore;
pub use redis::RedisPool;
pub use stream::RedisChangeNotifier;
