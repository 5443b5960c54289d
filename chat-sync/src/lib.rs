pub mod cache;
pub mod engine;
pub mod view;
pub mod watermark;

pub use cache::MessageCache;
pub use engine::ConversationSyncEngine;
pub use view::ConversationView;
pub use watermark::Watermarks;
