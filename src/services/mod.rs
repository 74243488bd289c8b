pub mod content_store;
pub mod dispatcher;
pub mod hasher;
pub mod media_store;
pub mod pipeline;
pub mod thumbnailer;
pub mod tokens;
pub mod upkeep;
