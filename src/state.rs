use crate::services::{dispatcher::Dispatcher, media_store::MediaStore, tokens::TokenIssuer};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub store: MediaStore,
    pub tokens: TokenIssuer,
}
