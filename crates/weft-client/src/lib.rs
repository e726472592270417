//! weft-client: backend clients for the weft timeline engine
//!
//! Implements the engine's collaborator traits against an HTTP + SSE agent
//! backend: [`HttpHistoryClient`] for paginated durable history and
//! [`SseTransport`] for sends, aborts, and the live event stream.

pub mod history;
pub mod transport;

pub use history::HttpHistoryClient;
pub use transport::SseTransport;
