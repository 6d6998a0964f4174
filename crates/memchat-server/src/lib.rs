//! ============================================================================
//! MEMCHAT-SERVER: HTTP surface of the memory-augmented chat backend
//! ============================================================================
//! axum router over `memchat_core::ChatService` and `HistoryStore`, plus the
//! startup wiring shared by the `memchat` binary and the integration tests.
//! ============================================================================

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::{router, CONVERSATION_ID_HEADER, USER_ID_HEADER};
pub use state::{bootstrap, AppState, Services};
