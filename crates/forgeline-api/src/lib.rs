//! API server: HTTP REST surface, git smart-HTTP hosting, and the
//! worker duplex-channel endpoint for a forgeline backend.

pub mod completion;
pub mod error;
pub mod remote_dispatch;
pub mod routes;
pub mod serve;
pub mod state;
pub mod ws;

pub use state::AppState;
