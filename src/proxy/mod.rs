pub mod chat;
pub mod continuation;
pub mod handlers;
pub mod history;
pub mod mappers;
pub mod orchestrator;
pub mod router;
pub mod routes;
pub mod server;
pub mod session;
pub mod state;
pub mod toolcalls;
pub mod upstream;

pub use router::ModelRouter;
pub use state::AppState;

#[cfg(test)]
mod tests;
