pub mod api_rest;
pub mod app_state;
pub mod audio_filters;
pub mod avatar_slots;
pub mod broadcast_hub;
pub mod chat_adapters;
pub mod config;
pub mod errors;
pub mod message_filter;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod queue_manager;
pub mod rate_limiter;
pub mod voice_registry;

pub use app_state::AppState;
pub use orchestrator::DispatchOrchestrator;
