pub mod extract;
pub mod orchestrator;
pub mod proxy;
pub mod session_registry;
pub mod tcp;
pub mod tracker;
pub mod types;
pub mod zone;
