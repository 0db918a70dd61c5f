//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - traits the engine depends on (transport, storage, events)
//! - **Events** (`events.rs`) - engine events for audit and decoupling

pub mod events;
pub mod ports;

pub use events::EngineEvent;
pub use ports::{
    EventPublisher, HttpMethod, RequestSpec, Storage, Transport, TransportResponse,
};
