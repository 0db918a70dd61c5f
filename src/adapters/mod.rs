//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Ports (domain::ports)                    │
//! │      Transport     │     Storage     │  EventPublisher    │
//! └──────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Adapters (this module)                  │
//! │ ReqwestTransport │ EchoTransport │ ScriptedTransport      │
//! │ MemoryStorage │ LoggingEventPublisher │ InMemoryCollector │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod echo;
mod event_publisher;
mod http;
pub mod memory_storage;

pub use echo::{EchoTransport, Scripted, ScriptedTransport};
pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use http::{HttpTransportConfig, ReqwestTransport};
pub use memory_storage::MemoryStorage;
