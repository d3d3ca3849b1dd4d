pub mod bus;
pub mod event;
#[cfg(test)]
mod tests;

pub use bus::{EventBus, EventCallback, Subscription};
pub use event::{CameraStatusChange, ChangeKind, EventMessage, EventType};
