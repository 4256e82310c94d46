mod core;
mod poller;

pub use self::core::{EventCallback, Reactor};
pub use poller::Interest;
