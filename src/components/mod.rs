//! Built-in components.
//!
//! Small, predictable components used by the integration tests, the
//! benchmarks, and as starting points for user component libraries.

pub mod ping;
pub mod traffic;
pub mod worker;

pub use ping::PingPong;
pub use traffic::{Sink, TrafficSource};
pub use worker::Worker;

use crate::component::ComponentRegistry;

/// Registers every built-in component type.
pub fn register_builtins(registry: &mut ComponentRegistry) {
    ping::register(registry);
    traffic::register(registry);
    worker::register(registry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let mut reg = ComponentRegistry::new();
        register_builtins(&mut reg);
        assert!(reg.contains("PingPong"));
        assert!(reg.contains("TrafficSource"));
        assert!(reg.contains("Sink"));
        assert!(reg.contains("Worker"));
    }
}
