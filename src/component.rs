//! Components and the factory registry.
//!
//! A component is a user-defined simulation entity implementing the
//! [`Component`] trait. Shared bookkeeping (id, name, params, port-to-link
//! bindings) lives in a [`BaseComponentData`] embedded in each concrete
//! type; the trait exposes it through `base()`/`base_mut()`.
//!
//! Factories are registered by type name in a [`ComponentRegistry`]
//! together with the component's port declarations; wire-up refuses a
//! graph that references an unregistered type or an undeclared port. The
//! registry is populated before the simulation threads start and is
//! read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;
use crate::params::Params;
use crate::sim::SimContext;
use crate::types::{ComponentId, LinkId};

/// Error surfaced by a component handler. The scheduler treats any
/// handler error as fatal for the rank.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ComponentError(pub String);

impl ComponentError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Declares one port of a component type: its name and the event-type
/// name it accepts. Wire-up checks that both endpoints of a link declare
/// the same event type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDecl {
    pub name: String,
    pub event_type: String,
}

impl PortDecl {
    pub fn new(name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
        }
    }
}

/// Shared state embedded in every concrete component.
#[derive(Clone, Debug, Default)]
pub struct BaseComponentData {
    pub id: ComponentId,
    pub name: String,
    pub type_name: String,
    pub params: Params,
    /// Port name to this component's own link endpoint id, filled by
    /// wire-up for every connected port.
    pub links: HashMap<String, LinkId>,
}

impl BaseComponentData {
    /// Link endpoint bound to a port, if the port was wired.
    pub fn link(&self, port: &str) -> Option<LinkId> {
        self.links.get(port).copied()
    }
}

/// The capability set of a simulation component.
///
/// Lifecycle calls arrive in the fixed order `init* -> setup ->
/// handle_event*/on_clock* -> complete* -> finish`. All calls run on the
/// partition's scheduler thread; none may block.
pub trait Component: Send {
    fn base(&self) -> &BaseComponentData;
    fn base_mut(&mut self) -> &mut BaseComponentData;

    /// One init phase. Called repeatedly with increasing `phase` until no
    /// component anywhere reports work done and no init events are in
    /// flight. Events sent here traverse links without consuming
    /// simulated time. Return `true` if this call did work.
    fn init(&mut self, _phase: u32, _ctx: &mut SimContext<'_>) -> bool {
        false
    }

    /// One-shot setup after init quiescence, before time starts moving.
    fn setup(&mut self, _ctx: &mut SimContext<'_>) {}

    /// Deliver an event that arrived on `port`. The component owns the
    /// event and may re-send its payload or drop it.
    fn handle_event(
        &mut self,
        port: &str,
        event: Event,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), ComponentError>;

    /// Clock tick callback for a clock this component registered.
    /// Return `false` to stay registered, `true` to unregister.
    fn on_clock(&mut self, _cycle: u64, _ctx: &mut SimContext<'_>) -> bool {
        true
    }

    /// Symmetric to `init`, iterated after the run loop ends.
    fn complete(&mut self, _phase: u32, _ctx: &mut SimContext<'_>) -> bool {
        false
    }

    /// Final call before teardown; statistics flush after this.
    fn finish(&mut self, _ctx: &mut SimContext<'_>) {}

    /// Component state for checkpointing. The default checkpoint carries
    /// no state; stateful components override both snapshot and restore.
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Rebuild state from a checkpoint produced by `snapshot`.
    fn restore(&mut self, _state: serde_json::Value) {}
}

/// Factory signature: build a component from its wired base data.
pub type ComponentFactory = Arc<dyn Fn(BaseComponentData) -> Box<dyn Component> + Send + Sync>;

struct RegistryEntry {
    factory: ComponentFactory,
    ports: Vec<PortDecl>,
}

/// Component factory registry, keyed by type name.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: HashMap<String, Arc<RegistryEntry>>,
}

impl Clone for ComponentRegistry {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component type with its port declarations.
    pub fn register<F>(&mut self, type_name: impl Into<String>, ports: Vec<PortDecl>, factory: F)
    where
        F: Fn(BaseComponentData) -> Box<dyn Component> + Send + Sync + 'static,
    {
        self.entries.insert(
            type_name.into(),
            Arc::new(RegistryEntry {
                factory: Arc::new(factory),
                ports,
            }),
        );
    }

    /// Instantiates a component of the given type.
    pub fn create(&self, type_name: &str, base: BaseComponentData) -> Option<Box<dyn Component>> {
        self.entries.get(type_name).map(|e| (e.factory)(base))
    }

    /// Port declaration of a type, or `None` if type or port is unknown.
    pub fn port(&self, type_name: &str, port: &str) -> Option<&PortDecl> {
        self.entries
            .get(type_name)?
            .ports
            .iter()
            .find(|p| p.name == port)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("registered_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        base: BaseComponentData,
        events_seen: u64,
    }

    impl Component for Probe {
        fn base(&self) -> &BaseComponentData {
            &self.base
        }
        fn base_mut(&mut self) -> &mut BaseComponentData {
            &mut self.base
        }
        fn handle_event(
            &mut self,
            _port: &str,
            _event: Event,
            _ctx: &mut SimContext<'_>,
        ) -> Result<(), ComponentError> {
            self.events_seen += 1;
            Ok(())
        }
    }

    fn probe_registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register(
            "Probe",
            vec![PortDecl::new("in", "Packet"), PortDecl::new("out", "Packet")],
            |base| {
                Box::new(Probe {
                    base,
                    events_seen: 0,
                })
            },
        );
        reg
    }

    #[test]
    fn test_register_and_create() {
        let reg = probe_registry();
        assert!(reg.contains("Probe"));
        assert!(!reg.contains("Ghost"));

        let base = BaseComponentData {
            id: 3,
            name: "probe0".to_string(),
            type_name: "Probe".to_string(),
            ..Default::default()
        };
        let comp = reg.create("Probe", base).unwrap();
        assert_eq!(comp.base().id, 3);
        assert_eq!(comp.base().name, "probe0");

        assert!(reg.create("Ghost", BaseComponentData::default()).is_none());
    }

    #[test]
    fn test_port_declarations() {
        let reg = probe_registry();
        let port = reg.port("Probe", "in").unwrap();
        assert_eq!(port.event_type, "Packet");
        assert!(reg.port("Probe", "sideband").is_none());
        assert!(reg.port("Ghost", "in").is_none());
    }

    #[test]
    fn test_base_link_lookup() {
        let mut base = BaseComponentData::default();
        base.links.insert("out".to_string(), 42);
        assert_eq!(base.link("out"), Some(42));
        assert_eq!(base.link("in"), None);
    }

    #[test]
    fn test_registry_clone_shares_factories() {
        let reg = probe_registry();
        let cloned = reg.clone();
        assert_eq!(cloned.len(), 1);
        assert!(cloned.contains("Probe"));
    }
}
