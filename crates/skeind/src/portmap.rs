//! Shared port-mapping service.
//!
//! One instance per process, shared across folders. Registrations are
//! keyed by a string id and reference-counted, so two folders asking for
//! the same mapping don't fight over it. Without a NAT backend the
//! external port equals the internal one; a PCP/NAT-PMP integration would
//! hook in here.

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProto {
    Tcp,
    Udp,
}

#[derive(Debug)]
struct Mapping {
    port: u16,
    proto: PortProto,
    description: String,
    refcount: usize,
}

#[derive(Clone, Default)]
pub struct PortMapper {
    entries: Arc<DashMap<String, Mapping>>,
}

impl PortMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, id: &str, port: u16, proto: PortProto, description: &str) {
        let mut entry = self.entries.entry(id.to_string()).or_insert(Mapping {
            port,
            proto,
            description: description.to_string(),
            refcount: 0,
        });
        entry.refcount += 1;
        tracing::debug!(id, port, ?proto, refs = entry.refcount, "port mapping registered");
    }

    pub fn remove_port(&self, id: &str) {
        let remove = match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if remove {
            self.entries.remove(id);
            tracing::debug!(id, "port mapping released");
        }
    }

    /// The externally reachable port for a mapping, if registered.
    pub fn mapped_port(&self, id: &str) -> Option<u16> {
        self.entries.get(id).map(|entry| entry.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_roundtrip() {
        let mapper = PortMapper::new();
        assert_eq!(mapper.mapped_port("main"), None);
        mapper.add_port("main", 42345, PortProto::Tcp, "p2p listener");
        assert_eq!(mapper.mapped_port("main"), Some(42345));
        mapper.remove_port("main");
        assert_eq!(mapper.mapped_port("main"), None);
    }

    #[test]
    fn refcounting_keeps_shared_mappings_alive() {
        let mapper = PortMapper::new();
        mapper.add_port("shared", 9000, PortProto::Udp, "folder a");
        mapper.add_port("shared", 9000, PortProto::Udp, "folder b");
        mapper.remove_port("shared");
        assert_eq!(mapper.mapped_port("shared"), Some(9000));
        mapper.remove_port("shared");
        assert_eq!(mapper.mapped_port("shared"), None);
    }

    #[test]
    fn removing_unknown_id_is_harmless() {
        PortMapper::new().remove_port("ghost");
    }
}
