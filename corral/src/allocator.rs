//! Name and host-port uniqueness across every registered instance.
//!
//! The index is rebuilt from the registry with [`Allocator::scan`]; the
//! controller re-scans right before each commit because another invocation
//! may have written records in between. Nothing here locks.

use crate::error::CorralError;
use crate::instance::{validate_name, validate_port, InstanceSpec};
use crate::registry::Registry;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct Allocator {
    names: BTreeMap<String, Vec<u16>>,
    ports: BTreeMap<u16, String>,
}

impl Allocator {
    pub fn scan(registry: &Registry) -> Result<Self, CorralError> {
        let specs = registry.load_all()?;
        Ok(Self::from_specs(&specs))
    }

    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a InstanceSpec>) -> Self {
        let mut allocator = Self::default();
        for spec in specs {
            allocator.commit(spec);
        }
        allocator
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn owner_of(&self, port: u16) -> Option<&str> {
        self.ports.get(&port).map(String::as_str)
    }

    pub fn reserve_name(&self, candidate: &str) -> Result<(), CorralError> {
        validate_name(candidate)?;
        if self.contains(candidate) {
            return Err(CorralError::Conflict(format!(
                "an instance named '{candidate}' already exists"
            )));
        }
        Ok(())
    }

    /// Checks `candidate` against every other instance's host ports. The
    /// instance named by `excluding` may keep the ports it already owns.
    pub fn reserve_port(&self, candidate: u32, excluding: Option<&str>) -> Result<u16, CorralError> {
        let port = validate_port(candidate)?;
        match self.owner_of(port) {
            Some(owner) if Some(owner) != excluding => Err(CorralError::Conflict(format!(
                "host port {port} is already used by instance '{owner}'"
            ))),
            _ => Ok(port),
        }
    }

    /// Checks the primary port and every forward rule of `spec`, including
    /// rules that repeat a host port within the spec itself.
    pub fn reserve_ports(&self, spec: &InstanceSpec, excluding: Option<&str>) -> Result<(), CorralError> {
        let mut seen = Vec::new();
        for port in spec.host_ports() {
            if seen.contains(&port) {
                return Err(CorralError::Conflict(format!(
                    "host port {port} is listed more than once for instance '{}'",
                    spec.name
                )));
            }
            self.reserve_port(u32::from(port), excluding)?;
            seen.push(port);
        }
        Ok(())
    }

    /// Records `spec` as the owner of its name and ports, replacing whatever
    /// the same name held before.
    pub fn commit(&mut self, spec: &InstanceSpec) {
        self.release(&spec.name);
        let ports = spec.host_ports();
        for port in &ports {
            self.ports.insert(*port, spec.name.clone());
        }
        self.names.insert(spec.name.clone(), ports);
    }

    pub fn release(&mut self, name: &str) {
        if let Some(ports) = self.names.remove(name) {
            for port in ports {
                if self.ports.get(&port).map(String::as_str) == Some(name) {
                    self.ports.remove(&port);
                }
            }
        }
    }
}
