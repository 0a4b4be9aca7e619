//! Tracks which component is bound to each port

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::bail;
use common::{error::SdkError, ports::Port};
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct PortRegistry {
    bound: Arc<Mutex<HashMap<Port, String>>>,
}

/// Keeps a port bound until dropped
#[derive(Debug)]
pub struct PortClaim {
    port: Port,
    owner: String,
    registry: PortRegistry,
}

impl PortRegistry {
    pub fn claim(&self, label: &str, owner: &str) -> anyhow::Result<PortClaim> {
        let port = Port::parse(label)?;
        self.claim_port(port, owner)
    }

    pub fn claim_port(&self, port: Port, owner: &str) -> anyhow::Result<PortClaim> {
        let mut bound = self.lock();
        if let Some(current) = bound.get(&port) {
            bail!(SdkError::validation(format!(
                "Port {port} is already in use by {current}"
            )));
        }

        bound.insert(port, owner.to_owned());
        debug!("Port {port} bound to {owner}");

        Ok(PortClaim {
            port,
            owner: owner.to_owned(),
            registry: self.clone(),
        })
    }

    pub fn owner(&self, port: Port) -> Option<String> {
        self.lock().get(&port).cloned()
    }

    pub fn is_bound(&self, port: Port) -> bool {
        self.lock().contains_key(&port)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Port, String>> {
        self.bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PortClaim {
    pub fn port(&self) -> Port {
        self.port
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.port);
        debug!("Port {} released by {}", self.port, self.owner);
    }
}
