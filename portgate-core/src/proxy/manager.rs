//! Set of forwarding listeners sharing one policy engine

use super::listener::{ConnectionLimits, ListenerConfig, ProxyListener};
use crate::error::{FirewallError, Result};
use crate::events::EventLog;
use crate::filter::PolicyEngine;
use std::net::SocketAddr;
use std::sync::Arc;

/// Summary of one running listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub local_addr: SocketAddr,
    pub target_host: String,
    pub target_port: u16,
}

pub struct ProxyManager {
    engine: Arc<PolicyEngine>,
    events: Arc<EventLog>,
    limits: ConnectionLimits,
    listeners: Vec<ProxyListener>,
}

impl ProxyManager {
    /// `limits` apply to listeners started through [`ProxyManager::start`]
    pub fn new(engine: Arc<PolicyEngine>, events: Arc<EventLog>, limits: ConnectionLimits) -> Self {
        Self {
            engine,
            events,
            limits,
            listeners: Vec::new(),
        }
    }

    pub async fn start(
        &mut self,
        listen_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<SocketAddr> {
        let config = ListenerConfig::new(listen_port, target_host, target_port)
            .with_limits(self.limits.clone());
        self.start_with(config).await
    }

    pub async fn start_with(&mut self, config: ListenerConfig) -> Result<SocketAddr> {
        if config.listen_port != 0 && self.find(config.listen_port).is_some() {
            return Err(FirewallError::AlreadyListening {
                port: config.listen_port,
            });
        }

        let mut listener = ProxyListener::new(self.engine.clone(), self.events.clone());
        let addr = listener.start(config).await?;
        self.listeners.push(listener);
        Ok(addr)
    }

    fn find(&self, listen_port: u16) -> Option<usize> {
        self.listeners
            .iter()
            .position(|l| l.local_addr().map(|a| a.port()) == Some(listen_port))
    }

    /// Stop the listener bound to `listen_port`. Returns false if there is none.
    pub async fn stop(&mut self, listen_port: u16) -> bool {
        match self.find(listen_port) {
            Some(index) => {
                let mut listener = self.listeners.remove(index);
                listener.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&mut self) {
        for mut listener in std::mem::take(&mut self.listeners) {
            listener.stop().await;
        }
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.listeners
            .iter()
            .filter_map(|l| {
                let config = l.config()?;
                Some(ListenerInfo {
                    local_addr: l.local_addr()?,
                    target_host: config.target_host.clone(),
                    target_port: config.target_port,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
