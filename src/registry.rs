//! Alias-addressed registry of SOAP clients.
//!
//! A single client may be registered without an alias. As soon as more than
//! one client is registered, every client must carry a unique, non-empty
//! alias. The most recently created or switched-to client is active and is
//! used by every operation that does not name a client explicitly.

use crate::client::{ClientFactory, ClientHandle, SoapClient, TransportFactory};
use crate::config::ClientOptions;
use crate::error::{Result, SoapClientError};
use std::collections::HashMap;
use tracing::{debug, info};

/// Registered clients keyed by alias; `None` is the unaliased client.
pub type ClientMap = HashMap<Option<String>, SoapClient>;

/// Registry of clients and the active alias.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: ClientMap,
    active_alias: Option<String>,
}

/// An empty alias counts as no alias.
fn normalize(alias: Option<&str>) -> Option<String> {
    alias.filter(|a| !a.is_empty()).map(str::to_string)
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a client for `descriptor` and register it as active.
    ///
    /// The alias is validated before anything is constructed, so a failing
    /// call leaves the registry unchanged.
    pub fn create_client(
        &mut self,
        descriptor: &str,
        alias: Option<&str>,
        options: &ClientOptions,
        transports: &dyn TransportFactory,
        backends: &dyn ClientFactory,
    ) -> Result<ClientHandle> {
        self.check_alias(alias)?;
        let client = SoapClient::connect(descriptor, options, transports, backends)?;
        self.add_client(client, alias)
    }

    /// Register an already constructed client as active.
    pub fn add_client(&mut self, client: SoapClient, alias: Option<&str>) -> Result<ClientHandle> {
        self.check_alias(alias)?;

        let alias = normalize(alias);
        let handle = client.handle();
        info!(
            alias = ?alias,
            client = %handle,
            descriptor = %client.descriptor(),
            "Registered client"
        );

        self.clients.insert(alias.clone(), client);
        self.active_alias = alias;
        Ok(handle)
    }

    fn check_alias(&self, alias: Option<&str>) -> Result<()> {
        match normalize(alias) {
            None if !self.clients.is_empty() => Err(SoapClientError::AliasRequired),
            Some(_) if self.clients.contains_key(&None) => Err(SoapClientError::AliasRequired),
            Some(alias) if self.clients.contains_key(&Some(alias.clone())) => {
                Err(SoapClientError::AliasAlreadyInUse(alias))
            }
            _ => Ok(()),
        }
    }

    /// Remove the client under `alias`, defaulting to the active client.
    ///
    /// Unknown aliases are ignored. Closing the active client clears the
    /// active alias.
    pub fn close_client(&mut self, alias: Option<&str>) -> Option<SoapClient> {
        let key = match normalize(alias) {
            Some(alias) => Some(alias),
            None => self.active_alias.clone(),
        };

        let removed = self.clients.remove(&key);
        match &removed {
            Some(client) => {
                info!(alias = ?key, client = %client.handle(), "Closed client");
                if self.active_alias == key {
                    self.active_alias = None;
                }
            }
            None => debug!(alias = ?key, "No client to close"),
        }
        removed
    }

    /// Close every client.
    pub fn close_all_clients(&mut self) {
        let aliases: Vec<Option<String>> = self.clients.keys().cloned().collect();
        for alias in aliases {
            match alias {
                Some(alias) => self.close_client(Some(&alias)),
                None => self.clients.remove(&None),
            };
        }
        self.active_alias = None;
    }

    /// Make `alias` active and return the previously active alias.
    pub fn switch_client(&mut self, alias: &str) -> Result<Option<String>> {
        let key = Some(alias.to_string());
        if !self.clients.contains_key(&key) {
            return Err(SoapClientError::ClientNotFound(alias.to_string()));
        }

        let previous = std::mem::replace(&mut self.active_alias, key);
        debug!(from = ?previous, to = %alias, "Switched client");
        Ok(previous)
    }

    /// Alias of `client`, or the active alias when no client is given.
    pub fn get_alias(&self, client: Option<ClientHandle>) -> Result<Option<String>> {
        let Some(handle) = client else {
            return Ok(self.active_alias.clone());
        };

        self.clients
            .iter()
            .find(|(_, c)| c.handle() == handle)
            .map(|(alias, _)| alias.clone())
            .ok_or(SoapClientError::AliasNotFound)
    }

    /// Client under `alias`, defaulting to the active client.
    pub fn get_client(&self, alias: Option<&str>) -> Result<&SoapClient> {
        let key = self.resolve(alias);
        self.clients
            .get(&key)
            .ok_or_else(|| SoapClientError::client_not_found(key.as_deref()))
    }

    /// Mutable client under `alias`, defaulting to the active client.
    pub fn get_client_mut(&mut self, alias: Option<&str>) -> Result<&mut SoapClient> {
        let key = self.resolve(alias);
        self.clients
            .get_mut(&key)
            .ok_or_else(|| SoapClientError::client_not_found(key.as_deref()))
    }

    fn resolve(&self, alias: Option<&str>) -> Option<String> {
        normalize(alias).or_else(|| self.active_alias.clone())
    }

    /// All registered clients.
    pub fn get_clients(&self) -> &ClientMap {
        &self.clients
    }

    pub fn active_alias(&self) -> Option<&str> {
        self.active_alias.as_deref()
    }

    pub fn active_client(&self) -> Result<&SoapClient> {
        self.get_client(None)
    }

    pub fn active_client_mut(&mut self) -> Result<&mut SoapClient> {
        self.get_client_mut(None)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registered aliases in sorted order.
    pub fn aliases(&self) -> Vec<Option<&str>> {
        let mut aliases: Vec<Option<&str>> = self.clients.keys().map(|a| a.as_deref()).collect();
        aliases.sort();
        aliases
    }
}
