//! Per-view proxy credentials and their routing contexts.

use crate::error::{Error, Result};
use crate::proxy_event;
use crate::routes::Route;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Credentials handed back to the hosting shell for one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// Ephemeral per-view session: minted credentials plus the resolved route.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub username: String,
    pub password: String,
    pub route: Route,
    pub view_id: String,
    pub persist_key: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    by_username: HashMap<String, Arc<ProxyContext>>,
    by_view: HashMap<String, String>,
}

/// Tracks active view contexts, indexed by username and by view id.
///
/// Both indices live under one lock so they can never disagree; the lock
/// is only held for map operations, never across await points.
#[derive(Default)]
pub struct ProxyAuthRegistry {
    inner: Mutex<RegistryInner>,
}

impl ProxyAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint credentials for a view and store its context. A view may hold
    /// at most one context; callers must release before reconfiguring.
    pub fn configure(
        &self,
        view_id: &str,
        route: Route,
        persist_key: Option<String>,
    ) -> Result<ProxyCredentials> {
        let username = format!("view-{}-{}", view_id, random_token(8).to_lowercase());
        let password = random_token(24);

        let context = Arc::new(ProxyContext {
            username: username.clone(),
            password: password.clone(),
            route,
            view_id: view_id.to_string(),
            persist_key,
        });

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.by_view.contains_key(view_id) {
            return Err(Error::ViewAlreadyConfigured(view_id.to_string()));
        }
        inner.by_username.insert(username.clone(), context);
        inner.by_view.insert(view_id.to_string(), username.clone());
        drop(inner);

        proxy_event!(
            "register-context",
            Some(view_id),
            "registered proxy context for view {}",
            view_id
        );

        Ok(ProxyCredentials { username, password })
    }

    /// Look up a context by the username presented in Proxy-Authorization.
    /// Returns None unless the password matches exactly.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<Arc<ProxyContext>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let context = inner.by_username.get(username)?;
        if context.password != password {
            return None;
        }
        Some(context.clone())
    }

    /// Current credentials for a view, if one is configured.
    pub fn credentials_for(&self, view_id: &str) -> Option<ProxyCredentials> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let username = inner.by_view.get(view_id)?;
        let context = inner.by_username.get(username)?;
        Some(ProxyCredentials {
            username: context.username.clone(),
            password: context.password.clone(),
        })
    }

    /// Remove a view's context from both indices. Idempotent; returns
    /// whether a context was actually removed.
    pub fn release(&self, view_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            match inner.by_view.remove(view_id) {
                Some(username) => inner.by_username.remove(&username).is_some(),
                None => false,
            }
        };
        if removed {
            proxy_event!(
                "release-context",
                Some(view_id),
                "released proxy context for view {}",
                view_id
            );
        }
        removed
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
