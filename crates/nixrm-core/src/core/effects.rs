use std::sync::Arc;

use super::config::Config;
use super::errors::TransferError;
use super::remote::{RemoteShell, SshSession};
use super::store::{NixCli, StoreQuery};

/// External collaborators of a run: the local store tooling and the transport
/// to the target host.
pub trait Effects: Send + Sync {
    fn store(&self) -> &dyn StoreQuery;

    /// Opens the session every remote stage of one invocation shares.
    fn connect(&self, host: &str) -> Result<Box<dyn RemoteShell>, TransferError>;
}

pub struct SystemEffects {
    store: Arc<NixCli>,
}

impl SystemEffects {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            store: Arc::new(NixCli::new(config.nix_program.clone())),
        }
    }
}

impl Effects for SystemEffects {
    fn store(&self) -> &dyn StoreQuery {
        self.store.as_ref()
    }

    fn connect(&self, host: &str) -> Result<Box<dyn RemoteShell>, TransferError> {
        Ok(Box::new(SshSession::connect(host)?))
    }
}
