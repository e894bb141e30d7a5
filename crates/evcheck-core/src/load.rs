use std::sync::mpsc;
use std::sync::Arc;

use crate::error::HarnessResult;
use crate::metrics::AttackResult;
use crate::shutdown::ShutdownListener;

/// A fully built HTTP request handed to the load generator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Target {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Produces one target per scheduled request. Implementations may emit
/// side-channel records as a side effect.
pub trait Targeter: Send + Sync {
    fn next_target(&self) -> HarnessResult<Target>;
}

pub trait LoadGenerator {
    /// Start firing requests built by `targeter`. Results stream on the
    /// returned channel, which closes once the attack has finished or
    /// `shutdown` fired.
    fn attack(
        &self,
        targeter: Arc<dyn Targeter>,
        shutdown: ShutdownListener,
    ) -> HarnessResult<mpsc::Receiver<AttackResult>>;
}
