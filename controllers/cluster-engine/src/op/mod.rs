//! Operators and commanders.
//!
//! An [`Operator`] is a named sequence of [`Commander`]s. The strategy
//! returns operators; the controller pulls commanders one at a time, records
//! each one's [`Command`] and runs it.

pub mod certs;
pub mod common;
pub mod dns;
pub mod etcd;
pub mod k8s;
pub mod params;
pub mod reboot;
pub mod repair;
pub mod services;

use crate::error::EngineError;
use crate::infrastructure::Infrastructure;
use async_trait::async_trait;
use cluster_spec::Command;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// A named, stateful sequence of side effects
pub trait Operator: Send {
    /// Name recorded with the operation
    fn name(&self) -> String;

    /// Addresses or keys the operator acts on
    fn targets(&self) -> Vec<String>;

    /// Next step, or `None` once the operator is done
    fn next_command(&mut self) -> Option<Box<dyn Commander>>;
}

/// One unit of side effect
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait Commander: Send + Sync {
    /// Audit entry describing the step
    fn command(&self) -> Command;

    /// Perform the step; writes to storage are guarded by `leader_key`
    async fn run(
        &self,
        ctx: &CancellationToken,
        inf: &Infrastructure,
        leader_key: &str,
    ) -> Result<(), EngineError>;
}

/// Operator running a fixed list of commanders in order
pub struct Sequence {
    name: String,
    targets: Vec<String>,
    commanders: VecDeque<Box<dyn Commander>>,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field("targets", &self.targets)
            .field("remaining", &self.commanders.len())
            .finish()
    }
}

impl Sequence {
    /// Empty sequence recorded under `name`
    #[must_use]
    pub fn new(name: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            targets,
            commanders: VecDeque::new(),
        }
    }

    /// Append a commander
    #[must_use]
    pub fn then(mut self, commander: impl Commander + 'static) -> Self {
        self.commanders.push_back(Box::new(commander));
        self
    }

    /// Box the sequence as an operator
    #[must_use]
    pub fn boxed(self) -> Box<dyn Operator> {
        Box::new(self)
    }
}

impl Operator for Sequence {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn targets(&self) -> Vec<String> {
        self.targets.clone()
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        self.commanders.pop_front()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Drain an operator and return the names of its commands
    pub(crate) fn command_names(op: &mut dyn Operator) -> Vec<String> {
        std::iter::from_fn(|| op.next_command())
            .map(|c| c.command().name)
            .collect()
    }

    struct Noop(&'static str);

    #[async_trait]
    impl Commander for Noop {
        fn command(&self) -> Command {
            Command::new(self.0, "")
        }

        async fn run(
            &self,
            _ctx: &CancellationToken,
            _inf: &Infrastructure,
            _leader_key: &str,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn test_sequence_yields_commanders_in_order() {
        let mut op = Sequence::new("test", vec!["10.0.0.11".to_string()])
            .then(Noop("first"))
            .then(Noop("second"));
        assert_eq!(op.name(), "test");
        assert_eq!(op.targets(), vec!["10.0.0.11".to_string()]);
        assert_eq!(command_names(&mut op), vec!["first", "second"]);
        assert!(op.next_command().is_none());
    }
}
