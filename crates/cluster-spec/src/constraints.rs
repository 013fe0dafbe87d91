//! Cluster-wide constraints stored next to the cluster document

use crate::cluster::Cluster;
use crate::error::{Result, SpecError};
use serde::{Deserialize, Serialize};

/// Limits the cluster document must satisfy before the engine acts on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    /// Exact number of control plane nodes
    #[serde(default = "default_control_plane_count")]
    pub control_plane_count: usize,

    /// Fewest worker nodes
    #[serde(default)]
    pub minimum_workers: usize,

    /// Most worker nodes, unlimited when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_workers: Option<usize>,

    /// Unreachable nodes tolerated before reboots stop starting
    #[serde(default)]
    pub reboot_maximum_unreachable: usize,

    /// Unfinished repair entries acted on at once
    #[serde(default = "default_maximum_repairs")]
    pub maximum_repairs: usize,
}

fn default_control_plane_count() -> usize {
    1
}

fn default_maximum_repairs() -> usize {
    10
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            control_plane_count: default_control_plane_count(),
            minimum_workers: 0,
            maximum_workers: None,
            reboot_maximum_unreachable: 0,
            maximum_repairs: default_maximum_repairs(),
        }
    }
}

impl Constraints {
    /// Check the cluster against the constraints
    pub fn check(&self, cluster: &Cluster) -> Result<()> {
        let cps = cluster.control_plane().count();
        if cps != self.control_plane_count {
            return Err(SpecError::Constraint(format!(
                "number of control planes is {cps}, expected {}",
                self.control_plane_count
            )));
        }

        let workers = cluster.workers().count();
        if workers < self.minimum_workers {
            return Err(SpecError::Constraint(format!(
                "number of workers is {workers}, minimum is {}",
                self.minimum_workers
            )));
        }
        if let Some(max) = self.maximum_workers {
            if workers > max {
                return Err(SpecError::Constraint(format!(
                    "number of workers is {workers}, maximum is {max}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;

    fn cluster(cps: usize, workers: usize) -> Cluster {
        let mut nodes = Vec::new();
        for i in 0..cps + workers {
            nodes.push(Node {
                address: format!("10.0.0.{}", 11 + i),
                control_plane: i < cps,
                ..Default::default()
            });
        }
        Cluster {
            name: "test".to_string(),
            nodes,
            service_subnet: "10.68.0.0/16".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_check_control_plane_count() {
        let constraints = Constraints {
            control_plane_count: 3,
            ..Default::default()
        };
        assert!(constraints.check(&cluster(3, 3)).is_ok());
        assert!(matches!(
            constraints.check(&cluster(4, 2)),
            Err(SpecError::Constraint(_))
        ));
    }

    #[test]
    fn test_check_worker_bounds() {
        let constraints = Constraints {
            control_plane_count: 1,
            minimum_workers: 2,
            maximum_workers: Some(3),
            ..Default::default()
        };
        assert!(constraints.check(&cluster(1, 1)).is_err());
        assert!(constraints.check(&cluster(1, 2)).is_ok());
        assert!(constraints.check(&cluster(1, 4)).is_err());
    }
}
