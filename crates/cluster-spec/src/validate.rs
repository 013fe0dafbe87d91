//! Cluster document validation

use crate::cluster::Cluster;
use crate::error::{Result, SpecError};
use crate::names::DOMAIN_PREFIX;
use std::collections::HashSet;
use std::net::IpAddr;

/// Validate a cluster document before the engine acts on it
pub fn validate(cluster: &Cluster) -> Result<()> {
    if cluster.name.is_empty() {
        return Err(invalid("cluster name is empty"));
    }
    if cluster.nodes.is_empty() {
        return Err(invalid("no nodes"));
    }
    if cluster.control_plane().next().is_none() {
        return Err(invalid("no control plane nodes"));
    }

    validate_cidr(&cluster.service_subnet, "serviceSubnet")?;
    if !cluster.pod_subnet.is_empty() {
        validate_cidr(&cluster.pod_subnet, "podSubnet")?;
    }

    for server in &cluster.dns_servers {
        server
            .parse::<IpAddr>()
            .map_err(|_| invalid(&format!("invalid DNS server {server}")))?;
    }
    if let Some(svc) = &cluster.dns_service {
        let parts: Vec<&str> = svc.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(invalid(&format!("dnsService must be namespace/name: {svc}")));
        }
    }

    let mut addresses = HashSet::new();
    let mut names = HashSet::new();
    for node in &cluster.nodes {
        node.address
            .parse::<IpAddr>()
            .map_err(|_| invalid(&format!("invalid node address {}", node.address)))?;
        if !addresses.insert(node.address.as_str()) {
            return Err(invalid(&format!("duplicate node address {}", node.address)));
        }
        if !names.insert(node.nodename()) {
            return Err(invalid(&format!("duplicate node name {}", node.nodename())));
        }
        for key in node.labels.keys().chain(node.annotations.keys()) {
            if key.starts_with(DOMAIN_PREFIX) {
                return Err(invalid(&format!(
                    "node {} uses reserved key {key}",
                    node.address
                )));
            }
        }
        for taint in &node.taints {
            if taint.key.starts_with(DOMAIN_PREFIX) {
                return Err(invalid(&format!(
                    "node {} uses reserved taint {}",
                    node.address, taint.key
                )));
            }
        }
    }

    validate_reboot(cluster)?;
    validate_repair(cluster)?;

    let kubelet = &cluster.options.kubelet;
    if kubelet.domain.is_empty() {
        return Err(invalid("kubelet domain is empty"));
    }
    if kubelet.container_log_max_files < 2 {
        return Err(invalid("kubelet containerLogMaxFiles must be at least 2"));
    }
    if cluster.options.etcd.volume_name.is_empty() {
        return Err(invalid("etcd volumeName is empty"));
    }

    Ok(())
}

fn validate_reboot(cluster: &Cluster) -> Result<()> {
    let reboot = &cluster.reboot;
    if !reboot.reboot_command.is_empty() && reboot.boot_check_command.is_empty() {
        return Err(invalid("reboot bootCheckCommand is required with rebootCommand"));
    }
    if reboot.eviction_timeout_seconds == Some(0) {
        return Err(invalid("reboot evictionTimeoutSeconds must be positive"));
    }
    if reboot.command_timeout_seconds == Some(0) {
        return Err(invalid("reboot commandTimeoutSeconds must be positive"));
    }
    if reboot.max_concurrent_reboots == Some(0) {
        return Err(invalid("reboot maxConcurrentReboots must be positive"));
    }
    Ok(())
}

fn validate_repair(cluster: &Cluster) -> Result<()> {
    let repair = &cluster.repair;
    if repair.max_concurrent_repairs == Some(0) {
        return Err(invalid("repair maxConcurrentRepairs must be positive"));
    }
    if repair.eviction_timeout_seconds == Some(0) {
        return Err(invalid("repair evictionTimeoutSeconds must be positive"));
    }

    let mut machine_types = HashSet::new();
    for procedure in &repair.repair_procedures {
        if procedure.machine_types.is_empty() {
            return Err(invalid("repair procedure without machine types"));
        }
        for machine_type in &procedure.machine_types {
            if !machine_types.insert(machine_type.as_str()) {
                return Err(invalid(&format!("duplicate repair machine type {machine_type}")));
            }
        }

        let mut operations = HashSet::new();
        for operation in &procedure.repair_operations {
            if !operations.insert(operation.operation.as_str()) {
                return Err(invalid(&format!(
                    "duplicate repair operation {}",
                    operation.operation
                )));
            }
            if operation.repair_steps.is_empty() {
                return Err(invalid(&format!(
                    "repair operation {} has no steps",
                    operation.operation
                )));
            }
            if operation.health_check_command.is_empty() {
                return Err(invalid(&format!(
                    "repair operation {} has no health check command",
                    operation.operation
                )));
            }
            for step in &operation.repair_steps {
                if step.repair_command.is_empty() {
                    return Err(invalid(&format!(
                        "repair operation {} has a step without command",
                        operation.operation
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_cidr(value: &str, field: &str) -> Result<()> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| invalid(&format!("{field} is not a CIDR: {value}")))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| invalid(&format!("{field} has an invalid address: {value}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| invalid(&format!("{field} has an invalid prefix: {value}")))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid(&format!("{field} prefix out of range: {value}")));
    }
    Ok(())
}

fn invalid(msg: &str) -> SpecError {
    SpecError::Invalid(msg.to_string())
}
