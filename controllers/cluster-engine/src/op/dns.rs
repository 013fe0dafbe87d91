//! Cluster DNS and node DNS configuration.
//!
//! Both configurations are rendered into ConfigMaps consumed by the DNS
//! workloads shipped as static resources. Drift is an exact string mismatch.

use super::Operator;
use super::k8s::apply_object;
use cluster_spec::names::{
    CLUSTER_DNS_CONFIG_KEY, CLUSTER_DNS_NAME, CLUSTER_DNS_NAMESPACE, NODE_DNS_CONFIG_KEY,
    NODE_DNS_NAME,
};
use cluster_spec::Node;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Port the cluster DNS server listens on inside its pods
pub const CLUSTER_DNS_PORT: u16 = 1053;

/// Upstream resolvers: the ClusterIPs of the DNS Service when one is named
#[must_use]
pub fn upstream_servers(dns_servers: &[String], dns_service: Option<&Service>) -> Vec<String> {
    let Some(spec) = dns_service.and_then(|s| s.spec.as_ref()) else {
        return dns_servers.to_vec();
    };
    if let Some(ips) = spec.cluster_ips.as_ref().filter(|ips| !ips.is_empty()) {
        return ips.clone();
    }
    spec.cluster_ip
        .iter()
        .filter(|ip| !ip.is_empty() && ip.as_str() != "None")
        .cloned()
        .collect()
}

/// Corefile of the cluster DNS server
#[must_use]
pub fn cluster_dns_corefile(domain: &str, upstreams: &[String]) -> String {
    let mut corefile = format!(
        ".:{CLUSTER_DNS_PORT} {{
    errors
    health
    log . {{
        class error
    }}
    kubernetes {domain} in-addr.arpa ip6.arpa {{
        pods verified
        fallthrough in-addr.arpa ip6.arpa
    }}
"
    );
    if !upstreams.is_empty() {
        let _ = writeln!(corefile, "    forward . {}", upstreams.join(" "));
    }
    corefile.push_str(
        "    cache 30
    reload
    loadbalance
}
",
    );
    corefile
}

/// unbound.conf of the per-node DNS cache
#[must_use]
pub fn node_dns_config(domain: &str, cluster_dns_ip: &str, upstreams: &[String]) -> String {
    let mut conf = String::from(
        "server:
  do-daemonize: no
  interface: 0.0.0.0
  interface-automatic: yes
  access-control: 0.0.0.0/0 allow
  chroot: \"\"
  username: \"\"
  directory: \"/etc/unbound\"
  logfile: \"\"
  use-syslog: no
  log-time-ascii: yes
  log-queries: no
  prefetch: yes
  serve-expired: yes
  cache-min-ttl: 30
  do-not-query-localhost: no
  local-zone: \"in-addr.arpa.\" transparent
  domain-insecure: \"in-addr.arpa.\"
",
    );
    let _ = writeln!(conf, "  domain-insecure: \"{domain}.\"");
    for zone in [domain, "in-addr.arpa"] {
        let _ = write!(
            conf,
            "stub-zone:\n  name: \"{zone}.\"\n  stub-addr: {cluster_dns_ip}\n"
        );
    }
    if !upstreams.is_empty() {
        conf.push_str("forward-zone:\n  name: \".\"\n");
        for upstream in upstreams {
            let _ = writeln!(conf, "  forward-addr: {upstream}");
        }
    }
    conf
}

fn config_map(name: &str, key: &str, data: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(CLUSTER_DNS_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(key.to_string(), data)])),
        ..Default::default()
    }
}

/// Value stored under `key`, if any
#[must_use]
pub fn config_map_data<'a>(config_map: &'a ConfigMap, key: &str) -> Option<&'a str> {
    config_map.data.as_ref()?.get(key).map(String::as_str)
}

/// ConfigMap holding the Corefile of the cluster DNS
#[must_use]
pub fn cluster_dns_config_map(domain: &str, upstreams: &[String]) -> ConfigMap {
    config_map(
        CLUSTER_DNS_NAME,
        CLUSTER_DNS_CONFIG_KEY,
        cluster_dns_corefile(domain, upstreams),
    )
}

/// ConfigMap holding the Corefile of the node-local DNS cache
#[must_use]
pub fn node_dns_config_map(domain: &str, cluster_dns_ip: &str, upstreams: &[String]) -> ConfigMap {
    config_map(
        NODE_DNS_NAME,
        NODE_DNS_CONFIG_KEY,
        node_dns_config(domain, cluster_dns_ip, upstreams),
    )
}

fn configmap_op(kind: &str, exists: bool, api_server: Node, desired: ConfigMap) -> Box<dyn Operator> {
    let verb = if exists { "update" } else { "create" };
    apply_object(&format!("{verb}-{kind}-configmap"), api_server, desired)
}

/// Create or update the cluster DNS ConfigMap
#[must_use]
pub fn cluster_dns_op(api_server: Node, exists: bool, desired: ConfigMap) -> Box<dyn Operator> {
    configmap_op("cluster-dns", exists, api_server, desired)
}

/// Create or update the node DNS ConfigMap
#[must_use]
pub fn node_dns_op(api_server: Node, exists: bool, desired: ConfigMap) -> Box<dyn Operator> {
    configmap_op("node-dns", exists, api_server, desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn servers() -> Vec<String> {
        vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
    }

    #[test]
    fn test_upstreams_prefer_dns_service() {
        assert_eq!(upstream_servers(&servers(), None), servers());

        let service = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.68.0.53".to_string()),
                cluster_ips: Some(vec!["10.68.0.53".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(upstream_servers(&servers(), Some(&service)), vec!["10.68.0.53".to_string()]);
    }

    #[test]
    fn test_corefile_forwards_to_upstreams() {
        let corefile = cluster_dns_corefile("cluster.local", &servers());
        assert!(corefile.contains("kubernetes cluster.local in-addr.arpa ip6.arpa {"));
        assert!(corefile.contains("    forward . 8.8.8.8 1.1.1.1\n"));

        let without = cluster_dns_corefile("cluster.local", &[]);
        assert!(!without.contains("forward"));
    }

    #[test]
    fn test_node_dns_stubs_cluster_domain() {
        let conf = node_dns_config("cluster.local", "10.68.0.10", &servers());
        assert!(conf.contains("stub-zone:\n  name: \"cluster.local.\"\n  stub-addr: 10.68.0.10\n"));
        assert!(conf.contains("forward-addr: 1.1.1.1"));
    }

    #[test]
    fn test_configmap_ops() {
        let desired = cluster_dns_config_map("cluster.local", &servers());
        assert!(config_map_data(&desired, CLUSTER_DNS_CONFIG_KEY).is_some());

        let op = cluster_dns_op(Node::default(), false, desired.clone());
        assert_eq!(op.name(), "create-cluster-dns-configmap");
        let op = node_dns_op(Node::default(), true, desired);
        assert_eq!(op.name(), "update-node-dns-configmap");
    }
}
