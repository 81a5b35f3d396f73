//! Network identity correlation and the network-controller port API.
//!
//! The deployment needs to know which virtual port belongs to the machine
//! being provisioned. Correlation matches the MAC addresses physically
//! present on the node against the MAC of each port attached to the task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::ApiError;
use crate::task::ProvisioningTask;

/// A fixed IP assignment on a virtual port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedIp {
    /// The assigned address.
    pub ip_address: String,
}

/// A network-controller-managed attachment point. Read-only to this driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualPort {
    /// Port identifier.
    pub id: String,
    /// MAC address bound to the port.
    pub mac_address: String,
    /// Network the port belongs to.
    pub network_id: String,
    /// Fixed IPs allocated to the port.
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

/// The authoritative network identity for one deployment.
///
/// Derived, never stored; recomputed on every `prepare` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    /// IP the node will boot and deploy with.
    pub fixed_ip: String,
    /// MAC address the identity was matched on.
    pub mac_address: String,
    /// Network the matched port belongs to.
    pub network_id: String,
    /// The matched port.
    pub port_id: String,
}

/// Find the port whose MAC is present on the node.
///
/// Ports are scanned in the supplied order and the first match wins; when
/// several ports share a MAC this is a deliberate first-match policy, not
/// best-match. MAC comparison ignores case. A matching port without any
/// fixed IP is skipped. Returns `None` when nothing matches.
#[must_use]
pub fn resolve_network_identity(
    ports: &[VirtualPort],
    candidate_macs: &[String],
) -> Option<NetworkIdentity> {
    for port in ports {
        let matched = candidate_macs
            .iter()
            .any(|mac| mac.eq_ignore_ascii_case(&port.mac_address));
        if !matched {
            continue;
        }

        let Some(fixed) = port.fixed_ips.first() else {
            warn!(port_id = %port.id, "matched port has no fixed IP, skipping");
            continue;
        };

        return Some(NetworkIdentity {
            fixed_ip: fixed.ip_address.clone(),
            mac_address: port.mac_address.clone(),
            network_id: port.network_id.clone(),
            port_id: port.id.clone(),
        });
    }

    None
}

/// Source of the virtual ports attached to a provisioning task.
#[async_trait]
pub trait PortLister: Send + Sync {
    /// List the ports attached to the task's node.
    async fn list_ports(&self, task: &ProvisioningTask) -> Result<Vec<VirtualPort>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct PortsResponse {
    ports: Vec<VirtualPort>,
}

/// Network-controller HTTP client.
pub struct HttpPortLister {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpPortLister {
    /// Create a client against the controller's API base URL.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl PortLister for HttpPortLister {
    async fn list_ports(&self, task: &ProvisioningTask) -> Result<Vec<VirtualPort>, ApiError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let url = format!("{base}/v2.0/ports?device_id={}", task.node.uuid);
        debug!(url = %url, "listing ports");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: PortsResponse = serde_json::from_str(&text)?;
        Ok(parsed.ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Node;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn port(id: &str, mac: &str, ip: Option<&str>, network: &str) -> VirtualPort {
        VirtualPort {
            id: id.to_string(),
            mac_address: mac.to_string(),
            network_id: network.to_string(),
            fixed_ips: ip
                .map(|ip| {
                    vec![FixedIp {
                        ip_address: ip.to_string(),
                    }]
                })
                .unwrap_or_default(),
        }
    }

    #[test]
    fn test_first_matching_port_wins() {
        // Node MACs {aa:aa, bb:bb}; port1 does not match, port2 does.
        let ports = vec![
            port("p1", "cc:cc", Some("10.0.0.1"), "net0"),
            port("p2", "bb:bb", Some("10.0.0.5"), "net1"),
        ];
        let macs = vec!["aa:aa".to_string(), "bb:bb".to_string()];

        let identity = resolve_network_identity(&ports, &macs).unwrap();
        assert_eq!(identity.fixed_ip, "10.0.0.5");
        assert_eq!(identity.mac_address, "bb:bb");
        assert_eq!(identity.network_id, "net1");
        assert_eq!(identity.port_id, "p2");
    }

    #[test]
    fn test_no_match_returns_none() {
        let ports = vec![port("p1", "cc:cc", Some("10.0.0.1"), "net0")];
        let macs = vec!["aa:aa".to_string()];
        assert!(resolve_network_identity(&ports, &macs).is_none());
    }

    #[test]
    fn test_first_match_is_deterministic() {
        // Two ports with the same MAC: the earlier one in the supplied
        // order is selected, every time.
        let ports = vec![
            port("p1", "aa:aa", Some("10.0.0.1"), "net0"),
            port("p2", "aa:aa", Some("10.0.0.2"), "net0"),
        ];
        let macs = vec!["aa:aa".to_string()];

        for _ in 0..3 {
            let identity = resolve_network_identity(&ports, &macs).unwrap();
            assert_eq!(identity.port_id, "p1");
        }
    }

    #[test]
    fn test_mac_comparison_ignores_case() {
        let ports = vec![port("p1", "AA:BB:CC:DD:EE:FF", Some("10.0.0.9"), "net0")];
        let macs = vec!["aa:bb:cc:dd:ee:ff".to_string()];
        assert!(resolve_network_identity(&ports, &macs).is_some());
    }

    #[test]
    fn test_matched_port_without_ip_is_skipped() {
        let ports = vec![
            port("p1", "aa:aa", None, "net0"),
            port("p2", "aa:aa", Some("10.0.0.2"), "net0"),
        ];
        let macs = vec!["aa:aa".to_string()];

        let identity = resolve_network_identity(&ports, &macs).unwrap();
        assert_eq!(identity.port_id, "p2");
    }

    #[tokio::test]
    async fn test_http_port_lister() {
        let server = MockServer::start().await;
        let node_uuid = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path("/v2.0/ports"))
            .and(query_param("device_id", node_uuid.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"ports":[{"id":"p2","mac_address":"bb:bb","network_id":"net1","fixed_ips":[{"ip_address":"10.0.0.5"}]}]}"#,
            ))
            .mount(&server)
            .await;

        let lister = HttpPortLister::new(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
        );
        let task = ProvisioningTask::new(Node {
            uuid: node_uuid,
            driver_info: serde_json::Map::new(),
            instance_info: serde_json::Map::new(),
            mac_addresses: vec![],
        });

        let ports = lister.list_ports(&task).await.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].id, "p2");
        assert_eq!(ports[0].fixed_ips[0].ip_address, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_http_port_lister_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let lister = HttpPortLister::new(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
        );
        let task = ProvisioningTask::new(Node {
            uuid: Uuid::new_v4(),
            driver_info: serde_json::Map::new(),
            instance_info: serde_json::Map::new(),
            mac_addresses: vec![],
        });

        let err = lister.list_ports(&task).await.unwrap_err();
        assert!(matches!(err, ApiError::Api { status: 500, .. }));
    }
}
