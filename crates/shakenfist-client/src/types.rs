//! Request and response bodies for the control-plane API

use serde::{Deserialize, Serialize};

/// Body for `POST /networks`
#[derive(Debug, Clone, Serialize)]
pub struct CreateNetwork {
    pub name: String,
    pub netblock: String,
    pub provide_dhcp: bool,
    pub provide_nat: bool,
    /// Target namespace when acting with a key from another namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A network as returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub netblock: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// One NIC on an instance
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NetworkSpec {
    pub network_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macaddress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl NetworkSpec {
    /// NIC on the given network with server-chosen address and model
    pub fn on(network_uuid: impl Into<String>) -> Self {
        Self {
            network_uuid: network_uuid.into(),
            ..Default::default()
        }
    }
}

/// One disk on an instance
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiskSpec {
    /// Base image label, e.g. `ubuntu` or `debian:11`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Size in GiB
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl DiskSpec {
    /// Root disk cloned from a base image
    pub fn root(base: impl Into<String>, size: u32) -> Self {
        Self {
            base: Some(base.into()),
            size,
            bus: None,
            kind: "disk".to_string(),
        }
    }
}

/// Video card configuration
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VideoSpec {
    pub model: String,
    /// Video memory in KiB
    pub memory: u32,
}

impl Default for VideoSpec {
    fn default() -> Self {
        Self {
            model: "cirrus".to_string(),
            memory: 16384,
        }
    }
}

/// Body for `POST /instances`
#[derive(Debug, Clone, Serialize)]
pub struct CreateInstance {
    pub name: String,
    pub cpus: u32,
    /// Memory in MiB
    pub memory: u32,
    pub network: Vec<NetworkSpec>,
    pub disk: Vec<DiskSpec>,
    pub video: VideoSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    /// Base64 encoded cloud-init user data
    pub user_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// An instance as returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Hypervisor the instance was placed on (absent until scheduled)
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub console_port: Option<u16>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthRequest<'a> {
    pub namespace: &'a str,
    pub key: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateNamespaceRequest<'a> {
    pub namespace: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateKeyRequest<'a> {
    pub key_name: &'a str,
    pub key: &'a str,
}

/// Body for the bulk delete endpoints
#[derive(Debug, Serialize)]
pub(crate) struct DeleteAllRequest<'a> {
    pub confirm: bool,
    pub namespace: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_instance_serializes_api_field_names() {
        let req = CreateInstance {
            name: "CallHome-0".to_string(),
            cpus: 1,
            memory: 1024,
            network: vec![NetworkSpec::on("net-1")],
            disk: vec![DiskSpec::root("ubuntu", 8)],
            video: VideoSpec::default(),
            ssh_key: None,
            user_data: "I2Nsb3VkLWNvbmZpZw==".to_string(),
            namespace: None,
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["network"][0]["network_uuid"], "net-1");
        assert!(json["network"][0].get("macaddress").is_none());
        assert_eq!(json["disk"][0]["type"], "disk");
        assert_eq!(json["disk"][0]["base"], "ubuntu");
        assert_eq!(json["video"]["model"], "cirrus");
        assert_eq!(json["video"]["memory"], 16384);
        assert!(json.get("ssh_key").is_none());
        assert!(json.get("namespace").is_none());
    }

    #[test]
    fn test_instance_tolerates_unscheduled_fields() {
        let inst: Instance = serde_json::from_str(
            r#"{"uuid": "d51aa352", "node": null, "console_port": null, "state": "preflight", "cpus": 1}"#,
        )
        .unwrap();
        assert_eq!(inst.uuid, "d51aa352");
        assert!(inst.node.is_none());
        assert!(inst.console_port.is_none());
    }
}
