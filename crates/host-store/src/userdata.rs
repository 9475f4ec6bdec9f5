//! Cloud-init user data
//!
//! Renders the `#cloud-config` document stored in the `<host>-userdata`
//! Secret referenced from `spec.userData`.

use serde::Serialize;

use crate::error::StoreError;

/// Key under which the document is stored in the Secret
pub const USER_DATA_KEY: &str = "userData";

/// Name of the Secret holding user data for `host_name`
pub fn user_data_secret_name(host_name: &str) -> String {
    format!("{}-userdata", host_name)
}

#[derive(Debug, Serialize)]
struct CloudConfig<'a> {
    ssh_pwauth: bool,
    users: Vec<CloudUser<'a>>,
}

#[derive(Debug, Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    lock_passwd: bool,
    shell: &'a str,
    sudo: &'a str,
    ssh_authorized_keys: Vec<&'a str>,
}

/// Renders a cloud-config granting `user` key-only SSH access with `ssh_key`.
///
/// The key must be a single non-empty line; anything else is rejected so a
/// payload cannot smuggle extra YAML into the document.
pub fn render_cloud_config(user: &str, ssh_key: &str) -> Result<String, StoreError> {
    let ssh_key = ssh_key.trim();
    if ssh_key.is_empty() {
        return Err(StoreError::InvalidUserData("SSH public key is empty".to_string()));
    }
    if ssh_key.contains(['\n', '\r']) {
        return Err(StoreError::InvalidUserData(
            "SSH public key must be a single line".to_string(),
        ));
    }
    if user.trim().is_empty() {
        return Err(StoreError::InvalidUserData("user name is empty".to_string()));
    }

    let config = CloudConfig {
        ssh_pwauth: false,
        users: vec![CloudUser {
            name: user,
            lock_passwd: true,
            shell: "/bin/bash",
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            ssh_authorized_keys: vec![ssh_key],
        }],
    };

    Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_cloud_config_contains_key() {
        let doc = render_cloud_config("provision", "ssh-ed25519 AAAAC3Nza user@host")
            .expect("render should succeed");

        assert!(doc.starts_with("#cloud-config\n"));
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(doc.trim_start_matches("#cloud-config\n")).expect("valid YAML");
        assert_eq!(parsed["ssh_pwauth"], serde_yaml::Value::Bool(false));
        assert_eq!(parsed["users"][0]["name"].as_str(), Some("provision"));
        assert_eq!(
            parsed["users"][0]["ssh_authorized_keys"][0].as_str(),
            Some("ssh-ed25519 AAAAC3Nza user@host")
        );
    }

    #[test]
    fn test_render_cloud_config_rejects_multiline_key() {
        let result = render_cloud_config("provision", "ssh-rsa AAAA\nusers: []");
        assert!(matches!(result, Err(StoreError::InvalidUserData(_))));
    }

    #[test]
    fn test_render_cloud_config_rejects_empty_key() {
        assert!(matches!(
            render_cloud_config("provision", "   "),
            Err(StoreError::InvalidUserData(_))
        ));
    }

    #[test]
    fn test_user_data_secret_name() {
        assert_eq!(user_data_secret_name("bmh-node-001"), "bmh-node-001-userdata");
    }
}
