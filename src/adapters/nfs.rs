//! NFS provisioner
//!
//! Describes each claim as a directory on one NFS export. The directory
//! itself is created by the export's own tooling; this plug-in only names
//! it and builds the volume.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{NFSVolumeSource, PersistentVolume, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::domain::ports::{BlockProvisioner, ProvisionOptions, Provisioner, ProvisioningState};
use crate::domain::volume::{class_reclaim_policy, requested_storage, RESOURCE_STORAGE};
use crate::error::{Error, Result};

/// Provisioner handing out directories of one NFS export.
#[derive(Debug, Clone)]
pub struct NfsProvisioner {
    server: String,
    base_path: String,
}

impl NfsProvisioner {
    pub fn new(server: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            base_path: base_path.into(),
        }
    }

    /// Export path for a claim: `<base>/<namespace>-<claim>-<volume>`
    pub fn export_path(&self, namespace: &str, claim: &str, volume: &str) -> String {
        format!(
            "{}/{}-{}-{}",
            self.base_path.trim_end_matches('/'),
            namespace,
            claim,
            volume
        )
    }
}

#[async_trait]
impl Provisioner for NfsProvisioner {
    async fn provision(&self, options: ProvisionOptions) -> Result<ProvisioningState> {
        let claim = &options.claim;
        let namespace = claim.metadata.namespace.as_deref().unwrap_or("default");
        let name = claim
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::Provisioning("claim has no name".into()))?;
        let size = requested_storage(claim)
            .cloned()
            .ok_or_else(|| Error::Provisioning(format!("claim {}/{} requests no storage", namespace, name)))?;

        let path = self.export_path(namespace, name, &options.volume_name);
        info!(volume = %options.volume_name, server = %self.server, path = %path, "Provisioning NFS volume");

        let volume = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.volume_name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(
                    class_reclaim_policy(&options.storage_class).to_string(),
                ),
                access_modes: claim.spec.as_ref().and_then(|s| s.access_modes.clone()),
                mount_options: options.storage_class.mount_options.clone(),
                capacity: Some(BTreeMap::from([(RESOURCE_STORAGE.to_string(), size)])),
                nfs: Some(NFSVolumeSource {
                    server: self.server.clone(),
                    path,
                    read_only: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        Ok(ProvisioningState::Finished(Box::new(volume)))
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        let server = volume
            .spec
            .as_ref()
            .and_then(|s| s.nfs.as_ref())
            .map(|nfs| nfs.server.as_str());

        if server != Some(self.server.as_str()) {
            return Err(Error::ignored(format!(
                "volume {} is not served by {}",
                name, self.server
            )));
        }

        debug!(volume = %name, "NFS volume released");
        Ok(())
    }

    fn block_provisioner(&self) -> Option<&dyn BlockProvisioner> {
        Some(self)
    }
}

impl BlockProvisioner for NfsProvisioner {
    fn supports_block(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ProvisionerCapabilities;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
    };
    use k8s_openapi::api::storage::v1::StorageClass;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn options() -> ProvisionOptions {
        ProvisionOptions {
            volume_name: "pvc-uid-1".into(),
            claim: PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("claim-1".into()),
                    namespace: Some("default".into()),
                    uid: Some("uid-1".into()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteMany".into()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity("1Mi".into()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            storage_class: StorageClass {
                provisioner: "example.com/nfs".into(),
                reclaim_policy: Some("Retain".into()),
                ..Default::default()
            },
            selected_node: None,
            allowed_topologies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_provision_describes_export() {
        let nfs = NfsProvisioner::new("nfs.local", "/exports/");
        let state = nfs.provision(options()).await.unwrap();

        let ProvisioningState::Finished(volume) = state else {
            panic!("expected Finished");
        };
        let spec = volume.spec.unwrap();
        let source = spec.nfs.unwrap();
        assert_eq!(source.server, "nfs.local");
        assert_eq!(source.path, "/exports/default-claim-1-pvc-uid-1");
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Retain"));
        assert_eq!(
            spec.capacity.unwrap().get("storage"),
            Some(&Quantity("1Mi".into()))
        );
    }

    #[tokio::test]
    async fn test_delete_foreign_volume_is_ignored() {
        let nfs = NfsProvisioner::new("nfs.local", "/exports");
        let foreign = PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                nfs: Some(NFSVolumeSource {
                    server: "other.local".into(),
                    path: "/x".into(),
                    read_only: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(nfs.delete(&foreign).await.unwrap_err().is_ignored());
    }

    #[test]
    fn test_no_block_support() {
        let caps = ProvisionerCapabilities::of(&NfsProvisioner::new("nfs.local", "/exports"));
        assert!(!caps.block);
        assert!(!caps.qualifier);
    }
}
