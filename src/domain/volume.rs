//! Claim and Volume Helpers
//!
//! Well-known annotations and small accessors over the Kubernetes
//! `PersistentVolumeClaim` / `PersistentVolume` / `StorageClass` types.

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Annotation naming the provisioner that created a volume
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// Annotation naming the driver a volume was migrated to
pub const ANN_MIGRATED_TO: &str = "pv.kubernetes.io/migrated-to";

/// Annotation set by the scheduler on claims whose class waits for a consumer
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

/// Provisioner requested for a claim
pub const ANN_STORAGE_PROVISIONER: &str = "volume.kubernetes.io/storage-provisioner";

/// Provisioner requested for a claim (beta)
pub const ANN_BETA_STORAGE_PROVISIONER: &str = "volume.beta.kubernetes.io/storage-provisioner";

/// Storage class of a claim (beta, predates `spec.storageClassName`)
pub const ANN_BETA_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

pub const RESOURCE_STORAGE: &str = "storage";
pub const VOLUME_MODE_BLOCK: &str = "Block";
pub const BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";
pub const RECLAIM_DELETE: &str = "Delete";
pub const PHASE_RELEASED: &str = "Released";

fn annotation<'a>(
    annotations: Option<&'a std::collections::BTreeMap<String, String>>,
    key: &str,
) -> Option<&'a str> {
    annotations
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Stable unique identifier of a claim
pub fn claim_uid(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.metadata.uid.as_deref().filter(|u| !u.is_empty())
}

/// `namespace/name` of a claim, for logging
pub fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}",
        claim.metadata.namespace.as_deref().unwrap_or("default"),
        claim.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Storage class requested by a claim
pub fn claim_class(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
        .filter(|c| !c.is_empty())
        .or_else(|| annotation(claim.metadata.annotations.as_ref(), ANN_BETA_STORAGE_CLASS))
}

/// Provisioner named on the claim itself, stable annotation first
pub fn claim_provisioner(claim: &PersistentVolumeClaim) -> Option<&str> {
    let annotations = claim.metadata.annotations.as_ref();
    annotation(annotations, ANN_STORAGE_PROVISIONER)
        .or_else(|| annotation(annotations, ANN_BETA_STORAGE_PROVISIONER))
}

/// Node chosen by the scheduler, if any
pub fn selected_node(claim: &PersistentVolumeClaim) -> Option<&str> {
    annotation(claim.metadata.annotations.as_ref(), ANN_SELECTED_NODE)
}

/// Whether the claim is already bound to a volume
pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .is_some_and(|v| !v.is_empty())
}

/// Whether the claim requests a raw block device
pub fn is_block_claim(claim: &PersistentVolumeClaim) -> bool {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        == Some(VOLUME_MODE_BLOCK)
}

/// Requested storage size of a claim
pub fn requested_storage(claim: &PersistentVolumeClaim) -> Option<&Quantity> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(RESOURCE_STORAGE))
}

/// Size of a quantity in bytes, `None` when it can't be parsed
pub fn quantity_bytes(quantity: &Quantity) -> Option<u64> {
    let s = quantity.0.trim();
    let (number, suffix) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    };
    let number: f64 = number.parse().ok()?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    };

    Some((number * multiplier as f64).ceil() as u64)
}

/// Deterministic volume name for a claim
pub fn volume_name_for_claim(uid: &str) -> String {
    format!("pvc-{}", uid)
}

/// Reference pointing back at the claim
pub fn claim_reference(claim: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: claim.metadata.namespace.clone(),
        name: claim.metadata.name.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    }
}

/// Whether the class defers binding until a consumer is scheduled
pub fn waits_for_first_consumer(class: &StorageClass) -> bool {
    class.volume_binding_mode.as_deref() == Some(BINDING_WAIT_FOR_FIRST_CONSUMER)
}

/// Reclaim policy a class applies to its volumes
pub fn class_reclaim_policy(class: &StorageClass) -> &str {
    class.reclaim_policy.as_deref().unwrap_or(RECLAIM_DELETE)
}

/// Uid of the claim a volume is bound to
pub fn volume_claim_uid(volume: &PersistentVolume) -> Option<&str> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .and_then(|r| r.uid.as_deref())
}

/// Storage class recorded on a volume
pub fn volume_class(volume: &PersistentVolume) -> &str {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
        .unwrap_or_default()
}

/// Provisioner named on a volume, `migrated-to` taking precedence
pub fn volume_provisioners(volume: &PersistentVolume) -> impl Iterator<Item = &str> {
    let annotations = volume.metadata.annotations.as_ref();
    [
        annotation(annotations, ANN_MIGRATED_TO),
        annotation(annotations, ANN_PROVISIONED_BY),
    ]
    .into_iter()
    .flatten()
}

/// Lifecycle phase of a volume
pub fn volume_phase(volume: &PersistentVolume) -> Option<&str> {
    volume.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Reclaim policy of a volume
pub fn volume_reclaim_policy(volume: &PersistentVolume) -> Option<&str> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn claim_with(annotations: &[(&str, &str)], class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("claim-1".into()),
                namespace: Some("default".into()),
                uid: Some("uid-1".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: class.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_quantity_bytes() {
        let bytes = |s: &str| quantity_bytes(&Quantity(s.into()));
        assert_eq!(bytes("1Mi"), Some(1_048_576));
        assert_eq!(bytes("1M"), Some(1_000_000));
        assert_eq!(bytes("1.5Gi"), Some(1_610_612_736));
        assert_eq!(bytes("512"), Some(512));
        assert_eq!(bytes("2k"), Some(2_000));
        assert_eq!(bytes("1Qi"), None);
        assert_eq!(bytes(""), None);
    }

    #[test]
    fn test_claim_class_prefers_spec() {
        let claim = claim_with(&[(ANN_BETA_STORAGE_CLASS, "beta")], Some("class-1"));
        assert_eq!(claim_class(&claim), Some("class-1"));

        let claim = claim_with(&[(ANN_BETA_STORAGE_CLASS, "beta")], None);
        assert_eq!(claim_class(&claim), Some("beta"));

        let claim = claim_with(&[], Some(""));
        assert_eq!(claim_class(&claim), None);
    }

    #[test]
    fn test_claim_provisioner_prefers_stable_annotation() {
        let claim = claim_with(
            &[
                (ANN_STORAGE_PROVISIONER, "stable.io/p"),
                (ANN_BETA_STORAGE_PROVISIONER, "beta.io/p"),
            ],
            None,
        );
        assert_eq!(claim_provisioner(&claim), Some("stable.io/p"));

        let claim = claim_with(&[(ANN_BETA_STORAGE_PROVISIONER, "beta.io/p")], None);
        assert_eq!(claim_provisioner(&claim), Some("beta.io/p"));
    }

    #[test]
    fn test_empty_selected_node_is_absent() {
        let claim = claim_with(&[(ANN_SELECTED_NODE, "")], None);
        assert_eq!(selected_node(&claim), None);

        let claim = claim_with(&[(ANN_SELECTED_NODE, "node-1")], None);
        assert_eq!(selected_node(&claim), Some("node-1"));
    }

    #[test]
    fn test_claim_reference() {
        let claim = claim_with(&[], Some("class-1"));
        let reference = claim_reference(&claim);
        assert_eq!(reference.kind.as_deref(), Some("PersistentVolumeClaim"));
        assert_eq!(reference.uid.as_deref(), Some("uid-1"));
        assert_eq!(reference.name.as_deref(), Some("claim-1"));
        assert_eq!(volume_name_for_claim("uid-1"), "pvc-uid-1");
    }
}
