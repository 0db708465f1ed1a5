//! Stable fingerprints over canonicalised entities.
//!
//! Serialization goes through `serde_json::Value`, whose map
//! representation sorts keys, so two structurally equal values
//! always hash identically regardless of field or map ordering
//! at the source. Fingerprints key ingress deduplication and
//! the federation queue partitioning.

use armada_client::entities::{
  data::{IngressUnit, VolumeMount},
  image::ImageRef,
  job::TaskDescriptor,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

fn digest(label: &str, value: &impl Serialize) -> String {
  let canonical = serde_json::to_value(value)
    .and_then(|value| serde_json::to_vec(&value))
    .expect("fingerprint serialization cannot fail");
  let mut hasher = Sha256::new();
  hasher.update(label.as_bytes());
  hasher.update([0]);
  hasher.update(&canonical);
  hex::encode(hasher.finalize())
}

/// Registry + repository + tag + digest (when known).
pub fn image(image: &ImageRef) -> String {
  digest(
    "image",
    &(
      &image.registry,
      &image.repository,
      &image.tag,
      &image.digest,
    ),
  )
}

/// Ordered hash of the expanded task descriptors of a job.
/// Partitions the federation action queue.
pub fn task_group(tasks: &[TaskDescriptor]) -> String {
  digest("task-group", &tasks)
}

/// Driver + target + options of a volume mount.
pub fn mount_alias(mount: &VolumeMount) -> String {
  digest("mount", &mount.fingerprint_parts())
}

/// Identity of one ingress unit, deduplicating transfers per
/// scope instance.
pub fn ingress_unit(unit: &IngressUnit) -> String {
  digest("ingress", unit)
}

/// Short prefix used in store keys and log lines.
pub fn short(fingerprint: &str) -> &str {
  &fingerprint[..fingerprint.len().min(16)]
}

#[cfg(test)]
mod tests {
  use super::*;
  use armada_client::entities::data::IngressSource;

  #[test]
  fn fingerprints_are_deterministic() {
    let image_ref = ImageRef::parse("reg.io/app:2").unwrap();
    assert_eq!(image(&image_ref), image(&image_ref.clone()));
  }

  #[test]
  fn digest_distinguishes_tag() {
    let a = ImageRef::parse("reg.io/app:1").unwrap();
    let b = ImageRef::parse("reg.io/app:2").unwrap();
    assert_ne!(image(&a), image(&b));
  }

  #[test]
  fn ingress_units_with_same_content_collide() {
    let unit = |dest: &str| IngressUnit {
      source: IngressSource::ObjectStorage {
        account: "store".into(),
        remote_path: "input/data".into(),
        include: vec!["*.bin".into()],
        exclude: vec![],
      },
      destination: Some(dest.to_string()),
      extra_options: None,
    };
    assert_eq!(
      ingress_unit(&unit("/mnt/in")),
      ingress_unit(&unit("/mnt/in"))
    );
    assert_ne!(
      ingress_unit(&unit("/mnt/in")),
      ingress_unit(&unit("/mnt/other"))
    );
  }

  #[test]
  fn task_group_order_sensitive() {
    let task = |id: &str| TaskDescriptor {
      id: Some(id.to_string()),
      command: "echo".into(),
      ..Default::default()
    };
    let forward = task_group(&[task("a"), task("b")]);
    let reversed = task_group(&[task("b"), task("a")]);
    assert_ne!(forward, reversed);
  }
}
