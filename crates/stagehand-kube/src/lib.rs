//! # stagehand-kube
//!
//! Kubernetes integration for stagehand: the deployed-images probe the
//! cleanup engine uses for exclusion, and the ConfigMap lock backend for
//! repositories shared between hosts. Both surfaces are read-mostly;
//! the only writes are the lock ConfigMaps themselves.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

mod configmap_lock;
mod probe;

pub use configmap_lock::ConfigMapLockBackend;
pub use probe::{images_from_pod_spec, KubeImagesProbe};
