//! Builders for the cluster objects the scenarios create.
//!
//! Every resource starts from `new()` defaults, is adjusted with chainable
//! `with_*` setters, and is rendered from a manifest template under the
//! fixture directory. Deletes are best-effort: a missing object is not an
//! error and failures are only logged.

mod configmap;
mod daemonset;
mod deployment;
mod pod;
mod policy;
mod pv;
mod pvc;
mod secret;
mod servers;
mod service;
mod statefulset;
mod storageclass;
mod vac;

pub use configmap::{ConfigMap, SharedConfigMap};
pub use daemonset::DaemonSet;
pub use deployment::Deployment;
pub use pod::Pod;
pub use policy::{LimitRange, ResourceQuota};
pub use pv::{get_volume_attributes_class_from_pv, PersistentVolume, PvKind};
pub use pvc::PersistentVolumeClaim;
pub use secret::Secret;
pub use servers::{setup_iscsi_server, setup_nfs_server, IscsiServer, NfsServer};
pub use service::Service;
pub use statefulset::StatefulSet;
pub use storageclass::StorageClass;
pub use vac::VolumeAttributesClass;

use e2e_util::random_string;
use e2e_util::Cli;

/// Fill an empty namespace with the CLI's current project.
fn resolve_namespace(namespace: &mut String, cli: &Cli) {
    if namespace.is_empty() {
        *namespace = cli.namespace().to_string();
    }
}

/// `app=<label>` unless the label already is a selector.
fn app_selector(label: &str) -> String {
    if label.contains('=') {
        label.to_string()
    } else {
        format!("app={label}")
    }
}

/// Quoted random content and the unquoted text `cat` should print back.
fn random_content() -> (String, String) {
    let text = format!("storage test {}", random_string());
    (format!("\"{text}\""), text)
}

/// Writes an executable hello script under `mount` and runs it.
fn exec_right_commands(mount: &str) -> (String, String) {
    let script = format!("{mount}/hello");
    (
        format!(
            "echo '#!/bin/bash\necho \"Hello OpenShift Storage\"' > {script} && chmod +x {script} "
        ),
        script,
    )
}

const EXEC_RIGHT_OUTPUT: &str = "Hello OpenShift Storage";
