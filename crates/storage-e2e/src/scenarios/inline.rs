//! CSI inline volume admission for the shared resource driver.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use e2e_util::{random_string, wait, Cleanup, Cli};
use tracing::{info, warn};

use super::skip;
use crate::cluster::{
    add_labels_to_resource, check_csi_driver_installed, get_cluster_version, get_resource_label,
    patch_resource_as_admin, wait_cso_healthy,
};
use crate::consts::SHARED_RESOURCE_CSI_DRIVER;
use crate::quantity::version_is_above;
use crate::resources::{ConfigMap, Deployment, SharedConfigMap};

const EPHEMERAL_PROFILE_LABEL: &str = "security.openshift.io/csi-ephemeral-volume-profile";

/// Operators that would revert the driver's profile label while it is
/// changed, as `(namespace, deployment)`.
const RECONCILING_OPERATORS: &[(&str, &str)] = &[
    ("openshift-cluster-version", "cluster-version-operator"),
    ("openshift-cluster-storage-operator", "cluster-storage-operator"),
    ("openshift-cluster-csi-drivers", "shared-resource-csi-driver-operator"),
];

fn lower_than_privileged(level: &str, namespace: &str) -> String {
    format!(
        "uses an inline volume provided by CSIDriver {SHARED_RESOURCE_CSI_DRIVER} and namespace \
         {namespace} has a pod security {level} level that is lower than privileged"
    )
}

/// Scale an operator to zero. The deferred restore scales it back and
/// waits for the storage operator to settle.
async fn pause_operator(
    cli: &Cli,
    cleanup: &Cleanup,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let admin = cli.as_admin();
    let mut dep = Deployment::new().with_name(name).with_namespace(namespace);
    let replicas = dep.get_replicas_num(&admin).await?;
    dep.scale_replicas(&admin, "0").await?;
    dep.wait_ready(&admin).await?;
    cleanup.defer(format!("restore {name} replicas"), move || async move {
        let mut dep = dep;
        if let Err(e) = dep.scale_replicas(&admin, &replicas).await {
            warn!(deployment = %dep.name, error = %e, "Failed to restore replicas");
            return;
        }
        if let Err(e) = dep.wait_ready(&admin).await {
            warn!(deployment = %dep.name, error = %e, "Operator did not come back");
        }
        if let Err(e) = wait_cso_healthy(&admin).await {
            warn!(error = %e, "Storage operator is not healthy");
        }
    });
    Ok(())
}

/// Bind `role` to `subject` in the namespace and unbind it on cleanup.
async fn bind_role(
    cli: &Cli,
    cleanup: &Cleanup,
    role: &str,
    subject: &[&str],
) -> Result<()> {
    let namespace = cli.namespace().to_string();
    let role_namespace = format!("--role-namespace={namespace}");
    let admin = cli.as_admin().without_namespace();
    admin
        .run("policy")
        .args(["-n", &namespace, "add-role-to-user", role])
        .args(subject.iter().copied())
        .arg(&role_namespace)
        .execute()
        .await?;
    let role = role.to_string();
    let subject: Vec<String> = subject.iter().map(ToString::to_string).collect();
    cleanup.defer(format!("unbind {role}"), move || async move {
        let result = admin
            .run("policy")
            .args(["-n", &namespace, "remove-role-from-user", &role])
            .args(&subject)
            .arg(&role_namespace)
            .execute()
            .await;
        if let Err(e) = result {
            warn!(role = %role, error = %e, "Failed to remove role binding");
        }
    });
    Ok(())
}

/// A shared configmap mounted as an inline CSI volume is rejected below a
/// privileged enforce level, and admitted with warnings and audit entries
/// once only enforce is raised.
pub(super) async fn shared_resource_admission(cli: Cli, cleanup: Cleanup) -> Result<()> {
    if !check_csi_driver_installed(&cli, &[SHARED_RESOURCE_CSI_DRIVER]).await {
        return Err(skip(format!("{SHARED_RESOURCE_CSI_DRIVER} is not installed")));
    }
    let version = get_cluster_version(&cli).await?;
    if !version_is_above(&version, "4.12")? {
        return Err(skip(format!("inline volume admission needs 4.13+, cluster is {version}")));
    }
    let namespace = cli.namespace().to_string();

    info!("Pause the operators that reconcile the CSI driver");
    for (operator_namespace, name) in RECONCILING_OPERATORS {
        pause_operator(&cli, &cleanup, operator_namespace, name).await?;
    }

    info!("Mark the shared resource driver as privileged only");
    let driver = format!("csidriver/{SHARED_RESOURCE_CSI_DRIVER}");
    let original = get_resource_label(&cli, &driver, EPHEMERAL_PROFILE_LABEL).await?;
    let privileged = format!("{EPHEMERAL_PROFILE_LABEL}=privileged");
    add_labels_to_resource(&cli, &driver, &[privileged.as_str()]).await?;
    {
        let (cli, driver) = (cli.clone(), driver.clone());
        let restore = if original.is_empty() {
            format!("{EPHEMERAL_PROFILE_LABEL}-")
        } else {
            format!("{EPHEMERAL_PROFILE_LABEL}={original}")
        };
        cleanup.defer("restore driver profile label", move || async move {
            if let Err(e) = add_labels_to_resource(&cli, &driver, &[restore.as_str()]).await {
                warn!(error = %e, "Failed to restore driver profile label");
            }
        });
    }

    info!("Set every pod security level of the project to restricted");
    let project = format!("ns/{namespace}");
    add_labels_to_resource(
        &cli,
        &project,
        &[
            "pod-security.kubernetes.io/enforce=restricted",
            "pod-security.kubernetes.io/warn=restricted",
            "pod-security.kubernetes.io/audit=restricted",
        ],
    )
    .await?;

    info!("Share a configmap through the driver");
    let mut cm = ConfigMap::new();
    cm.create(&cli).await?;
    {
        let (cli, cm) = (cli.clone(), cm.clone());
        cleanup.defer("delete configmap", move || async move { cm.delete_as_admin(&cli).await });
    }
    let shared = SharedConfigMap::new(format!("sharedconfigmap-{}", random_string()), &cm);
    shared.create(&cli).await?;
    {
        let (cli, shared) = (cli.clone(), shared.clone());
        cleanup.defer("delete shared configmap", move || async move {
            shared.delete_as_admin(&cli).await;
        });
    }

    info!("Allow the default service account and the user to use the share");
    let role = format!("shared-cm-role-{}", random_string());
    cli.as_admin()
        .run("create")
        .args(["role", &role, "--verb=get", "--resource=sharedconfigmaps"])
        .execute()
        .await?;
    patch_resource_as_admin(
        &cli,
        &namespace,
        &format!("role/{role}"),
        r#"[{"op":"replace","path":"/rules/0/verbs/0","value":"use"}]"#,
        "json",
    )
    .await?;
    bind_role(&cli, &cleanup, &role, &["-z", "default"]).await?;
    let user = cli.without_namespace().run("whoami").output().await?;
    bind_role(&cli, &cleanup, &role, &[user.as_str()]).await?;

    info!("Check the inline volume is rejected under a restricted enforce level");
    let mut dep = Deployment::new().with_template("deployment-with-inline-volume-template.yaml");
    let rejected = dep
        .create_with_inline_volume(&cli, shared.inline_volume())
        .await
        .err()
        .context("deployment with inline volume was admitted")?;
    let enforce = lower_than_privileged("enforce", &namespace);
    ensure!(
        rejected.output().contains(&enforce),
        "unexpected rejection {:?}",
        rejected.output()
    );

    info!("Raise only the enforce level and check the warning");
    add_labels_to_resource(
        &cli,
        &project,
        &[
            "pod-security.kubernetes.io/enforce=privileged",
            "security.openshift.io/scc.podSecurityLabelSync=false",
        ],
    )
    .await?;
    let output = dep.create_with_inline_volume(&cli, shared.inline_volume()).await?;
    {
        let (cli, dep) = (cli.clone(), dep.clone());
        cleanup.defer("delete deployment", move || async move { dep.delete_as_admin(&cli).await });
    }
    let warning = lower_than_privileged("warn", &namespace);
    ensure!(output.contains(&warning), "missing admission warning in {output:?}");
    dep.wait_ready(&cli).await?;

    info!("Check the API server audit log records the admission");
    let audit = lower_than_privileged("audit", &namespace);
    let admin = cli.as_admin().without_namespace();
    wait::eventually(
        "audit log to record the inline volume admission",
        Duration::from_secs(120),
        Duration::from_secs(10),
        || async {
            admin
                .run("adm")
                .args(["node-logs", "--role=master", "--path=kube-apiserver/audit.log"])
                .output()
                .await
                .is_ok_and(|log| log.contains(&audit))
        },
        |recorded| *recorded,
    )
    .await?;
    Ok(())
}
