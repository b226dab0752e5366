//! Images, identifiers and timeouts shared by the storage scenarios.

use std::time::Duration;

pub use e2e_util::wait::{
    DEFAULT_ITERATION_TIMES, DEFAULT_MAX_WAITING_TIME, LONGER_MAX_WAITING_TIME,
    LONGEST_MAX_WAITING_TIME, MORE_LONGER_MAX_WAITING_TIME,
};

/// Default workload image, prints `Hello OpenShift` and idles.
pub const HELLO_OPENSHIFT_IMAGE: &str = concat!(
    "quay.io/openshifttest/hello-openshift@sha256:",
    "56c354e7885051b6bb4263f9faa58b2c292d44790599b7dde0e49e7c466cf339"
);

/// Fedora base image with `fallocate`, used by the ephemeral storage cases.
pub const BASE_FEDORA_IMAGE: &str = concat!(
    "quay.io/openshifttest/base-fedora@sha256:",
    "8962182b4bfc7ee362726ad66871334587e7e5695bec3d7cfc3acbca7a4d309c"
);

pub const ISCSI_TARGET_IQN: &str = "iqn.2016-04.test.com:storage.target00";
pub const ISCSI_INITIATOR_NAME: &str = "iqn.2016-04.test.com:test.img";
pub const ISCSI_PORT: &str = "3260";

pub const MONITORING_NAMESPACE: &str = "openshift-monitoring";
pub const PROMETHEUS_QUERY_URL: &str =
    "https://prometheus-k8s.openshift-monitoring.svc:9091/api/v1/query";

/// Pod-exec retry window for transient API server errors.
pub const EXEC_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const EXEC_RETRY_TIMEOUT: Duration = Duration::from_secs(15);

/// Error fragments that make a pod exec worth retrying.
pub const TRANSIENT_EXEC_ERRORS: &[&str] = &[
    "unable to upgrade connection: container not found",
    "error dialing backend",
    "Resource temporarily unavailable",
];

/// Provisioners the volume-count metrics scenario knows how to drive.
pub const METRICS_SCENARIO_PROVISIONERS: &[&str] = &[
    "ebs.csi.aws.com",
    "efs.csi.aws.com",
    "disk.csi.azure.com",
    "file.csi.azure.com",
    "pd.csi.storage.gke.io",
    "diskplugin.csi.alibabacloud.com",
    "csi.vsphere.vmware.com",
    "vpc.block.csi.ibm.io",
];

pub const SHARED_RESOURCE_CSI_DRIVER: &str = "csi.sharedresource.openshift.io";
pub const EFS_CSI_DRIVER: &str = "efs.csi.aws.com";

/// Fires while pods on a node keep failing volume mounts.
pub const MOUNT_FAILURE_ALERT: &str = "PodStartupStorageOperationsFailing";

/// Block provisioners whose mount failures surface the mount alert.
pub const MOUNT_FAILURE_ALERT_PROVISIONERS: &[&str] = &[
    "ebs.csi.aws.com",
    "disk.csi.azure.com",
    "cinder.csi.openstack.org",
    "pd.csi.storage.gke.io",
    "csi.vsphere.vmware.com",
    "vpc.block.csi.ibm.io",
];

/// Provisioners whose attach failures surface the mount alert.
pub const ATTACH_FAILURE_ALERT_PROVISIONERS: &[&str] = &[
    "ebs.csi.aws.com",
    "disk.csi.azure.com",
    "cinder.csi.openstack.org",
    "pd.csi.storage.gke.io",
    "vpc.block.csi.ibm.io",
];
