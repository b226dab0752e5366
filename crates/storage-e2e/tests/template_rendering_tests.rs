//! Shipped manifest templates render, parse and accept the edits the
//! resource builders apply to them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use e2e_util::template::ManifestRenderer;
use e2e_util::testing::ScriptedRunner;
use e2e_util::Cli;
use serde_json::Value;
use storage_e2e::resources::{
    ConfigMap, Deployment, LimitRange, PersistentVolume, PersistentVolumeClaim, Pod, PvKind,
    ResourceQuota, SharedConfigMap, StatefulSet, StorageClass, VolumeAttributesClass,
};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/storage")
}

/// A value for every placeholder any template uses.
const ALL_PARAMS: &[(&str, &str)] = &[
    ("ACCESSMODE", "ReadWriteOnce"),
    ("APPLABEL", "mysts"),
    ("CAPACITY", "1Gi"),
    ("CMNAME", "cm"),
    ("CMNAMESPACE", "ns1"),
    ("DEFAULTLIMIT", "1Gi"),
    ("DEFAULTREQUEST", "1Gi"),
    ("DLABEL", "myapp"),
    ("DNAME", "dep"),
    ("DNAMESPACE", "ns1"),
    ("DRIVERNAME", "ebs.csi.aws.com"),
    ("DSLABEL", "myds"),
    ("DSNAME", "ds"),
    ("DSNAMESPACE", "ns1"),
    ("HARDLIMITS", "6Gi"),
    ("HARDREQUESTS", "6Gi"),
    ("LIMITKIND", "ephemeral-storage"),
    ("LIMITRANGENAME", "lr"),
    ("LIMITRANGENAMESPACE", "ns1"),
    ("LIMITTYPE", "Container"),
    ("MAXVALUE", "2Gi"),
    ("MINVALUE", "500Mi"),
    ("MPATH", "/mnt/storage"),
    ("NAME", "pv"),
    ("PATHTYPE", "mountPath"),
    ("PODIMAGE", "quay.io/openshifttest/hello-openshift"),
    ("PODMOUNTPATH", "/mnt/storage"),
    ("PODNAME", "pod"),
    ("PODNAMESPACE", "ns1"),
    ("PORT", "2049"),
    ("PROTOCOL", "TCP"),
    ("PROVISIONER", "ebs.csi.aws.com"),
    ("PVCCAPACITY", "1Gi"),
    ("PVCNAME", "pvc"),
    ("PVCNAMESPACE", "ns1"),
    ("RECLAIMPOLICY", "Delete"),
    ("REFCMNAME", "cm"),
    ("REFCMNAMESPACE", "ns1"),
    ("REPLICASNUM", "1"),
    ("RESOURCEQUOTANAME", "rq"),
    ("RESOURCEQUOTANAMESPACE", "ns1"),
    ("RESOURCETYPE", "ephemeral-storage"),
    ("SCMNAME", "scm"),
    ("SCNAME", "sc"),
    ("SECNAME", "secret"),
    ("SECNAMESPACE", "ns1"),
    ("SELECTORLABEL", "nfs"),
    ("SERVICENAME", "svc"),
    ("SERVICENAMESPACE", "ns1"),
    ("STSNAME", "sts"),
    ("STSNAMESPACE", "ns1"),
    ("TARGETPORT", "2049"),
    ("TYPE", "Opaque"),
    ("TYPEPATH", "mountPath"),
    ("VACNAME", "vac"),
    ("VOLUMEMODE", "Filesystem"),
    ("VOLUMENAME", "vol"),
    ("VOLUMETYPE", "volumeMounts"),
];

/// CLI whose rendered manifests land in `dir`.
fn cli_with_output(dir: &Path) -> Cli {
    Arc::new(ScriptedRunner::new())
        .into_cli("ns1")
        .with_fixture_dir(fixture_dir())
        .with_output_dir(dir)
}

/// The only manifest written to `dir`, first item.
fn written_item(dir: &Path) -> Value {
    let manifests: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with("config.json"))
        .collect();
    assert_eq!(manifests.len(), 1, "expected one manifest in {}", dir.display());
    let written = std::fs::read_to_string(&manifests[0]).unwrap();
    let doc: Value = serde_json::from_str(&written).unwrap();
    assert_eq!(doc["kind"], "List");
    doc["items"][0].clone()
}

#[test]
fn test_every_template_renders_to_a_single_object() {
    let renderer = ManifestRenderer::new();
    let mut seen = 0;
    for entry in std::fs::read_dir(fixture_dir()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let list = renderer
            .render_list(&path, ALL_PARAMS)
            .unwrap_or_else(|e| panic!("{} failed to render: {e}", path.display()));
        let items = list["items"].as_array().unwrap();
        assert_eq!(items.len(), 1, "{}", path.display());
        assert!(items[0]["kind"].is_string(), "{}", path.display());
        assert!(items[0]["metadata"]["name"].is_string(), "{}", path.display());
        seen += 1;
    }
    assert_eq!(seen, 18);
}

#[test]
fn test_missing_placeholder_is_rejected() {
    let renderer = ManifestRenderer::new();
    let err = renderer
        .render_list(&fixture_dir().join("pvc-template.yaml"), &[("PVCNAME", "pvc")])
        .unwrap_err();
    assert!(err.to_string().contains("pvc-template.yaml"));
}

#[test]
fn test_configmap_carries_both_keys() {
    let list = ManifestRenderer::new()
        .render_list(&fixture_dir().join("configmap-template.yaml"), ALL_PARAMS)
        .unwrap();
    let data = &list["items"][0]["data"];
    assert!(data["storage.properties"].is_string());
    assert!(data["storage.cnf"].as_str().unwrap().contains("e2e-test = true"));
}

#[tokio::test]
async fn test_deployment_block_mode_uses_volume_devices() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    let mut dep = Deployment::new()
        .with_pvc("data")
        .with_volume_type("volumeDevices")
        .with_path_type("devicePath")
        .with_mount_path("/dev/dblock");
    dep.create(&cli).await.unwrap();

    let item = written_item(dir.path());
    let container = &item["spec"]["template"]["spec"]["containers"][0];
    assert_eq!(container["volumeDevices"][0]["devicePath"], "/dev/dblock");
    assert!(container.get("volumeMounts").is_none());
    assert_eq!(
        item["spec"]["template"]["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
        "data"
    );
    assert_eq!(item["spec"]["replicas"], 1);
}

#[tokio::test]
async fn test_ephemeral_pod_template_has_two_named_containers() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    let mut pod = Pod::new()
        .with_name("eph")
        .with_template("pod-with-multiple-containers-using-emptydir-template.yaml");
    pod.create(&cli).await.unwrap();

    let item = written_item(dir.path());
    let containers = item["spec"]["containers"].as_array().unwrap();
    assert_eq!(containers[0]["name"], "eph-container-0");
    assert_eq!(containers[1]["name"], "eph-container-1");
    assert!(item["spec"]["volumes"][0]["emptyDir"].is_object());
}

#[tokio::test]
async fn test_nfs_pv_source_is_added_under_spec() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    PersistentVolume::new()
        .with_name("nfs-pv")
        .with_kind(PvKind::Nfs)
        .with_nfs_server_ip("172.30.0.10")
        .with_capacity("5Gi")
        .with_access_mode("ReadWriteMany")
        .create(&cli)
        .await
        .unwrap();

    let item = written_item(dir.path());
    assert_eq!(item["kind"], "PersistentVolume");
    assert_eq!(item["spec"]["nfs"]["server"], "172.30.0.10");
    assert_eq!(item["spec"]["capacity"]["storage"], "5Gi");
    assert_eq!(item["spec"]["accessModes"][0], "ReadWriteMany");
    assert!(item["metadata"].get("namespace").is_none());
}

#[tokio::test]
async fn test_static_pv_with_volume_attributes_class() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    PersistentVolume::new()
        .with_driver("ebs.csi.aws.com")
        .with_volume_handle("vol-0123")
        .create_with_volume_attributes_class(&cli, "gold")
        .await
        .unwrap();

    let item = written_item(dir.path());
    assert_eq!(item["spec"]["volumeAttributesClassName"], "gold");
    assert_eq!(item["spec"]["csi"]["driver"], "ebs.csi.aws.com");
    assert_eq!(item["spec"]["csi"]["volumeHandle"], "vol-0123");
}

#[tokio::test]
async fn test_vac_and_storageclass_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    VolumeAttributesClass::new()
        .with_name("gp3-fast")
        .with_parameter("iops", "4000")
        .create(&cli)
        .await
        .unwrap();
    let vac = written_item(dir.path());
    assert_eq!(vac["kind"], "VolumeAttributesClass");
    assert_eq!(vac["driverName"], "ebs.csi.aws.com");
    assert_eq!(vac["parameters"]["iops"], "4000");

    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    StorageClass::new()
        .with_provisioner("efs.csi.aws.com")
        .with_volume_binding_mode("Immediate")
        .with_parameter("provisioningMode", "efs-ap")
        .create(&cli)
        .await
        .unwrap();
    let sc = written_item(dir.path());
    assert_eq!(sc["provisioner"], "efs.csi.aws.com");
    assert_eq!(sc["volumeBindingMode"], "Immediate");
    assert_eq!(sc["parameters"]["provisioningMode"], "efs-ap");
}

#[tokio::test]
async fn test_statefulset_claim_names_match_claim_template() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    let mut sts = StatefulSet::new()
        .with_name("nfs-sts")
        .with_volume_name("vol")
        .with_storage_class("nfs-sc");
    sts.create(&cli).await.unwrap();

    let item = written_item(dir.path());
    let claim = &item["spec"]["volumeClaimTemplates"][0];
    assert_eq!(claim["metadata"]["name"], "vol");
    assert_eq!(claim["spec"]["storageClassName"], "nfs-sc");
    // Pods of a statefulset get claims named <template>-<set>-<ordinal>
    assert_eq!(sts.pvc_name(1), "vol-nfs-sts-1");
}

#[tokio::test]
async fn test_policy_templates_key_by_resource() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    LimitRange::new()
        .with_min("1Gi")
        .with_max("4Gi")
        .create(&cli)
        .await
        .unwrap();
    let limit_range = written_item(dir.path());
    let limits = &limit_range["spec"]["limits"][0];
    assert_eq!(limits["type"], "Container");
    assert_eq!(limits["min"]["ephemeral-storage"], "1Gi");
    assert_eq!(limits["max"]["ephemeral-storage"], "4Gi");

    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    ResourceQuota::new()
        .with_hard_requests("6Gi")
        .with_hard_limits("6Gi")
        .create(&cli)
        .await
        .unwrap();
    let quota = written_item(dir.path());
    assert_eq!(quota["spec"]["hard"]["requests.ephemeral-storage"], "6Gi");
    assert_eq!(quota["spec"]["hard"]["limits.ephemeral-storage"], "6Gi");
    assert_eq!(quota["metadata"]["namespace"], "ns1");
}

#[tokio::test]
async fn test_claim_and_configmap_use_cli_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    let mut pvc = PersistentVolumeClaim::new()
        .with_storage_class("sc")
        .with_volume_mode("Block");
    pvc.create(&cli).await.unwrap();
    let claim = written_item(dir.path());
    assert_eq!(claim["metadata"]["namespace"], "ns1");
    assert_eq!(claim["spec"]["volumeMode"], "Block");
    assert_eq!(pvc.namespace, "ns1");

    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    let mut cm = ConfigMap::new();
    cm.create(&cli).await.unwrap();
    assert_eq!(written_item(dir.path())["metadata"]["namespace"], "ns1");
    assert_eq!(cm.namespace, "ns1");
}

#[tokio::test]
async fn test_shared_configmap_references_its_configmap() {
    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    let mut cm = ConfigMap::new().with_name("my-cm");
    cm.create(&cli).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cli = cli_with_output(dir.path());
    let shared = SharedConfigMap::new("my-share", &cm);
    shared.create(&cli).await.unwrap();
    let item = written_item(dir.path());
    assert_eq!(item["kind"], "SharedConfigMap");
    assert_eq!(item["metadata"]["name"], "my-share");
    assert!(item["metadata"].get("namespace").is_none());
    assert_eq!(item["spec"]["configMapRef"]["name"], "my-cm");
    assert_eq!(item["spec"]["configMapRef"]["namespace"], "ns1");

    let volume = shared.inline_volume();
    assert_eq!(volume["csi"]["driver"], "csi.sharedresource.openshift.io");
    assert_eq!(volume["csi"]["volumeAttributes"]["sharedConfigMap"], "my-share");
}
