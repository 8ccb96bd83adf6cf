//! Pod descriptions.
//!
//! - [`PodSpec`]: what the caller asked for
//! - [`ContainerInfo`] / [`VolumeInfo`]: what the image and storage layers
//!   resolved it to on the host
//! - [`VmPod`]: the runtime spec sent to the guest init, expanded with the
//!   concrete device names, interfaces and routes the hotplug produced

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filesystem type marking a shared-directory rootfs.
pub const FSTYPE_DIR: &str = "dir";

// ============================================================================
// CALLER INPUT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSpec {
    pub name: String,
    pub hostname: Option<String>,
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
    /// Number of network interfaces. Interface 0 carries the default route.
    pub interfaces: usize,
}

impl PodSpec {
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub tty: bool,
    pub restart_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMount {
    pub volume: String,
    pub path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSpec {
    pub name: String,
    pub source: String,
    pub driver: String,
}

// ============================================================================
// RESOLVED BY STORAGE
// ============================================================================

/// Host-side resolution of one container, produced by the storage layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerInfo {
    pub id: String,
    pub rootfs: String,
    /// Block device path, or a path relative to the shared dir for `dir`.
    pub image: String,
    pub fstype: String,
    pub workdir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ContainerInfo {
    pub fn is_block(&self) -> bool {
        self.fstype != FSTYPE_DIR
    }
}

/// Backing store of one volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeInfo {
    pub name: String,
    pub filepath: String,
    pub fstype: String,
    /// `raw` or `qcow2` for block devices, `vfs` for a shared directory.
    pub format: String,
}

impl VolumeInfo {
    pub fn is_block(&self) -> bool {
        matches!(self.format.as_str(), "raw" | "qcow2")
    }
}

// ============================================================================
// RUNTIME SPEC (guest-facing)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPod {
    pub hostname: String,
    pub containers: Vec<VmContainer>,
    pub interfaces: Vec<VmInterface>,
    pub routes: Vec<VmRoute>,
    pub share_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmContainer {
    pub id: String,
    pub rootfs: String,
    pub fstype: String,
    pub image: String,
    pub volumes: Vec<VmVolume>,
    pub fsmap: Vec<VmFsmap>,
    /// Persistent TTY session id, 0 when the container has no terminal.
    pub tty: u64,
    pub workdir: String,
    pub cmd: Vec<String>,
    pub envs: Vec<VmEnv>,
    pub restart_policy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmVolume {
    pub device: String,
    pub mount: String,
    pub fstype: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmFsmap {
    pub source: String,
    pub path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmEnv {
    pub env: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInterface {
    pub device: String,
    pub ip_address: String,
    pub net_mask: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmRoute {
    pub dest: String,
    pub gateway: String,
    pub device: String,
}

impl VmPod {
    /// Expand a pod into its runtime spec before any device is attached.
    ///
    /// Block-backed rootfs images and volumes are filled in later by the
    /// hotplug confirmations; directory-backed ones are mapped here.
    pub fn expand(
        spec: &PodSpec,
        containers: &[ContainerInfo],
        volumes: &[VolumeInfo],
        share_dir: &str,
    ) -> Self {
        let hostname = spec.hostname.clone().unwrap_or_else(|| spec.name.clone());
        let containers = spec
            .containers
            .iter()
            .zip(containers)
            .map(|(user, info)| VmContainer::merge(user, info, volumes))
            .collect();

        Self {
            hostname,
            containers,
            interfaces: Vec::new(),
            routes: Vec::new(),
            share_dir: share_dir.to_string(),
        }
    }

    pub fn container_index(&self, id_or_name: &str) -> Option<usize> {
        self.containers.iter().position(|c| c.id == id_or_name)
    }
}

impl VmContainer {
    fn merge(user: &ContainerSpec, info: &ContainerInfo, volumes: &[VolumeInfo]) -> Self {
        let entrypoint = if user.entrypoint.is_empty() {
            &info.entrypoint
        } else {
            &user.entrypoint
        };
        let command = if user.command.is_empty() {
            &info.cmd
        } else {
            &user.command
        };
        let cmd = entrypoint.iter().chain(command).cloned().collect();

        let workdir = user
            .workdir
            .clone()
            .filter(|w| !w.is_empty())
            .or_else(|| Some(info.workdir.clone()).filter(|w| !w.is_empty()))
            .unwrap_or_else(|| "/".to_string());

        let mut env = info.env.clone();
        env.extend(user.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let envs = env
            .into_iter()
            .map(|(env, value)| VmEnv { env, value })
            .collect();

        // Directory-backed volumes are visible to the guest through the share dir.
        let fsmap = user
            .volumes
            .iter()
            .filter_map(|mount| {
                volumes
                    .iter()
                    .find(|v| v.name == mount.volume && !v.is_block())
                    .map(|v| VmFsmap {
                        source: v.filepath.clone(),
                        path: mount.path.clone(),
                        read_only: mount.read_only,
                    })
            })
            .collect();

        let image = if info.is_block() {
            String::new()
        } else {
            info.image.clone()
        };

        Self {
            id: info.id.clone(),
            rootfs: info.rootfs.clone(),
            fstype: info.fstype.clone(),
            image,
            volumes: Vec::new(),
            fsmap,
            tty: 0,
            workdir,
            cmd,
            envs,
            restart_policy: user
                .restart_policy
                .clone()
                .unwrap_or_else(|| "never".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, fstype: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            rootfs: "/rootfs".to_string(),
            image: format!("/dev/mapper/{}", id),
            fstype: fstype.to_string(),
            workdir: String::new(),
            entrypoint: vec!["/entry".to_string()],
            cmd: vec!["default".to_string()],
            env: BTreeMap::from([
                ("PATH".to_string(), "/bin".to_string()),
                ("MODE".to_string(), "image".to_string()),
            ]),
        }
    }

    #[test]
    fn test_command_merge_prefers_user_parts() {
        let user = ContainerSpec {
            command: vec!["serve".to_string(), "--port=80".to_string()],
            ..Default::default()
        };
        let c = VmContainer::merge(&user, &info("c1", "ext4"), &[]);
        assert_eq!(c.cmd, vec!["/entry", "serve", "--port=80"]);
        assert_eq!(c.workdir, "/");
        assert_eq!(c.restart_policy, "never");
    }

    #[test]
    fn test_env_user_overrides_image() {
        let user = ContainerSpec {
            env: BTreeMap::from([("MODE".to_string(), "user".to_string())]),
            ..Default::default()
        };
        let c = VmContainer::merge(&user, &info("c1", "ext4"), &[]);
        let mode = c.envs.iter().find(|e| e.env == "MODE").unwrap();
        assert_eq!(mode.value, "user");
        assert_eq!(c.envs.len(), 2);
    }

    #[test]
    fn test_dir_rootfs_and_vfs_volume_mapped_directly() {
        let user = ContainerSpec {
            volumes: vec![
                VolumeMount {
                    volume: "data".to_string(),
                    path: "/data".to_string(),
                    read_only: true,
                },
                VolumeMount {
                    volume: "disk".to_string(),
                    path: "/disk".to_string(),
                    read_only: false,
                },
            ],
            ..Default::default()
        };
        let volumes = vec![
            VolumeInfo {
                name: "data".to_string(),
                filepath: "vol/data".to_string(),
                fstype: "dir".to_string(),
                format: "vfs".to_string(),
            },
            VolumeInfo {
                name: "disk".to_string(),
                filepath: "/var/disk.img".to_string(),
                fstype: "ext4".to_string(),
                format: "raw".to_string(),
            },
        ];
        let mut dir_info = info("c1", FSTYPE_DIR);
        dir_info.image = "c1/rootfs".to_string();

        let c = VmContainer::merge(&user, &dir_info, &volumes);
        assert_eq!(c.image, "c1/rootfs");
        assert_eq!(c.fsmap.len(), 1);
        assert_eq!(c.fsmap[0].source, "vol/data");
        assert!(c.fsmap[0].read_only);
        assert!(c.volumes.is_empty());
    }

    #[test]
    fn test_runtime_spec_json_field_names() {
        let spec = PodSpec {
            name: "web".to_string(),
            containers: vec![ContainerSpec::default()],
            ..Default::default()
        };
        let pod = VmPod::expand(&spec, &[info("c1", "ext4")], &[], "share_dir");
        let json = serde_json::to_value(&pod).unwrap();
        assert_eq!(json["hostname"], "web");
        assert_eq!(json["shareDir"], "share_dir");
        assert!(json["containers"][0].get("restartPolicy").is_some());
        assert_eq!(pod.container_index("c1"), Some(0));
    }
}
