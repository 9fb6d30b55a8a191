use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{GpuId, ImageRef, Mount, NetworkSpec, Resources, TaskEnv, TaskId, VolumeSpec};

/// Description of one containerized job and the capabilities it needs.
///
/// A descriptor is immutable once built: the orchestrator only ever reads it, so it can be
/// shared behind an `Arc` between the status tracking and teardown paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    task_id: TaskId,
    image: ImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "TaskEnv::is_empty")]
    env: TaskEnv,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    expose: Vec<String>,
    #[serde(default)]
    resources: Resources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    gpu_devices: Vec<GpuId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, VolumeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    networks: Vec<NetworkSpec>,
    #[serde(default)]
    cgroup_parent: String,
    #[serde(default)]
    auto_remove: bool,
    #[serde(default)]
    commit_on_stop: bool,
}

impl TaskDescriptor {
    pub fn builder(task_id: impl Into<TaskId>, image: impl Into<ImageRef>) -> TaskDescriptorBuilder {
        TaskDescriptorBuilder::new(task_id.into(), image.into())
    }

    #[inline]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    #[inline]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Registry credentials, passed verbatim to pull and push calls.
    #[inline]
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    #[inline]
    pub fn env(&self) -> &TaskEnv {
        &self.env
    }

    #[inline]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Port specifications to expose (e.g. `"80/tcp"`).
    #[inline]
    pub fn expose(&self) -> &[String] {
        &self.expose
    }

    #[inline]
    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Accounting group the container's cgroup is placed under.
    #[inline]
    pub fn cgroup_parent(&self) -> &str {
        &self.cgroup_parent
    }

    #[inline]
    pub fn auto_remove(&self) -> bool {
        self.auto_remove
    }

    /// Whether the container filesystem is committed and pushed once the task stops.
    #[inline]
    pub fn commit_on_stop(&self) -> bool {
        self.commit_on_stop
    }

    // Capability views consumed by the tuning pipeline.

    pub fn is_gpu_required(&self) -> bool {
        !self.gpu_devices.is_empty()
    }

    pub fn gpu_device_ids(&self) -> &[GpuId] {
        &self.gpu_devices
    }

    pub fn volumes(&self) -> &BTreeMap<String, VolumeSpec> {
        &self.volumes
    }

    /// Every declared mount, including ones whose source names no volume.
    pub fn all_mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Mounts whose source is the given volume name.
    pub fn mounts<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Mount> + 'a {
        self.mounts.iter().filter(move |m| m.source == source)
    }

    pub fn networks(&self) -> &[NetworkSpec] {
        &self.networks
    }
}

/// Builder for [`TaskDescriptor`].
#[derive(Debug, Clone)]
pub struct TaskDescriptorBuilder {
    inner: TaskDescriptor,
}

impl TaskDescriptorBuilder {
    fn new(task_id: TaskId, image: ImageRef) -> Self {
        Self {
            inner: TaskDescriptor {
                task_id,
                image,
                auth: None,
                env: TaskEnv::new(),
                command: Vec::new(),
                expose: Vec::new(),
                resources: Resources::default(),
                gpu_devices: Vec::new(),
                volumes: BTreeMap::new(),
                mounts: Vec::new(),
                networks: Vec::new(),
                cgroup_parent: String::new(),
                auto_remove: false,
                commit_on_stop: false,
            },
        }
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.inner.auth = Some(auth.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.env.push(key, value);
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn expose(mut self, port: impl Into<String>) -> Self {
        self.inner.expose.push(port.into());
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.inner.resources = resources;
        self
    }

    pub fn gpu(mut self, id: impl Into<GpuId>) -> Self {
        self.inner.gpu_devices.push(id.into());
        self
    }

    pub fn volume(mut self, name: impl Into<String>, spec: VolumeSpec) -> Self {
        self.inner.volumes.insert(name.into(), spec);
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.inner.mounts.push(mount);
        self
    }

    pub fn network(mut self, spec: NetworkSpec) -> Self {
        self.inner.networks.push(spec);
        self
    }

    pub fn cgroup_parent(mut self, parent: impl Into<String>) -> Self {
        self.inner.cgroup_parent = parent.into();
        self
    }

    pub fn auto_remove(mut self, on: bool) -> Self {
        self.inner.auto_remove = on;
        self
    }

    pub fn commit_on_stop(mut self, on: bool) -> Self {
        self.inner.commit_on_stop = on;
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MountMode;

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor::builder("task-1", "registry.local/app:1")
            .gpu("gpu-0")
            .volume("data", VolumeSpec::new("bind"))
            .mount(Mount::new("data", "/data", MountMode::ReadWrite))
            .mount(Mount::new("cache", "/cache", MountMode::ReadOnly))
            .mount(Mount::new("data", "/data-ro", MountMode::ReadOnly))
            .build()
    }

    #[test]
    fn gpu_view() {
        let d = descriptor();
        assert!(d.is_gpu_required());
        assert_eq!(d.gpu_device_ids(), &[GpuId::from("gpu-0")]);

        let plain = TaskDescriptor::builder("task-2", "app").build();
        assert!(!plain.is_gpu_required());
    }

    #[test]
    fn mounts_are_filtered_by_source() {
        let d = descriptor();
        let targets: Vec<_> = d.mounts("data").map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["/data", "/data-ro"]);
        assert_eq!(d.mounts("missing").count(), 0);
        assert_eq!(d.all_mounts().len(), 3);
    }

    #[test]
    fn serde_roundtrip_keeps_flags() {
        let d = TaskDescriptor::builder("task-3", "app")
            .commit_on_stop(true)
            .auto_remove(true)
            .build();

        let json = serde_json::to_string(&d).unwrap();
        let back: TaskDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(back.commit_on_stop());
    }
}
