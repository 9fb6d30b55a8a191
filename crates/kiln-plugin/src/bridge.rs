//! Engine-managed bridge networks.
//!
//! Setup is a sequence of reversible steps run through an [`ActionQueue`], so a
//! failing step undoes the ones before it and the queue itself becomes the cleanup.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::action::ActionQueue;
use kiln_core::runtime::{ContainerRuntime, EndpointSettings, HostConfig, NetworkCreate, NetworkingConfig};
use kiln_core::{Action, Cleanup, CoreError, NetworkTuner};
use kiln_model::NetworkSpec;
use tracing::{debug, info, warn};

/// Linux interface names are limited to 15 bytes.
const BRIDGE_NAME_MAX: usize = 15;

/// Driver options carrying the requested rate limits, in bits per second.
pub const EGRESS_OPTION: &str = "kiln.rate-limit.egress";
pub const INGRESS_OPTION: &str = "kiln.rate-limit.ingress";

pub struct BridgeTuner {
    runtime: Arc<dyn ContainerRuntime>,
    label: String,
}

impl BridgeTuner {
    /// Networks are labeled with `label` so that they can be told apart from foreign ones.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, label: impl Into<String>) -> Self {
        Self {
            runtime,
            label: label.into(),
        }
    }

    fn create_action(&self, spec: &NetworkSpec) -> CreateNetwork {
        let name = network_name(&spec.net_id);

        let mut labels = BTreeMap::new();
        labels.insert(self.label.clone(), String::new());

        let mut options = spec.options.clone();
        options.insert("com.docker.network.bridge.name".into(), bridge_name(&spec.net_id));

        CreateNetwork {
            runtime: self.runtime.clone(),
            request: NetworkCreate {
                name: name.clone(),
                driver: "bridge".into(),
                labels,
                options,
                subnet: spec.subnet.clone(),
            },
            id: None,
            name,
        }
    }
}

/// Engine network name for a deal network id.
pub fn network_name(net_id: &str) -> String {
    format!("kiln-{net_id}")
}

fn bridge_name(net_id: &str) -> String {
    const PREFIX: &str = "kb-";
    let suffix: String = net_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(BRIDGE_NAME_MAX - PREFIX.len())
        .collect();
    format!("{PREFIX}{suffix}")
}

/// Creates an engine network; rollback removes it.
struct CreateNetwork {
    runtime: Arc<dyn ContainerRuntime>,
    request: NetworkCreate,
    name: String,
    id: Option<String>,
}

impl CreateNetwork {
    /// A network known to exist already, addressed by name.
    fn existing(runtime: Arc<dyn ContainerRuntime>, net_id: &str) -> Self {
        let name = network_name(net_id);
        Self {
            runtime,
            request: NetworkCreate::default(),
            id: Some(name.clone()),
            name,
        }
    }
}

#[async_trait]
impl Action for CreateNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) -> Result<(), CoreError> {
        let id = self.runtime.network_create(&self.request).await?;
        info!(target: "kiln.plugin.bridge", network = %self.name, id = %id, "network created");
        self.id = Some(id);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), CoreError> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        debug!(target: "kiln.plugin.bridge", network = %self.name, "removing network");
        Ok(self.runtime.network_remove(&id).await?)
    }
}

#[async_trait]
impl NetworkTuner for BridgeTuner {
    async fn tune(
        &self,
        spec: &NetworkSpec,
        _host: &mut HostConfig,
        net: &mut NetworkingConfig,
    ) -> Result<Box<dyn Cleanup>, CoreError> {
        let action = self.create_action(spec);
        let name = action.name.clone();

        let mut queue = ActionQueue::new();
        if let Err(aborted) = queue.execute(Box::new(action)).await {
            for e in aborted.rollback.iter() {
                warn!(target: "kiln.plugin.bridge", error = %e, "rollback of network setup failed");
            }
            return Err(aborted.into_cause());
        }

        let mut driver_options = BTreeMap::new();
        if spec.rate_limit_egress > 0 {
            driver_options.insert(EGRESS_OPTION.to_string(), spec.rate_limit_egress.to_string());
        }
        if spec.rate_limit_ingress > 0 {
            driver_options.insert(INGRESS_OPTION.to_string(), spec.rate_limit_ingress.to_string());
        }
        net.endpoints.insert(
            name.clone(),
            EndpointSettings {
                network_id: name,
                aliases: Vec::new(),
                driver_options,
            },
        );

        Ok(Box::new(queue.into_cleanup()))
    }

    async fn cleaner(&self, net_id: &str) -> Result<Box<dyn Cleanup>, CoreError> {
        let action: Box<dyn Action> = Box::new(CreateNetwork::existing(self.runtime.clone(), net_id));
        Ok(Box::new(ActionQueue::completed(vec![action]).into_cleanup()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::testing::FakeRuntime;

    #[test]
    fn bridge_name_fits_interface_limit() {
        assert_eq!(bridge_name("deal-42"), "kb-deal42");
        assert_eq!(bridge_name("0123456789abcdef0123").len(), BRIDGE_NAME_MAX);
    }

    #[tokio::test]
    async fn tune_creates_network_and_cleanup_removes_it() {
        let runtime = FakeRuntime::new();
        let tuner = BridgeTuner::new(runtime.clone(), "kiln.overseer");
        let mut spec = NetworkSpec::new("bridge", "net-1");
        spec.rate_limit_egress = 1_000_000;
        let mut net = NetworkingConfig::default();

        let cleanup = tuner.tune(&spec, &mut HostConfig::default(), &mut net).await.unwrap();

        let endpoint = &net.endpoints["kiln-net-1"];
        assert_eq!(endpoint.network_id, "kiln-net-1");
        assert_eq!(endpoint.driver_options[EGRESS_OPTION], "1000000");
        assert!(!endpoint.driver_options.contains_key(INGRESS_OPTION));

        cleanup.close().await.unwrap();
        cleanup.close().await.unwrap();
        assert_eq!(
            runtime.calls(),
            vec!["network.create:kiln-net-1", "network.remove:net-kiln-net-1"]
        );
    }

    #[tokio::test]
    async fn failed_creation_leaves_nothing() {
        let runtime = FakeRuntime::new();
        runtime.fail("network.create");
        let tuner = BridgeTuner::new(runtime.clone(), "kiln.overseer");
        let mut net = NetworkingConfig::default();

        let err = tuner
            .tune(&NetworkSpec::new("bridge", "net-1"), &mut HostConfig::default(), &mut net)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, CoreError::Runtime(_)));
        assert!(net.endpoints.is_empty());
        assert_eq!(runtime.calls(), vec!["network.create:kiln-net-1"]);
    }

    #[tokio::test]
    async fn cleaner_removes_network_by_name() {
        let runtime = FakeRuntime::new();
        let tuner = BridgeTuner::new(runtime.clone(), "kiln.overseer");

        tuner.cleaner("net-7").await.unwrap().close().await.unwrap();
        assert_eq!(runtime.calls(), vec!["network.remove:kiln-net-7"]);
    }
}
