use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_model::{NetworkKind, NetworkSpec, TaskDescriptor};
use tracing::{debug, instrument};

use super::{NetworkTuner, Tune, rollback};
use crate::cleanup::{Cleanup, NestedCleanup};
use crate::error::{ConfigError, CoreError};
use crate::runtime::{HostConfig, NetworkingConfig};

/// Network stage: attaches the container to every requested network.
#[derive(Default, Clone)]
pub struct NetworkTuning {
    tuners: BTreeMap<NetworkKind, Arc<dyn NetworkTuner>>,
}

impl NetworkTuning {
    pub(crate) fn new(tuners: BTreeMap<NetworkKind, Arc<dyn NetworkTuner>>) -> Self {
        Self { tuners }
    }

    pub(crate) fn tuner(&self, spec: &NetworkSpec) -> Result<Arc<dyn NetworkTuner>, CoreError> {
        spec.kind
            .parse::<NetworkKind>()
            .ok()
            .and_then(|kind| self.tuners.get(&kind).cloned())
            .ok_or_else(|| ConfigError::UnsupportedNetwork(spec.kind.clone()).into())
    }

    pub(crate) async fn cleanup_for(&self, descriptor: &TaskDescriptor) -> Result<NestedCleanup, CoreError> {
        let cleanup = NestedCleanup::new();
        for spec in descriptor.networks() {
            let tuner = self.tuner(spec)?;
            cleanup.add(tuner.cleaner(&spec.net_id).await?);
        }
        Ok(cleanup)
    }
}

#[async_trait]
impl Tune for NetworkTuning {
    #[instrument(level = "debug", target = "kiln.tune", skip_all, fields(task = %descriptor.task_id()))]
    async fn tune(
        &self,
        descriptor: &TaskDescriptor,
        host: &mut HostConfig,
        net: &mut NetworkingConfig,
    ) -> Result<Box<dyn Cleanup>, CoreError> {
        let tuners = descriptor
            .networks()
            .iter()
            .map(|spec| self.tuner(spec).map(|t| (spec, t)))
            .collect::<Result<Vec<_>, _>>()?;

        let cleanup = NestedCleanup::new();
        for (spec, tuner) in tuners {
            debug!(target: "kiln.tune", net_id = %spec.net_id, kind = %spec.kind, "attaching network");
            match tuner.tune(spec, host, net).await {
                Ok(c) => cleanup.add(c),
                Err(e) => {
                    rollback("network", &cleanup).await;
                    return Err(e);
                }
            }
        }

        Ok(Box::new(cleanup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeNetworkTuner, Journal};

    #[tokio::test]
    async fn failed_network_releases_the_ones_before_it() {
        let journal = Journal::new();
        let mut tuners: BTreeMap<NetworkKind, Arc<dyn NetworkTuner>> = BTreeMap::new();
        tuners.insert(NetworkKind::Tinc, Arc::new(FakeNetworkTuner::failing_on(&journal, "net-2")));
        let stage = NetworkTuning::new(tuners);
        let descriptor = TaskDescriptor::builder("t1", "app:1")
            .network(NetworkSpec::new("tinc", "net-1"))
            .network(NetworkSpec::new("tinc", "net-2"))
            .build();
        let mut net = NetworkingConfig::default();

        let err = stage
            .tune(&descriptor, &mut HostConfig::default(), &mut net)
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Unavailable(ref msg) if msg == "net-2 is down"));
        assert_eq!(
            journal.entries(),
            vec!["network.tune:net-1", "network.tune:net-2", "network.remove:net-1"]
        );
    }

    #[tokio::test]
    async fn unknown_network_kind_attaches_nothing() {
        let journal = Journal::new();
        let mut tuners: BTreeMap<NetworkKind, Arc<dyn NetworkTuner>> = BTreeMap::new();
        tuners.insert(NetworkKind::Tinc, Arc::new(FakeNetworkTuner::new(&journal)));
        let stage = NetworkTuning::new(tuners);
        let descriptor = TaskDescriptor::builder("t1", "app:1")
            .network(NetworkSpec::new("tinc", "net-1"))
            .network(NetworkSpec::new("carrier-pigeon", "net-2"))
            .build();

        let err = stage
            .tune(&descriptor, &mut HostConfig::default(), &mut NetworkingConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Config(ConfigError::UnsupportedNetwork(_))));
        assert!(journal.entries().is_empty());
    }
}
