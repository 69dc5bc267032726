//! Post-discovery enrichment pipeline.
//!
//! A fixed ordered sequence of stages, each a trait object, run over every
//! discovered device with a bounded pool of concurrent `tokio` workers.
//! A failing stage is captured per-device and never aborts the pipeline;
//! results are placed back at each device's original index so batch order
//! is preserved regardless of which device finishes enrichment first.

pub mod banner;
pub mod classifier;
pub mod coap_resource;
pub mod fingerprint;
pub mod mdns_txt;
pub mod mqtt_broker;
pub mod upnp_xml;
pub mod wsd_scope;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::model::DeviceInfo;

/// A single enrichment stage. `can_enrich` is a cheap synchronous gate;
/// `enrich` does the (possibly blocking-on-IO) work and returns an error
/// describing what went wrong. Errors are captured per-device and never
/// abort the pipeline.
#[async_trait::async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_enrich(&self, device: &DeviceInfo) -> bool;
    async fn enrich(&self, device: &mut DeviceInfo, timeout: Duration) -> anyhow::Result<()>;
}

pub const DEFAULT_MAX_WORKERS: usize = 10;

pub struct EnrichmentPipeline {
    stages: Vec<Arc<dyn Enricher>>,
    max_workers: usize,
}

impl EnrichmentPipeline {
    pub fn new(max_workers: usize) -> Self {
        Self {
            stages: Vec::new(),
            max_workers,
        }
    }

    /// Builds the pipeline with the fixed default stage ordering: UPnP deep
    /// enrichment, mDNS TXT mapping, WSD scope parsing, MQTT broker
    /// fingerprinting, CoAP resource classification, OS fingerprinting from
    /// headers/banners, banner grabbing, then the taxonomy classifier last.
    pub fn default_pipeline() -> Self {
        let mut pipeline = Self::new(DEFAULT_MAX_WORKERS);
        pipeline
            .register(Arc::new(upnp_xml::UpnpDeepEnricher))
            .register(Arc::new(mdns_txt::MdnsTxtEnricher))
            .register(Arc::new(wsd_scope::WsdMetadataEnricher))
            .register(Arc::new(mqtt_broker::MqttBrokerEnricher))
            .register(Arc::new(coap_resource::CoapResourceEnricher))
            .register(Arc::new(fingerprint::ServerHeaderFingerprinter))
            .register(Arc::new(banner::BannerGrabber::default()))
            .register(Arc::new(classifier::DeviceClassifier));
        pipeline
    }

    pub fn register(&mut self, stage: Arc<dyn Enricher>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Runs every stage against a single device, in order. A stage's error
    /// is captured into `enrichment_errors` and the loop moves on to the
    /// next stage with the device as it stood before the failing call.
    pub async fn enrich_device(&self, mut device: DeviceInfo, per_device_timeout: Duration) -> DeviceInfo {
        for stage in &self.stages {
            if !stage.can_enrich(&device) {
                continue;
            }
            if let Err(err) = stage.enrich(&mut device, per_device_timeout).await {
                device.enrichment_errors.push(format!("{}: {err:#}", stage.name()));
            }
        }
        device
    }

    /// Runs `enrich_device` over every device with at most `max_workers`
    /// concurrent workers, preserving input order in the output.
    pub async fn enrich_all(&self, devices: Vec<DeviceInfo>, per_device_timeout: Duration) -> Vec<DeviceInfo> {
        if devices.is_empty() {
            return devices;
        }
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = FuturesUnordered::new();

        for (idx, device) in devices.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let enriched = self.enrich_device(device, per_device_timeout).await;
                (idx, enriched)
            });
        }

        let mut ordered: Vec<Option<DeviceInfo>> = Vec::new();
        while let Some((idx, device)) = tasks.next().await {
            if ordered.len() <= idx {
                ordered.resize_with(idx + 1, || None);
            }
            ordered[idx] = Some(device);
        }

        ordered.into_iter().map(|d| d.expect("every index filled")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolTag;

    struct AlwaysTagStage;

    #[async_trait::async_trait]
    impl Enricher for AlwaysTagStage {
        fn name(&self) -> &'static str {
            "always_tag"
        }
        fn can_enrich(&self, _device: &DeviceInfo) -> bool {
            true
        }
        async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
            device.add_tag("tagged");
            Ok(())
        }
    }

    struct FailingStage;

    #[async_trait::async_trait]
    impl Enricher for FailingStage {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn can_enrich(&self, _device: &DeviceInfo) -> bool {
            true
        }
        async fn enrich(&self, _device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn stage_failure_is_captured_and_pipeline_continues() {
        let mut pipeline = EnrichmentPipeline::new(2);
        pipeline.register(Arc::new(FailingStage)).register(Arc::new(AlwaysTagStage));

        let device = DeviceInfo::new(ProtocolTag::Upnp, "10.0.0.5");
        let result = pipeline.enrich_device(device, Duration::from_secs(1)).await;

        assert!(result.enrichment_errors.iter().any(|e| e.contains("failing")));
        assert!(result.device_tags.contains(&"tagged".to_string()));
    }

    #[tokio::test]
    async fn enrich_all_preserves_input_order() {
        let pipeline = EnrichmentPipeline::new(4);
        let devices: Vec<DeviceInfo> = (0..5)
            .map(|i| DeviceInfo::new(ProtocolTag::Mdns, format!("10.0.0.{i}")))
            .collect();
        let results = pipeline.enrich_all(devices, Duration::from_millis(100)).await;
        let addrs: Vec<String> = results.iter().map(|d| d.address.clone()).collect();
        assert_eq!(
            addrs,
            vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
        );
    }
}
