use super::{CloudApiConnector, Operation};
use crate::throttler::Throttler;
use crate::types::{CloudInstance, ImageDetails, InstanceUserData, Subscription};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// Typed connector that sends every call through a credential identity's throttler.
#[derive(Debug, Clone)]
pub struct ThrottledConnector {
    throttler: Arc<Throttler>,
}

impl ThrottledConnector {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self { throttler }
    }

    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    async fn call<T: DeserializeOwned>(&self, operation: Operation, params: Value) -> Result<T> {
        let value = self.throttler.execute_task(operation, params).await?;
        serde_json::from_value(value).map_err(|e| {
            Error::fatal(format!("malformed provider response: {}", e)).with_context(
                ErrorContext::new()
                    .with_operation(operation.name())
                    .with_source("connector"),
            )
        })
    }

    fn instance_params(instance: &CloudInstance) -> Value {
        json!({
            "image_id": instance.image_id,
            "instance_id": instance.id,
        })
    }
}

#[async_trait]
impl CloudApiConnector for ThrottledConnector {
    async fn fetch_instances(&self, image: &ImageDetails) -> Result<Vec<CloudInstance>> {
        let params = json!({
            "image_id": image.id,
            "image": serde_json::to_value(image)?,
        });
        self.call(Operation::ListInstances, params).await
    }

    async fn describe_instance(
        &self,
        image_id: &str,
        instance_id: &str,
    ) -> Result<Option<CloudInstance>> {
        let params = json!({
            "image_id": image_id,
            "instance_id": instance_id,
        });
        self.call(Operation::DescribeInstance, params).await
    }

    async fn start_instance(
        &self,
        image: &ImageDetails,
        user_data: &InstanceUserData,
    ) -> Result<CloudInstance> {
        let params = json!({
            "image_id": image.id,
            "image": serde_json::to_value(image)?,
            "user_data": serde_json::to_value(user_data)?,
        });
        self.call(Operation::StartInstance, params).await
    }

    async fn restart_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.throttler
            .execute_task(Operation::RestartInstance, Self::instance_params(instance))
            .await
            .map(|_| ())
    }

    async fn terminate_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.throttler
            .execute_task(Operation::TerminateInstance, Self::instance_params(instance))
            .await
            .map(|_| ())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.call(Operation::ListSubscriptions, json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneConfig, ThrottlerConfig};
    use crate::connector::InMemoryProvider;
    use crate::types::InstanceStatus;

    fn connector(provider: Arc<InMemoryProvider>) -> ThrottledConnector {
        let config = ThrottlerConfig::new().with_action(LaneConfig::new(2));
        let throttler = Throttler::new("test", config, provider);
        throttler.start().unwrap();
        ThrottledConnector::new(Arc::new(throttler))
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let provider = Arc::new(InMemoryProvider::new());
        let connector = connector(provider.clone());
        let image = ImageDetails::new("img-a").with_max_instances(2);

        assert!(connector.fetch_instances(&image).await.unwrap().is_empty());

        let started = connector
            .start_instance(&image, &InstanceUserData::new().with_agent_name("agent-1"))
            .await
            .unwrap();
        assert_eq!(started.image_id, "img-a");

        let listed = connector.fetch_instances(&image).await.unwrap();
        assert_eq!(listed, vec![started.clone()]);

        connector.restart_instance(&started).await.unwrap();
        let described = connector
            .describe_instance("img-a", &started.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(described.status, InstanceStatus::Restarting);

        connector.terminate_instance(&started).await.unwrap();
        assert!(connector
            .describe_instance("img-a", &started.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn subscriptions_are_listed_through_read_lane() {
        let provider = Arc::new(
            InMemoryProvider::new().with_subscriptions(vec![Subscription::new("sub-1", "Dev")]),
        );
        let connector = connector(provider.clone());
        let subs = connector.list_subscriptions().await.unwrap();
        assert_eq!(subs, vec![Subscription::new("sub-1", "Dev")]);

        let signals = connector.throttler().signals().await;
        assert_eq!(signals.read.completed, 1);
        assert_eq!(signals.action.dispatched, 0);
    }
}
