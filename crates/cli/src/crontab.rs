//! CronTab reconciliation: validate the spec of a cached CronTab and report it.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kube::core::DynamicObject;
use metrics::counter;
use recon_controller::Reconciler;
use recon_core::ObjectKey;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTabSpec {
    pub cron_spec: String,
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

fn default_replicas() -> i32 { 1 }

impl CronTabSpec {
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let spec = obj.data.get("spec").ok_or_else(|| anyhow!("object has no spec"))?;
        let parsed: CronTabSpec = serde_json::from_value(spec.clone()).context("decoding crontab spec")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        let fields = self.cron_spec.split_whitespace().count();
        if fields != 5 {
            return Err(anyhow!("cronSpec {:?} has {} fields, expected 5", self.cron_spec, fields));
        }
        if self.image.trim().is_empty() {
            return Err(anyhow!("image must not be empty"));
        }
        if self.replicas < 0 {
            return Err(anyhow!("replicas must not be negative (got {})", self.replicas));
        }
        Ok(())
    }
}

/// Reports each CronTab's desired state. Read-only, so repeated calls are harmless.
pub struct CronTabReconciler;

#[async_trait::async_trait]
impl Reconciler for CronTabReconciler {
    async fn reconcile(&self, key: &ObjectKey, obj: Arc<DynamicObject>) -> Result<()> {
        let spec = CronTabSpec::from_object(&obj).with_context(|| format!("crontab {}", key))?;
        counter!("crontab_reconciled_total", 1u64);
        info!(
            key = %key,
            rv = ?obj.metadata.resource_version,
            schedule = %spec.cron_spec,
            image = %spec.image,
            replicas = spec.replicas,
            "crontab processed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn crontab(spec: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta { name: Some("c".into()), namespace: Some("ns".into()), ..Default::default() },
            data: serde_json::json!({ "spec": spec }),
        }
    }

    #[test]
    fn parses_valid_spec_with_default_replicas() {
        let obj = crontab(serde_json::json!({ "cronSpec": "* * * * */5", "image": "my-cron-image" }));
        let spec = CronTabSpec::from_object(&obj).expect("valid");
        assert_eq!(spec.cron_spec, "* * * * */5");
        assert_eq!(spec.replicas, 1);
    }

    #[test]
    fn rejects_bad_schedule_and_missing_fields() {
        assert!(CronTabSpec::from_object(&crontab(serde_json::json!({ "cronSpec": "* *", "image": "x" }))).is_err());
        assert!(CronTabSpec::from_object(&crontab(serde_json::json!({ "image": "x" }))).is_err());
        assert!(CronTabSpec::from_object(&crontab(serde_json::json!({ "cronSpec": "* * * * *", "image": " " }))).is_err());
        let no_spec = DynamicObject { types: None, metadata: ObjectMeta::default(), data: serde_json::json!({}) };
        assert!(CronTabSpec::from_object(&no_spec).is_err());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_for_a_stable_object() {
        let obj = Arc::new(crontab(serde_json::json!({ "cronSpec": "0 * * * *", "image": "busybox", "replicas": 2 })));
        let key = ObjectKey::new(Some("ns"), "c");
        for _ in 0..3 {
            CronTabReconciler.reconcile(&key, Arc::clone(&obj)).await.expect("ok");
        }
    }
}
