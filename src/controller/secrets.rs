//! Pre-shared key secret propagation
//!
//! The key itself is generated by the group controller; the engine only
//! attaches ownership and copies it next to the volume when needed.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, instrument};

use super::handler::ReplicationHandler;
use super::meta::add_owner_reference;
use crate::error::{Error, Result};

impl ReplicationHandler {
    /// Returns `false` when the secret does not exist yet.
    #[instrument(skip(self), fields(namespace = %self.owner.namespace))]
    pub async fn ensure_secret(&self, name: &str) -> Result<bool> {
        let Some(secret) = self
            .client
            .get::<Secret>(Some(&self.owner.namespace), name)
            .await?
        else {
            info!(secret = name, "key secret not found, waiting for it to be generated");
            return Ok(false);
        };

        let mut owned = secret.clone();
        if add_owner_reference(&mut owned.metadata, self.owner.owner_reference(false)) {
            self.client.update(&owned).await?;
            debug!(secret = name, "added group owner to key secret");
        }
        Ok(true)
    }

    /// Copies the secret by value into `namespace` unless one of that name
    /// is already there.
    #[instrument(skip(self))]
    pub async fn copy_secret_to_namespace(&self, name: &str, namespace: &str) -> Result<()> {
        if self.client.get::<Secret>(Some(namespace), name).await?.is_some() {
            return Ok(());
        }

        let source = self
            .client
            .get::<Secret>(Some(&self.owner.namespace), name)
            .await?
            .ok_or_else(|| {
                Error::not_found("Secret", format!("{}/{}", self.owner.namespace, name))
            })?;

        let copy = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: source.metadata.labels.clone(),
                annotations: source.metadata.annotations.clone(),
                ..Default::default()
            },
            data: source.data.clone(),
            string_data: source.string_data.clone(),
            type_: source.type_.clone(),
            immutable: source.immutable,
        };
        self.client.create(&copy).await?;
        info!(secret = name, %namespace, "copied key secret");
        Ok(())
    }
}
