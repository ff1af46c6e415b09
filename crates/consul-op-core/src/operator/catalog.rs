//! Catalog reader. Results are passed through from the backend uncached.

use std::collections::HashMap;

use super::Operator;
use crate::{backend::CatalogService, Result};

impl Operator {
    /// Every registered instance of `name`.
    pub async fn list_service(&self, name: &str) -> Result<Vec<CatalogService>> {
        let instances = self.backend()?.catalog_service(name).await?;
        tracing::debug!("Catalog has {} instance(s) of '{name}'", instances.len());
        Ok(instances)
    }

    /// Every known service name with its tags.
    pub async fn list_services(&self) -> Result<HashMap<String, Vec<String>>> {
        self.backend()?.catalog_services().await
    }
}
