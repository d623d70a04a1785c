use std::sync::Arc;

use async_trait::async_trait;

use super::{ErrorDomain, OwnerClient};
use crate::error::ServiceResult;
use crate::messages::Message;
use crate::payload::{SourceIdentifier, YangTextSource};
use crate::services::SchemaSourceProvider;

/// Fetches YANG sources from the owner on demand.
pub struct ProxySchemaSourceProvider {
    client: Arc<OwnerClient>,
}

impl ProxySchemaSourceProvider {
    pub(crate) fn new(client: Arc<OwnerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemaSourceProvider for ProxySchemaSourceProvider {
    async fn get_source(&self, id: &SourceIdentifier) -> ServiceResult<YangTextSource> {
        let request = Message::YangTextSchemaSourceRequest {
            source_id: id.clone(),
        };
        let owner = &self.client.owner;
        match self.client.ask(owner, request, ErrorDomain::Schema).await? {
            Message::YangTextSchemaSource(source) => Ok(source),
            other => Err(self.client.unexpected(ErrorDomain::Schema, "schema source request", &other)),
        }
    }
}
