//! DynamoDB record store
//!
//! Table per aggregate scope with a configurable name prefix, keyed by
//! `id`, the record JSON carried in a `data` attribute. Tables are
//! provisioned out of band (deploy tooling), matching the other backends'
//! assumption that the storage location exists.

use crate::error::{BrokerError, Result};
use crate::storage::{RecordStore, StorageRegistry, AGGREGATE_SCOPES};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::types::AttributeValue;
use serde_json::Value;

pub struct DynamoRecordStore {
    client: aws_sdk_dynamodb::Client,
    table_prefix: String,
}

impl DynamoRecordStore {
    pub async fn connect(table_prefix: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::with_client(aws_sdk_dynamodb::Client::new(&sdk_config), table_prefix)
    }

    pub fn with_client(client: aws_sdk_dynamodb::Client, table_prefix: &str) -> Self {
        Self { client, table_prefix: table_prefix.to_string() }
    }

    fn table(&self, scope: &str) -> String {
        format!("{}{}", self.table_prefix, scope)
    }
}

fn dynamo_err(message: &str, e: impl std::error::Error + Send + Sync + 'static) -> BrokerError {
    BrokerError::Storage { message: message.to_string(), transient: true, source: Some(Box::new(e)) }
}

#[async_trait]
impl RecordStore for DynamoRecordStore {
    async fn put(&self, scope: &str, id: &str, record: Value) -> Result<()> {
        self.client
            .put_item()
            .table_name(self.table(scope))
            .item("id", AttributeValue::S(id.to_string()))
            .item("data", AttributeValue::S(record.to_string()))
            .send()
            .await
            .map_err(|e| dynamo_err("dynamodb put_item failed", e))?;
        Ok(())
    }

    async fn get(&self, scope: &str, id: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get_item()
            .table_name(self.table(scope))
            .key("id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| dynamo_err("dynamodb get_item failed", e))?;
        response
            .item()
            .and_then(|item| item.get("data"))
            .and_then(|attr| attr.as_s().ok())
            .map(|data| serde_json::from_str(data).map_err(BrokerError::from))
            .transpose()
    }

    async fn all(&self, scope: &str) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        let mut paginator = self
            .client
            .scan()
            .table_name(self.table(scope))
            .into_paginator()
            .items()
            .send();
        while let Some(item) = paginator.next().await {
            let item = item.map_err(|e| dynamo_err("dynamodb scan failed", e))?;
            if let Some(data) = item.get("data").and_then(|attr| attr.as_s().ok()) {
                records.push(serde_json::from_str(data)?);
            }
        }
        Ok(records)
    }

    async fn delete(&self, scope: &str, id: &str) -> Result<bool> {
        let response = self
            .client
            .delete_item()
            .table_name(self.table(scope))
            .key("id", AttributeValue::S(id.to_string()))
            .return_values(aws_sdk_dynamodb::types::ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| dynamo_err("dynamodb delete_item failed", e))?;
        Ok(response.attributes().is_some())
    }
}

pub async fn register_dynamodb_storage(registry: &StorageRegistry) -> Result<()> {
    registry
        .register(
            "dynamodb",
            AGGREGATE_SCOPES.to_vec(),
            Box::new(|config| {
                Box::pin(async move {
                    Ok(std::sync::Arc::new(
                        DynamoRecordStore::connect(&config.dynamodb_table_prefix).await,
                    ) as _)
                })
            }),
        )
        .await;
    Ok(())
}
