//! Amazon DynamoDB gateway.
//!
//! Items are converted between JSON maps and attribute maps with
//! `serde_dynamo`. Key and projection expressions always go through
//! `#name` placeholders because `date` is a reserved word.
//! Table waiters poll `DescribeTable`.

use crate::gateway::{
    BatchWriteOutput, BoxFuture, Page, PageCursor, QueryRequest, StoreError, StoreGateway,
    StoreResult, TableSchema, WriteRequest,
};
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, DeleteRequest, GlobalSecondaryIndex, KeySchemaElement,
    KeyType, Projection, ProjectionType, ProvisionedThroughput, PutRequest, ScalarAttributeType,
    TableStatus, WriteRequest as DynamoWriteRequest,
};
use aws_sdk_dynamodb::Client;
use datawell_core::{Item, ItemKey, DATE_FIELD, SYMBOL_FIELD};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

type AttributeMap = HashMap<String, AttributeValue>;

const RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";
const SERIALIZATION: &str = "SerializationException";
const WAITER_TIMEOUT: &str = "WaiterTimeout";

const WAITER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WAITER_MAX_POLLS: u32 = 60;

/// DynamoDB-backed `StoreGateway`.
#[derive(Clone)]
pub struct DynamoStore {
    client: Client,
    /// Items per query/scan page; `None` lets the service decide (1 MB pages).
    page_size: Option<i32>,
}

impl DynamoStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            page_size: None,
        }
    }

    /// Build a client from the default AWS credential chain.
    ///
    /// `endpoint_url` points the client at a local DynamoDB.
    pub async fn connect(region: Option<&str>, endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_dynamodb::config::Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&sdk_config);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url);
        }
        info!(?region, ?endpoint_url, "DynamoDB client configured");
        Self::new(Client::from_conf(builder.build()))
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = i32::try_from(page_size).ok().filter(|n| *n > 0);
        self
    }

    async fn describe_status(&self, table: &str) -> StoreResult<Option<TableStatus>> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(output) => Ok(output.table.and_then(|t| t.table_status)),
            Err(err) if err.code() == Some(RESOURCE_NOT_FOUND) => Ok(None),
            Err(err) => Err(sdk_error(err)),
        }
    }

    async fn send_batch(&self, table: &str, requests: &[WriteRequest]) -> StoreResult<BatchWriteOutput> {
        let writes = requests
            .iter()
            .map(to_dynamo_request)
            .collect::<StoreResult<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(table, writes)
            .send()
            .await
            .map_err(sdk_error)?;

        let mut unprocessed = Vec::new();
        for writes in output.unprocessed_items.unwrap_or_default().into_values() {
            for write in writes {
                unprocessed.push(from_dynamo_request(write)?);
            }
        }
        Ok(BatchWriteOutput { unprocessed })
    }

    async fn run_query(&self, table: &str, request: QueryRequest) -> StoreResult<Page> {
        let condition = &request.key_condition;
        let mut key_expression = "#pk = :pk".to_string();
        let mut builder = self
            .client
            .query()
            .table_name(table)
            .set_index_name(request.index.clone())
            .set_limit(self.page_size)
            .expression_attribute_names("#pk", condition.partition.attribute.as_str())
            .expression_attribute_values(":pk", AttributeValue::S(condition.partition.value.clone()));

        if let Some(sort) = &condition.sort {
            key_expression.push_str(" AND #sk = :sk");
            builder = builder
                .expression_attribute_names("#sk", sort.attribute.as_str())
                .expression_attribute_values(":sk", AttributeValue::S(sort.value.clone()));
        }

        if let Some(attributes) = &request.projection {
            let mut placeholders = Vec::with_capacity(attributes.len());
            for (i, attribute) in attributes.iter().enumerate() {
                let placeholder = format!("#p{i}");
                builder = builder.expression_attribute_names(placeholder.as_str(), attribute.as_str());
                placeholders.push(placeholder);
            }
            builder = builder.projection_expression(placeholders.join(", "));
        }

        let start_key = request.cursor.map(cursor_to_key).transpose()?;
        let output = builder
            .key_condition_expression(key_expression)
            .set_exclusive_start_key(start_key)
            .send()
            .await
            .map_err(sdk_error)?;

        to_page(output.items, output.last_evaluated_key)
    }

    async fn run_scan(&self, table: &str, cursor: Option<PageCursor>) -> StoreResult<Page> {
        let start_key = cursor.map(cursor_to_key).transpose()?;
        let output = self
            .client
            .scan()
            .table_name(table)
            .set_limit(self.page_size)
            .set_exclusive_start_key(start_key)
            .send()
            .await
            .map_err(sdk_error)?;

        to_page(output.items, output.last_evaluated_key)
    }

    async fn run_create_table(&self, schema: &TableSchema) -> StoreResult<()> {
        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(schema.read_capacity_units)
            .write_capacity_units(schema.write_capacity_units)
            .build()
            .map_err(build_error)?;

        let index = GlobalSecondaryIndex::builder()
            .index_name(&schema.index.name)
            .key_schema(key_element(&schema.index.partition_key, KeyType::Hash)?)
            .key_schema(key_element(&schema.index.sort_key, KeyType::Range)?)
            .projection(Projection::builder().projection_type(ProjectionType::All).build())
            .provisioned_throughput(throughput.clone())
            .build()
            .map_err(build_error)?;

        self.client
            .create_table()
            .table_name(&schema.table_name)
            .attribute_definitions(string_attribute(&schema.partition_key)?)
            .attribute_definitions(string_attribute(&schema.sort_key)?)
            .key_schema(key_element(&schema.partition_key, KeyType::Hash)?)
            .key_schema(key_element(&schema.sort_key, KeyType::Range)?)
            .global_secondary_indexes(index)
            .provisioned_throughput(throughput)
            .send()
            .await
            .map_err(sdk_error)?;

        info!(table = %schema.table_name, "CreateTable accepted");
        Ok(())
    }

    async fn poll_until<F>(&self, table: &str, done: F) -> StoreResult<()>
    where
        F: Fn(Option<&TableStatus>) -> bool,
    {
        for poll in 1..=WAITER_MAX_POLLS {
            let status = self.describe_status(table).await?;
            if done(status.as_ref()) {
                return Ok(());
            }
            debug!(%table, poll, ?status, "Waiting for table status");
            tokio::time::sleep(WAITER_POLL_INTERVAL).await;
        }
        Err(StoreError::fatal(
            WAITER_TIMEOUT,
            format!("table {table} did not reach the expected state"),
        ))
    }
}

impl StoreGateway for DynamoStore {
    fn batch_write<'a>(
        &'a self,
        table: &'a str,
        requests: &'a [WriteRequest],
    ) -> BoxFuture<'a, StoreResult<BatchWriteOutput>> {
        Box::pin(self.send_batch(table, requests))
    }

    fn query<'a>(&'a self, table: &'a str, request: QueryRequest) -> BoxFuture<'a, StoreResult<Page>> {
        Box::pin(self.run_query(table, request))
    }

    fn scan<'a>(
        &'a self,
        table: &'a str,
        cursor: Option<PageCursor>,
    ) -> BoxFuture<'a, StoreResult<Page>> {
        Box::pin(self.run_scan(table, cursor))
    }

    fn delete_item<'a>(&'a self, table: &'a str, key: ItemKey) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.client
                .delete_item()
                .table_name(table)
                .key(SYMBOL_FIELD, AttributeValue::S(key.symbol))
                .key(DATE_FIELD, AttributeValue::S(key.date))
                .send()
                .await
                .map_err(sdk_error)?;
            Ok(())
        })
    }

    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { Ok(self.describe_status(table).await?.is_some()) })
    }

    fn create_table<'a>(&'a self, schema: &'a TableSchema) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(self.run_create_table(schema))
    }

    fn drop_table<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.client
                .delete_table()
                .table_name(table)
                .send()
                .await
                .map_err(sdk_error)?;
            info!(%table, "DeleteTable accepted");
            Ok(())
        })
    }

    fn wait_until_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(self.poll_until(table, |status| status == Some(&TableStatus::Active)))
    }

    fn wait_until_not_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(self.poll_until(table, |status| status.is_none()))
    }
}

fn sdk_error<E>(err: E) -> StoreError
where
    E: ProvideErrorMetadata + fmt::Display,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    StoreError::from_code(code, message)
}

fn build_error(err: aws_sdk_dynamodb::error::BuildError) -> StoreError {
    StoreError::fatal("BuildError", err.to_string())
}

fn conversion_error(err: serde_dynamo::Error) -> StoreError {
    StoreError::fatal(SERIALIZATION, err.to_string())
}

fn to_attributes(item: &Item) -> StoreResult<AttributeMap> {
    serde_dynamo::to_item(item).map_err(conversion_error)
}

fn from_attributes(attributes: AttributeMap) -> StoreResult<Item> {
    serde_dynamo::from_item(attributes).map_err(conversion_error)
}

fn key_attributes(key: &ItemKey) -> AttributeMap {
    HashMap::from([
        (SYMBOL_FIELD.to_string(), AttributeValue::S(key.symbol.clone())),
        (DATE_FIELD.to_string(), AttributeValue::S(key.date.clone())),
    ])
}

fn cursor_to_key(cursor: PageCursor) -> StoreResult<AttributeMap> {
    to_attributes(cursor.as_item())
}

fn to_page(items: Option<Vec<AttributeMap>>, last_key: Option<AttributeMap>) -> StoreResult<Page> {
    let items = items
        .unwrap_or_default()
        .into_iter()
        .map(from_attributes)
        .collect::<StoreResult<Vec<_>>>()?;
    let cursor = match last_key {
        Some(key) if !key.is_empty() => Some(PageCursor::new(from_attributes(key)?)),
        _ => None,
    };
    Ok(Page { items, cursor })
}

fn to_dynamo_request(request: &WriteRequest) -> StoreResult<DynamoWriteRequest> {
    let write = match request {
        WriteRequest::Put(item) => {
            let put = PutRequest::builder()
                .set_item(Some(to_attributes(item)?))
                .build()
                .map_err(build_error)?;
            DynamoWriteRequest::builder().put_request(put).build()
        }
        WriteRequest::Delete(key) => {
            let delete = DeleteRequest::builder()
                .set_key(Some(key_attributes(key)))
                .build()
                .map_err(build_error)?;
            DynamoWriteRequest::builder().delete_request(delete).build()
        }
    };
    Ok(write)
}

fn from_dynamo_request(write: DynamoWriteRequest) -> StoreResult<WriteRequest> {
    if let Some(put) = write.put_request {
        return Ok(WriteRequest::Put(from_attributes(put.item)?));
    }
    if let Some(delete) = write.delete_request {
        let key = from_attributes(delete.key)?;
        return ItemKey::from_item(&key)
            .map(WriteRequest::Delete)
            .ok_or_else(|| StoreError::fatal(SERIALIZATION, "unprocessed delete has no key"));
    }
    Err(StoreError::fatal(SERIALIZATION, "empty unprocessed write request"))
}

fn key_element(attribute: &str, key_type: KeyType) -> StoreResult<KeySchemaElement> {
    KeySchemaElement::builder()
        .attribute_name(attribute)
        .key_type(key_type)
        .build()
        .map_err(build_error)
}

fn string_attribute(attribute: &str) -> StoreResult<AttributeDefinition> {
    AttributeDefinition::builder()
        .attribute_name(attribute)
        .attribute_type(ScalarAttributeType::S)
        .build()
        .map_err(build_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datawell_core::StoredItem;
    use serde_json::json;

    #[test]
    fn test_put_request_conversion_keeps_document() {
        let document = match json!({"symbol": "AAE", "date": "2017-10-12", "quote": {"last": "3.1"}}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let request = WriteRequest::put(StoredItem::from_document(document).unwrap());

        let dynamo = to_dynamo_request(&request).unwrap();
        let item = &dynamo.put_request.as_ref().unwrap().item;
        assert_eq!(item.get("symbol"), Some(&AttributeValue::S("AAE".to_string())));
        assert!(matches!(item.get("document"), Some(AttributeValue::M(_))));

        assert_eq!(from_dynamo_request(dynamo).unwrap(), request);
    }

    #[test]
    fn test_delete_request_conversion() {
        let request = WriteRequest::delete(ItemKey::new("TRC", "2020-03-02"));
        let dynamo = to_dynamo_request(&request).unwrap();
        assert_eq!(from_dynamo_request(dynamo).unwrap(), request);
    }

    #[test]
    fn test_empty_last_key_ends_pagination() {
        let page = to_page(Some(vec![]), Some(HashMap::new())).unwrap();
        assert!(page.cursor.is_none());
        assert!(page.items.is_empty());
    }
}
