//! S3-based state storage backend.
//!
//! Each record is its own object under `<prefix>records/`, so saving one
//! resource is a single put and never rewrites the others.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};
use crate::graph::ResourceId;

use super::lock::{KeyedLocks, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// Record key prefix.
const RECORDS_PREFIX: &str = "records/";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Lifetime of the run lock between refreshes.
    lock_ttl: Duration,
    /// Per-record write locks.
    locks: KeyedLocks,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            lock_ttl: Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs()),
            locks: KeyedLocks::new(),
        }
    }

    /// Sets how long the run lock lives without a refresh.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn record_key(&self, id: &ResourceId) -> String {
        format!("{}{RECORDS_PREFIX}{}.json", self.prefix, id.storage_key())
    }

    fn lock_key(&self) -> String {
        format!("{}{LOCK_KEY}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    ConvergeError::State(StateError::backend(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ConvergeError::State(StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ConvergeError::State(StateError::backend(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::backend(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::backend(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Lists every record key, following continuation tokens.
    async fn list_record_keys(&self) -> Result<Vec<String>> {
        let prefix = format!("{}{RECORDS_PREFIX}", self.prefix);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| {
                    ConvergeError::State(StateError::backend(format!("S3 list error: {e}")))
                })?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .filter(|k| k.ends_with(".json"))
                    .map(str::to_string),
            );

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(keys)
    }

    fn parse_record(key: &str, json: &str) -> Result<StateRecord> {
        let record: StateRecord = serde_json::from_str(json).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse {key}: {e}")))
        })?;
        record.check_version()?;
        Ok(record)
    }

    fn parse_lock(content: &str) -> Result<LockInfo> {
        serde_json::from_str(content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        let key = self.record_key(id);
        debug!("Loading record from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => Self::parse_record(&key, &json).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        let _guard = self.locks.lock(&record.id).await;
        let key = self.record_key(&record.id);
        debug!("Saving record to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(record).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize record: {e}")))
        })?;

        self.put_object(&key, &content).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let key = self.record_key(id);
        debug!("Deleting record s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        let keys = self.list_record_keys().await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            // Deleted between list and get.
            if let Some(json) = self.get_object(&key).await? {
                records.push(Self::parse_record(&key, &json)?);
            }
        }

        info!("Loaded {} records from s3://{}/{}", records.len(), self.bucket, self.prefix);
        Ok(StateSnapshot::from_records(records))
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;
            if !existing.is_expired() {
                return Err(ConvergeError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!("Expired lock held by {} found, taking over", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::with_ttl(&holder_id, self.lock_ttl);

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        self.put_object(&key, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, lock_info.ttl_secs
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let key = self.lock_key();
        let existing = match self.get_object(&key).await? {
            Some(content) => Some(Self::parse_lock(&content)?),
            None => None,
        };
        let Some(mut lock_info) = existing.filter(|l| l.lock_id == lock_id) else {
            return Err(ConvergeError::State(StateError::LockLost {
                lock_id: lock_id.to_string(),
            }));
        };
        lock_info.refresh();

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.put_object(&key, &content).await?;
        debug!("Refreshed state lock {lock_id} until {}", lock_info.expires_at.to_rfc3339());
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.lock_key()).await? {
            Some(content) => Self::parse_lock(&content).map(Some),
            None => Ok(None),
        }
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at s3://{}/{}", self.bucket, self.lock_key());
        self.delete_object(&self.lock_key()).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region, RequestChecksumCalculation};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use wiremock::matchers::any;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const BUCKET: &str = "converge-state";

    const NO_SUCH_KEY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;

    /// Path-style bucket holding objects in memory.
    #[derive(Default)]
    struct InMemoryBucket {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl InMemoryBucket {
        fn list(objects: &BTreeMap<String, Vec<u8>>, request: &Request) -> ResponseTemplate {
            let prefix = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "prefix")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            let contents: String = objects
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .map(|k| format!("<Contents><Key>{k}</Key><Size>1</Size></Contents>"))
                .collect();
            let xml = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Name>{BUCKET}</Name><Prefix>{prefix}</Prefix><IsTruncated>false</IsTruncated>{contents}</ListBucketResult>"#
            );
            ResponseTemplate::new(200).set_body_raw(xml, "application/xml")
        }
    }

    impl Respond for InMemoryBucket {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let mut objects = self.objects.lock().expect("bucket");
            let key = request
                .url
                .path()
                .trim_start_matches('/')
                .split_once('/')
                .map(|(_, key)| key.to_string())
                .unwrap_or_default();

            match request.method.as_str() {
                "PUT" => {
                    objects.insert(key, request.body.clone());
                    ResponseTemplate::new(200)
                }
                "DELETE" => {
                    objects.remove(&key);
                    ResponseTemplate::new(204)
                }
                "GET" if key.is_empty() => Self::list(&objects, request),
                "GET" => match objects.get(&key) {
                    Some(body) => ResponseTemplate::new(200).set_body_raw(body.clone(), "application/json"),
                    None => ResponseTemplate::new(404).set_body_raw(NO_SUCH_KEY, "application/xml"),
                },
                _ => ResponseTemplate::new(405),
            }
        }
    }

    fn bucket_client(server: &MockServer) -> Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "tests"))
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build();
        Client::from_conf(config)
    }

    fn offline_client() -> Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        Client::from_conf(config)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(Some("/team/prod/")), "team/prod/");
        assert_eq!(normalize_prefix(Some("//")), "");
        assert_eq!(normalize_prefix(None), "");
    }

    #[test]
    fn test_record_and_lock_keys() {
        let store = S3StateStore::with_client(offline_client(), "bucket", Some("ray/prod"));
        let id = ResourceId::new(ResourceKind::ManagedCluster, "ray");

        assert_eq!(store.record_key(&id), "ray/prod/records/managed_cluster__ray.json");
        assert_eq!(store.lock_key(), "ray/prod/state.lock");
        assert_eq!(store.backend_type(), "s3");
    }

    #[tokio::test]
    async fn test_records_and_lock_roundtrip_through_bucket() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(InMemoryBucket::default())
            .mount(&server)
            .await;
        let store = S3StateStore::with_client(bucket_client(&server), BUCKET, Some("ray"));
        let id = ResourceId::new(ResourceKind::Network, "vpc");

        assert!(store.load(&id).await.expect("load").is_none());
        let record = StateRecord::new(id.clone(), "arn:aws:ec2:::vpc/vpc", Attributes::new(), "hash", BTreeSet::new());
        store.save(&record).await.expect("save");
        assert_eq!(store.load(&id).await.expect("load"), Some(record));
        assert_eq!(store.snapshot().await.expect("snapshot").len(), 1);

        let lock = store.acquire_lock("one").await.expect("acquire");
        assert!(store.acquire_lock("two").await.is_err());
        let refreshed = store.refresh_lock(&lock.lock_id).await.expect("refresh");
        assert!(refreshed.expires_at >= lock.expires_at);
        assert!(matches!(
            store.refresh_lock("someone-else").await,
            Err(ConvergeError::State(StateError::LockLost { .. }))
        ));
        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(store.get_lock_info().await.expect("lock info").is_none());

        store.delete(&id).await.expect("delete");
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }
}
