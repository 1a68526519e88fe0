//! Protobuf-encoded cache records
//!
//! Field tags are part of the on-disk format; never renumber them.

use chrono::{DateTime, Utc};
use prost::Message;

use crate::error::CacheError;
use crate::request::CachePolicy;

/// Metadata stored beside every cached payload
#[derive(Clone, PartialEq, Message)]
pub struct CacheMetadata {
    #[prost(int64, tag = "1")]
    pub version: i64,
    #[prost(string, tag = "2")]
    pub sensitive_data: String,
    #[prost(string, tag = "3")]
    pub string_encoding: String,
    #[prost(int64, tag = "4")]
    pub creation_date_ms: i64,
    #[prost(string, tag = "5")]
    pub app_version: String,
}

impl CacheMetadata {
    /// Fresh metadata for a payload written now
    pub fn stamp(policy: &CachePolicy, encoding: &str, app_version: &str) -> Self {
        Self {
            version: policy.version,
            sensitive_data: policy.sensitive_data.clone().unwrap_or_default(),
            string_encoding: encoding.to_string(),
            creation_date_ms: Utc::now().timestamp_millis(),
            app_version: app_version.to_string(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.creation_date_ms)
    }

    /// Check this entry against the policy a request currently declares
    pub fn check(
        &self,
        policy: &CachePolicy,
        app_version: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let age_ms = now.timestamp_millis() - self.creation_date_ms;
        if age_ms > policy.ttl_secs.saturating_mul(1000) {
            return Err(CacheError::Expired);
        }

        if self.version != policy.version {
            return Err(CacheError::VersionMismatch {
                stored: self.version,
                expected: policy.version,
            });
        }

        if self.sensitive_data != policy.sensitive_data.as_deref().unwrap_or_default() {
            return Err(CacheError::SensitiveDataMismatch);
        }

        if self.app_version != app_version {
            return Err(CacheError::AppVersionMismatch {
                stored: self.app_version.clone(),
                current: app_version.to_string(),
            });
        }

        Ok(())
    }
}

/// Payload and metadata as one record, for backends that store single blobs
#[derive(Clone, PartialEq, Message)]
pub struct CacheEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub metadata: Vec<u8>,
}
