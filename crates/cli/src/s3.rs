//! S3 backend for run artifact uploads.

use std::collections::BTreeMap;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{error::DisplayErrorContext, primitives::ByteStream, Client};
use chat_distill_core::{ArtifactStore, StoreError};
use tokio::runtime::Runtime;

/// Uploads into one bucket, credentials and region from the AWS environment.
///
/// The CLI is synchronous, so the store owns a small runtime and blocks on
/// each request.
pub struct S3Store {
    bucket: String,
    client: Client,
    runtime: Runtime,
}

impl S3Store {
    pub fn connect(bucket: &str) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let config = runtime.block_on(aws_config::load_defaults(BehaviorVersion::latest()));
        Ok(Self {
            bucket: bucket.to_string(),
            client: Client::new(&config),
            runtime,
        })
    }
}

impl ArtifactStore for S3Store {
    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_metadata(Some(metadata.clone().into_iter().collect()));

        self.runtime
            .block_on(request.send())
            .map_err(|e| DisplayErrorContext(e).to_string())?;
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
