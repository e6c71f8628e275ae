use std::{fmt::Debug, time::Duration};

use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{ListParams, WatchEvent, WatchParams},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// What a resumable watch hands to its consumer.
#[derive(Debug, Clone)]
pub enum Event<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// The channel closed and was re-established. Consumers that cache state
    /// should re-read it.
    Restart,
}

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A watch that remembers the last resource version it saw and reconnects
/// from there whenever the server closes the channel.
pub struct ResumableWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    api: Api<K>,
    params: WatchParams,
    resource_version: String,
    stream: Option<BoxStream<'static, kube::Result<WatchEvent<K>>>>,
}

impl<K> ResumableWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    /// Starts from `resource_version`. An empty version means "now".
    pub fn new(api: Api<K>, params: WatchParams, resource_version: impl Into<String>) -> Self {
        ResumableWatch {
            api,
            params: params.bookmarks(true),
            resource_version: resource_version.into(),
            stream: None,
        }
    }

    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    async fn current_version(&self) -> Result<String> {
        let list = self
            .api
            .list_metadata(&ListParams::default().limit(1))
            .await?;
        Ok(list.metadata.resource_version.unwrap_or_default())
    }

    /// Next event, reconnecting as needed. Returns `Error::Cancelled` once the
    /// token fires.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Event<K>> {
        loop {
            if self.stream.is_none() {
                if self.resource_version.is_empty() {
                    self.resource_version = self.current_version().await?;
                }
                match self.api.watch(&self.params, &self.resource_version).await {
                    Ok(stream) => self.stream = Some(stream.boxed()),
                    Err(e) => {
                        warn!("failed to open watch: {e}");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        }
                    }
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                item = stream.next() => item,
            };

            match item {
                Some(Ok(WatchEvent::Added(obj))) => {
                    self.checkpoint(&obj);
                    return Ok(Event::Added(obj));
                }
                Some(Ok(WatchEvent::Modified(obj))) => {
                    self.checkpoint(&obj);
                    return Ok(Event::Modified(obj));
                }
                Some(Ok(WatchEvent::Deleted(obj))) => {
                    self.checkpoint(&obj);
                    return Ok(Event::Deleted(obj));
                }
                Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                    self.resource_version = bookmark.metadata.resource_version;
                }
                Some(Ok(WatchEvent::Error(e))) => {
                    warn!("watch error: {e:?}");
                    if e.code == 410 {
                        // the stored version was compacted away
                        self.resource_version.clear();
                    }
                    self.stream = None;
                    return Ok(Event::Restart);
                }
                Some(Err(e)) => {
                    warn!("watch stream failed: {e}");
                    self.stream = None;
                    return Ok(Event::Restart);
                }
                None => {
                    debug!("watch channel closed, resuming at {}", self.resource_version);
                    self.stream = None;
                    return Ok(Event::Restart);
                }
            }
        }
    }

    fn checkpoint(&mut self, obj: &K) {
        if let Some(rv) = obj.resource_version() {
            self.resource_version = rv;
        }
    }
}
