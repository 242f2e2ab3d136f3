use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use url::Url;

use super::Forwarder;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build URL for tag {tag:?}"))]
    TagUrl {
        source: url::ParseError,
        tag: String,
    },

    #[snafu(display("failed to post record to {url}"))]
    Post { source: reqwest::Error, url: Url },

    #[snafu(display("log agent rejected record posted to {url}"))]
    Rejected { source: reqwest::Error, url: Url },
}

/// Posts records as JSON to the HTTP input of the log agent, which takes the
/// request path as the record tag.
#[derive(Clone, Debug)]
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpForwarder {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn tag_url(&self, tag: &str) -> Result<Url, Error> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(tag).context(TagUrlSnafu { tag })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    type Error = Error;

    async fn post(&self, tag: &str, record: &serde_json::Value) -> Result<(), Error> {
        let url = self.tag_url(tag)?;

        self.client
            .post(url.clone())
            .json(record)
            .send()
            .await
            .context(PostSnafu { url: url.clone() })?
            .error_for_status()
            .context(RejectedSnafu { url })?;

        Ok(())
    }
}
