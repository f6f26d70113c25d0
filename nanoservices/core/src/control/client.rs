use async_trait::async_trait;
use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use crate::control::{ControlPlane, ErrorBody};
use crate::model::{ProcessorDefinition, ProcessorNode};

/// HTTP client for a node's control plane.
///
/// Owns its `reqwest::Client`; build one per base URL and reuse it.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: Client,
    base: Url,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str) -> ParrotResult<Self> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> ParrotResult<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("control plane url '{base_url}' cannot be a base")));
        }
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> ParrotResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("control plane url '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .push("processors")
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> ParrotResult<RequestBuilder> {
        Ok(self.http.request(method, self.endpoint(segments)?))
    }

    async fn send(&self, request: RequestBuilder) -> ParrotResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(Error::Transport(format!("{} returned {status}", response.url())))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> ParrotResult<T> {
        Ok(self.send(request).await?.json::<T>().await?)
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn list_processors(&self) -> ParrotResult<Vec<String>> {
        self.fetch(self.request(Method::GET, &[])?).await
    }

    async fn get_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        self.fetch(self.request(Method::GET, &[id])?).await
    }

    /// A rejected definition surfaces the server's `{message}` verbatim.
    async fn add_processor(&self, definition: ProcessorDefinition) -> ParrotResult<ProcessorDefinition> {
        let response = self.request(Method::POST, &[])?.json(&definition).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let url = response.url().clone();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(Error::Domain { message: body.message }),
            Err(_) => Err(Error::Transport(format!("{url} returned {status}"))),
        }
    }

    async fn processor_cluster(&self, id: &str) -> ParrotResult<Vec<ProcessorNode>> {
        self.fetch(self.request(Method::GET, &[id, "cluster"])?).await
    }

    async fn start_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        self.fetch(self.request(Method::POST, &[id, "start"])?).await
    }

    async fn stop_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        self.fetch(self.request(Method::POST, &[id, "stop"])?).await
    }

    async fn restart_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        self.fetch(self.request(Method::POST, &[id, "restart"])?).await
    }

    async fn delete_processor(&self, id: &str) -> ParrotResult<()> {
        self.send(self.request(Method::DELETE, &[id])?).await?;
        Ok(())
    }
}
