use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::IntoUrl;
use serde::Serialize;

use crate::{
    error::{Error, Result},
    interceptor::AuthInterceptor,
    manager::TokenManager,
};

/// Wrapper around `reqwest::Client` that sends every request through an
/// [`AuthInterceptor`]: the shared access token is attached, and a `401` triggers one
/// refresh and retry.
///
/// Designed to be a mostly drop-in replacement for `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpClient {
    interceptor: AuthInterceptor,
    client: reqwest::Client,
}

impl HttpClient {
    /// Creates a new `HttpClient` using the tokens of `manager`.
    #[must_use]
    pub fn new(manager: TokenManager) -> Self {
        Self::new_with_interceptor(AuthInterceptor::new(manager))
    }

    #[must_use]
    pub fn new_with_interceptor(interceptor: AuthInterceptor) -> Self {
        Self {
            interceptor,
            client: reqwest::Client::new(),
        }
    }

    /// Set a custom `reqwest::Client`.
    #[must_use]
    pub fn set_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn interceptor(&self) -> &AuthInterceptor {
        &self.interceptor
    }

    /// Start building a `Request`. The token is attached when it is sent.
    pub fn request<U: IntoUrl>(&self, method: reqwest::Method, url: U) -> RequestBuilder {
        RequestBuilder {
            client: self.clone(),
            inner: self.client.request(method, url),
        }
    }

    /// Execute a `Request` through the interceptor.
    ///
    /// # Errors
    /// - Returns an error if no access token could be obtained.
    /// - Returns an error if the request fails.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        self.interceptor
            .intercept(request, |request| {
                let pending = self.client.execute(request);
                async move { pending.await.map_err(|e| Error::from(Arc::new(e))) }
            })
            .await
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(reqwest::Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(reqwest::Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(reqwest::Method::PUT, url)
    }

    /// Convenience method to make a `PATCH` request to a URL.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(reqwest::Method::PATCH, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(reqwest::Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(reqwest::Method::HEAD, url)
    }
}

/// Thin wrapper around `reqwest::RequestBuilder` whose [`send`](Self::send) goes through
/// the [`HttpClient`]'s interceptor.
#[derive(Debug)]
#[must_use]
pub struct RequestBuilder {
    client: HttpClient,
    inner: reqwest::RequestBuilder,
}

impl RequestBuilder {
    pub fn header<K, V>(self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.map(|b| b.header(key, value))
    }

    pub fn headers(self, headers: HeaderMap) -> Self {
        self.map(|b| b.headers(headers))
    }

    pub fn query<T: Serialize + ?Sized>(self, query: &T) -> Self {
        self.map(|b| b.query(query))
    }

    pub fn json<T: Serialize + ?Sized>(self, json: &T) -> Self {
        self.map(|b| b.json(json))
    }

    pub fn form<T: Serialize + ?Sized>(self, form: &T) -> Self {
        self.map(|b| b.form(form))
    }

    pub fn body<T: Into<reqwest::Body>>(self, body: T) -> Self {
        self.map(|b| b.body(body))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|b| b.timeout(timeout))
    }

    /// Build the request and send it through the interceptor.
    ///
    /// # Errors
    /// See [`HttpClient::execute`]. Also fails if the request cannot be built.
    pub async fn send(self) -> Result<reqwest::Response> {
        let request = self.inner.build().map_err(Arc::new)?;
        self.client.execute(request).await
    }

    fn map(self, f: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder) -> Self {
        Self {
            client: self.client,
            inner: f(self.inner),
        }
    }
}
