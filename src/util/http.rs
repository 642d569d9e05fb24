pub use client::{Client, ClientError, Method, Response, StatusCode};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub struct InvalidUriError(String);

    impl Display for InvalidUriError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn new(uri: http::Uri) -> Self {
            Self(uri)
        }

        /// Replace the path and query of `base_uri`, keeping scheme and
        /// authority.
        pub fn from_parts(
            base_uri: Uri,
            path: &str,
            query: Option<&str>,
        ) -> Result<Self, InvalidUriError> {
            let path_and_query = if let Some(qs) = query {
                http::uri::PathAndQuery::from_maybe_shared(format!("{path}?{qs}",))?
            } else {
                http::uri::PathAndQuery::from_str(path)?
            };
            let mut parts = base_uri.0.into_parts();
            parts.path_and_query = Some(path_and_query);

            Ok(http::Uri::from_parts(parts).map(Self::new)?)
        }

        /// The authority (host and optional port) of this URI, if any
        pub fn host(&self) -> Option<&str> {
            self.0.authority().map(|a| a.as_str())
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Ok(http::Uri::from_str(s).map(Self::new)?)
        }
    }

    impl TryFrom<String> for Uri {
        type Error = InvalidUriError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Ok(Self(http::Uri::from_maybe_shared(value)?))
        }
    }

    impl From<http::Uri> for Uri {
        fn from(value: http::Uri) -> Self {
            Self(value)
        }
    }

    impl Serialize for Uri {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            serializer.serialize_str(&self.to_string())
        }
    }

    impl<'de> Deserialize<'de> for Uri {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }
}

mod client {
    use std::time::Duration;

    use futures_lite::StreamExt;
    use reqwest::RequestBuilder;
    use serde::de::DeserializeOwned;

    use super::uri::Uri;

    pub type Method = reqwest::Method;
    pub type StatusCode = reqwest::StatusCode;
    pub type HeaderMap = reqwest::header::HeaderMap;

    #[derive(Debug, thiserror::Error)]
    pub enum ClientError {
        #[error(transparent)]
        Client(reqwest::Error),

        #[error(transparent)]
        Server(reqwest::Error),
    }

    impl ClientError {
        /// Whether this error happened at the transport level (connection,
        /// timeout) rather than in response handling
        pub fn is_transport(&self) -> bool {
            matches!(self, ClientError::Client(_))
        }
    }

    #[derive(Debug)]
    pub struct Response(reqwest::Response);

    impl Response {
        pub fn status(&self) -> StatusCode {
            self.0.status()
        }

        pub fn headers(&self) -> &HeaderMap {
            self.0.headers()
        }

        pub fn stream(self) -> impl futures_lite::Stream<Item = Result<bytes::Bytes, ClientError>> {
            self.0
                .bytes_stream()
                .map(|res| res.map_err(ClientError::Server))
        }

        pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
            self.0.json().await.map_err(ClientError::Server)
        }

        pub async fn text(self) -> Result<String, ClientError> {
            self.0.text().await.map_err(ClientError::Server)
        }
    }

    /// Thin wrapper around [reqwest::Client] with an optional default
    /// request timeout. Status handling is left to the caller.
    #[derive(Debug, Clone)]
    pub struct Client {
        client: reqwest::Client,
        timeout: Option<Duration>,
    }

    impl Default for Client {
        /// Default client with a timeout of 59 seconds.
        fn default() -> Self {
            Self::new(Some(Duration::from_secs(59)))
        }
    }

    impl Client {
        pub fn new(timeout: Option<Duration>) -> Self {
            Self {
                client: reqwest::Client::new(),
                timeout,
            }
        }

        /// Perform a request against `uri`, letting `decorator` customize
        /// headers, body and per-request timeout before it is sent.
        pub async fn request<D>(
            &self,
            method: Method,
            uri: &Uri,
            decorator: D,
        ) -> Result<Response, ClientError>
        where
            D: FnOnce(RequestBuilder) -> RequestBuilder,
        {
            let mut request = self.client.request(method, uri.to_string());

            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            request = decorator(request);

            Ok(Response(request.send().await.map_err(ClientError::Client)?))
        }
    }
}
