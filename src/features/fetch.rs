use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, USER_AGENT};
use hyper_tls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::models::Error;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

pub fn http_client() -> HttpClient {
    let https = HttpsConnector::new();
    Client::builder(TokioExecutor::new()).build::<_, Empty<Bytes>>(https)
}

/// GET `url` and decode the JSON body. Non-2xx responses are fetch errors.
pub async fn get_json<T: DeserializeOwned>(client: &HttpClient, url: &Url) -> Result<T, Error> {
    let uri: hyper::Uri = url.as_str().parse().map_err(|_| Error::InvalidUrl)?;
    let req = hyper::Request::get(uri)
        .header(ACCEPT, "application/json")
        .header(USER_AGENT, concat!("shelfq/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())?;
    let response = client.request(req).await?;
    let status = response.status();
    debug!({ url = url.as_str(), status = status.as_u16() }, "get_json");
    let body = response.into_body().collect().await?.to_bytes();
    if !status.is_success() {
        return Err(Error::Fetch(format!("{} responded {}", url, status)));
    }
    Ok(serde_json::from_slice(&body)?)
}
