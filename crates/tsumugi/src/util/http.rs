use std::{
    ops::Deref,
    sync::{Arc, PoisonError},
};

use reqwest::{Client, ClientBuilder};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use url::Url;

use crate::error::TsumugiResult;

/// Shared HTTP client for playlist, key and segment requests.
///
/// Headers such as user agent or referer belong to the [`ClientBuilder`] passed in by the caller.
/// Cookies set by any response are sent with later requests.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> TsumugiResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    /// Add `name=value` cookies, scoped to the host of `url`.
    ///
    /// A single entry may hold several cookies separated by `;`, as in a `Cookie` header.
    pub fn add_cookies(&self, cookies: Vec<String>, url: &Url) {
        let mut store = self
            .cookies_store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for cookie in cookies.iter().flat_map(|c| c.split(';')) {
            let cookie = cookie.trim();
            if cookie.is_empty() {
                continue;
            }
            if let Err(e) = store.parse(cookie, url) {
                log::warn!("Ignored invalid cookie {cookie}: {e}");
            }
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(Client::builder()).unwrap_or_else(|e| {
            log::warn!("Failed to build HTTP client, cookies are disabled: {e}");
            Self {
                client: Client::default(),
                cookies_store: Arc::new(CookieStoreMutex::new(CookieStore::default())),
            }
        })
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
