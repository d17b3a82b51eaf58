//! Round tripper and the client API built on it.
//!
//! ```rust,ignore
//! use wraith::{Client, HttpVersion};
//!
//! let client = Client::builder()
//!     .proxy("socks5://127.0.0.1:1080")
//!     .http_version(HttpVersion::Auto)
//!     .build()?;
//! let response = client.get("https://example.com/").send().await?;
//! println!("{} new_conn={}", response.status(), response.is_new_conn());
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::Method;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use url::Url;

use crate::address::{pool_key, Address, Scheme};
use crate::dialer::{AddrFamily, Dialer, DialerConfig, FamilyPolicy, TcpFingerprint, TcpOptions, TlsConfig};
use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintProfile, Http2Settings, TlsFingerprint};
use crate::log::{EventLog, Logger};
use crate::pool::task::{ReqTask, TaskOutcome};
use crate::pool::Registry;
use crate::request::{Request, RequestBody, RequestHead, SeekableRead};
use crate::response::Response;
use crate::timeouts::Timeouts;
use crate::transport::connector::Connector;
use crate::version::HttpVersion;

/// Attempts after the first one.
pub const DEFAULT_MAX_RETRIES: usize = 2;

/// Fresh dials one attempt may make when its task keeps bouncing.
const MAX_DIALS_PER_ATTEMPT: usize = 3;

/// Called before each request. Returning [`Error::UseLastResponse`] stops
/// the exchange without sending.
pub type PreflightHook = Arc<dyn Fn(&mut Request) -> Result<()> + Send + Sync>;

/// Called with each response head; an error replaces the response.
pub type PostflightHook = Arc<dyn Fn(&Response) -> Result<()> + Send + Sync>;

/// Cookie jar consulted around every send.
pub trait CookieStore: Send + Sync {
    /// `Cookie` header value for `url`, if any.
    fn cookies(&self, url: &Url) -> Option<String>;

    /// Store the `Set-Cookie` values received from `url`.
    fn set_cookies(&self, url: &Url, set_cookie: &[&str]);
}

/// When a failed attempt may be sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Retry whenever the body can be replayed from the start.
    #[default]
    ReplayableBody,
    /// Additionally require an idempotent method, unless nothing was sent.
    Idempotent,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state behind a [`Client`].
struct Transport {
    dialer: Dialer,
    registry: Arc<Registry>,
    proxies: Vec<Address>,
    version: HttpVersion,
    timeouts: Timeouts,
    user_agent: String,
    max_retries: usize,
    retry_policy: RetryPolicy,
    logger: Option<Logger>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    preflight: Option<PreflightHook>,
    postflight: Option<PostflightHook>,
}

/// Everything one attempt needs, fixed across retries.
struct Prepared {
    head: Arc<RequestHead>,
    body: Arc<AsyncMutex<RequestBody>>,
    dest: Address,
    proxies: Arc<[Address]>,
    key: Arc<str>,
    timeouts: Timeouts,
    version: HttpVersion,
    deadline: Option<Instant>,
    log: EventLog,
}

impl Transport {
    async fn round_trip(&self, mut request: Request) -> Result<Response> {
        if let Some(preflight) = &self.preflight {
            preflight(&mut request)?;
        }
        let prepared = self.prepare(request)?;
        tracing::debug!(
            "{} {} via pool {}",
            prepared.head.method,
            prepared.head.url,
            prepared.key
        );

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if let Some((err, sent)) = &last_err {
                if !self.may_retry(err, *sent, &prepared).await {
                    break;
                }
                tracing::debug!(
                    "retrying {} {} (attempt {}): {}",
                    prepared.head.method,
                    prepared.head.url,
                    attempt + 1,
                    err
                );
            }
            match self.attempt(&prepared).await {
                Ok(response) => return self.finish(&prepared, response),
                Err(failed) => last_err = Some(failed),
            }
        }
        match last_err {
            Some((err, _)) => Err(err),
            None => Err(Error::connection("request was never attempted")),
        }
    }

    fn prepare(&self, request: Request) -> Result<Prepared> {
        let Request {
            method,
            url,
            mut headers,
            body,
            proxies,
            timeouts,
            version,
            log_id,
        } = request;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::invalid_request(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }
        let dest = Address::from_url(&url)?;
        let proxies: Arc<[Address]> = proxies.unwrap_or_else(|| self.proxies.clone()).into();
        let key: Arc<str> = pool_key(&proxies, &dest).into();
        let timeouts = timeouts.unwrap_or_else(|| self.timeouts.clone());
        let deadline = timeouts.total.map(|total| Instant::now() + total);

        if !self.user_agent.is_empty()
            && !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
        {
            headers.push(("User-Agent".into(), self.user_agent.clone()));
        }
        if let Some(store) = &self.cookie_store {
            if let Some(cookies) = store.cookies(&url) {
                headers.push(("Cookie".into(), cookies));
            }
        }

        let id = log_id
            .unwrap_or_else(|| NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed).to_string());
        Ok(Prepared {
            head: Arc::new(RequestHead {
                method,
                url,
                headers,
            }),
            body: Arc::new(AsyncMutex::new(body)),
            dest,
            proxies,
            key,
            timeouts,
            version: version.unwrap_or(self.version),
            deadline,
            log: EventLog::new(id, self.logger.clone()),
        })
    }

    /// Whether a failed attempt may go out again. Rewinds the body.
    async fn may_retry(&self, err: &Error, sent: bool, p: &Prepared) -> bool {
        match err {
            Error::InvalidRequest(_)
            | Error::UrlParse(_)
            | Error::UseLastResponse
            | Error::Callback(_)
            | Error::TotalTimeout(_) => return false,
            _ => {}
        }
        // A forced close must reach the caller instead of a fresh dial.
        if err.is_force_closed() {
            return false;
        }
        if p.deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        if self.retry_policy == RetryPolicy::Idempotent && sent && !p.head.is_idempotent() {
            return false;
        }
        let replayable = p.body.lock().await.rewind().await;
        if !replayable {
            tracing::debug!("not retrying {}: body was consumed", p.head.url);
        }
        replayable
    }

    /// One attempt: pooled dispatch, or a fresh dial when no connector is
    /// idle. Returns the error with whether any request byte was written.
    async fn attempt(&self, p: &Prepared) -> std::result::Result<Response, (Error, bool)> {
        let (task, mut rx) = ReqTask::new(
            p.head.clone(),
            p.body.clone(),
            p.timeouts.clone(),
            p.deadline,
            p.key.clone(),
            p.log.clone(),
        );
        let sent = task.sent_flag();
        let was_sent = || sent.load(Ordering::Acquire);

        let mut pending = match self.registry.get(&p.key) {
            Some(pool) => pool.dispatch(task).err(),
            None => Some(task),
        };
        let mut dials = 0;
        loop {
            if let Some(task) = pending.take() {
                dials += 1;
                if dials > MAX_DIALS_PER_ATTEMPT {
                    return Err((
                        Error::connection("no connection could take the request"),
                        was_sent(),
                    ));
                }
                self.dial_and_serve(p, task)
                    .await
                    .map_err(|e| (e, was_sent()))?;
            }

            let reply = match p.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut rx).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        let total = p.timeouts.total.unwrap_or_default();
                        return Err((Error::TotalTimeout(total), was_sent()));
                    }
                },
                None => (&mut rx).await,
            };
            match reply {
                Ok(TaskOutcome::Done(result)) => return result.map_err(|e| (e, was_sent())),
                Ok(TaskOutcome::PoolEmpty(mut task)) => {
                    rx = task.rearm();
                    pending = Some(task);
                }
                Err(_) => {
                    return Err((
                        Error::connection("connection dropped the request"),
                        was_sent(),
                    ))
                }
            }
        }
    }

    /// Dial a connector for `p`, register it and let it serve `task`.
    async fn dial_and_serve(&self, p: &Prepared, task: ReqTask) -> Result<()> {
        let connect = Connector::connect(
            &self.dialer,
            &p.dest,
            p.proxies.clone(),
            p.version,
            &p.log,
        );

        let mut limit = p
            .timeouts
            .connect
            .map(|c| (Instant::now() + c, Error::ConnectTimeout(c)));
        if let Some(deadline) = p.deadline {
            if limit.as_ref().map_or(true, |(at, _)| deadline < *at) {
                let total = p.timeouts.total.unwrap_or_default();
                limit = Some((deadline, Error::TotalTimeout(total)));
            }
        }
        let conn = match limit {
            Some((at, timeout_err)) => match tokio::time::timeout_at(at, connect).await {
                Ok(conn) => conn?,
                Err(_) => return Err(timeout_err),
            },
            None => connect.await?,
        };

        let conn = Arc::new(conn);
        tracing::debug!("Pool {}: dialed {:?}", p.key, conn);
        let pool = self
            .registry
            .register(&p.key, p.timeouts.pool_idle_or_default());
        tokio::spawn(pool.serve(conn, task));
        Ok(())
    }

    fn finish(&self, p: &Prepared, response: Response) -> Result<Response> {
        if let Some(store) = &self.cookie_store {
            let set_cookie = response.header_all("set-cookie");
            if !set_cookie.is_empty() {
                store.set_cookies(&p.head.url, &set_cookie);
            }
        }
        if let Some(postflight) = &self.postflight {
            postflight(&response)?;
        }
        Ok(response)
    }
}

/// HTTP client over pooled connections.
///
/// Cloning is cheap; clones share pools, DNS cache and TLS sessions.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Transport>,
}

impl Client {
    /// Client with default settings.
    pub fn new() -> Result<Self> {
        ClientBuilder::new().build()
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a GET request builder.
    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    /// Create a POST request builder.
    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    /// Create a custom method request builder.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            url: url.into(),
            method,
            headers: Vec::new(),
            body: RequestBody::empty(),
            proxies: None,
            timeouts: None,
            version: None,
            log_id: None,
        }
    }

    /// Send a prepared request, retrying per the client's policy.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.inner.round_trip(request).await
    }

    /// Stop all pools from taking work. Connections close once their
    /// current body is done.
    pub fn close_conns(&self) {
        self.inner.registry.close_all();
    }

    /// Tear down every pooled connection now. Bodies in flight fail with a
    /// force-closed error.
    pub fn force_close_conns(&self) {
        self.inner.registry.force_close_all();
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether a pool exists for `url` through `proxies`.
    pub fn has_pool(&self, url: &str, proxies: &[&str]) -> Result<bool> {
        let dest = Address::parse(url)?;
        let proxies = proxies
            .iter()
            .map(|p| Address::parse(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.inner.registry.contains(&pool_key(&proxies, &dest)))
    }

    pub fn dialer(&self) -> &Dialer {
        &self.inner.dialer
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("dialer", &self.inner.dialer)
            .field("registry", &self.inner.registry)
            .field("proxies", &self.inner.proxies)
            .field("version", &self.inner.version)
            .field("max_retries", &self.inner.max_retries)
            .field("retry_policy", &self.inner.retry_policy)
            .finish()
    }
}

/// Builder for HTTP requests.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: RequestBody,
    proxies: Option<Vec<String>>,
    timeouts: Option<Timeouts>,
    version: Option<HttpVersion>,
    log_id: Option<String>,
}

impl<'a> RequestBuilder<'a> {
    /// Add a header. Order is kept on the wire.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set all headers (replaces existing headers).
    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Stream the body from a one-shot reader. A retry is only possible if
    /// nothing was read from it.
    pub fn body_stream(
        mut self,
        reader: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        len: Option<u64>,
    ) -> Self {
        self.body = RequestBody::stream(reader, len);
        self
    }

    /// Stream the body from a reader that is rewound before each retry.
    pub fn body_seekable(mut self, reader: impl SeekableRead + 'static, len: Option<u64>) -> Self {
        self.body = RequestBody::seekable(reader, len);
        self
    }

    /// Proxy chain for this request only; an empty list goes direct.
    pub fn proxies<S: AsRef<str>>(mut self, proxies: &[S]) -> Self {
        self.proxies = Some(proxies.iter().map(|p| p.as_ref().to_string()).collect());
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Set the HTTP version preference.
    pub fn version(mut self, version: HttpVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Id attached to structured log events.
    pub fn log_id(mut self, id: impl Into<String>) -> Self {
        self.log_id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Request> {
        let url = Url::parse(&self.url)?;
        let proxies = self
            .proxies
            .map(|list| list.iter().map(|p| Address::parse(p)).collect::<Result<Vec<_>>>())
            .transpose()?;
        let mut request = Request::new(self.method, url);
        request.headers = self.headers;
        request.body = self.body;
        request.proxies = proxies;
        request.timeouts = self.timeouts;
        request.version = self.version;
        request.log_id = self.log_id;
        Ok(request)
    }

    /// Send the request and return the response.
    pub async fn send(self) -> Result<Response> {
        let client = self.client;
        let request = self.build()?;
        client.execute(request).await
    }
}

/// Builder for creating HTTP clients.
pub struct ClientBuilder {
    fingerprint: FingerprintProfile,
    tls_fingerprint: Option<TlsFingerprint>,
    http2_settings: Option<Http2Settings>,
    tcp_fingerprint: Option<TcpFingerprint>,
    version: HttpVersion,
    timeouts: Timeouts,
    proxies: Vec<String>,
    dns_server: Option<SocketAddr>,
    family: FamilyPolicy,
    local_addr: Option<IpAddr>,
    keep_alive: Option<Duration>,
    root_certs: Vec<Vec<u8>>,
    insecure: bool,
    user_agent: Option<String>,
    max_retries: usize,
    retry_policy: RetryPolicy,
    logger: Option<Logger>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    preflight: Option<PreflightHook>,
    postflight: Option<PostflightHook>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            fingerprint: FingerprintProfile::default(),
            tls_fingerprint: None,
            http2_settings: None,
            tcp_fingerprint: None,
            version: HttpVersion::default(),
            timeouts: Timeouts::default(),
            proxies: Vec::new(),
            dns_server: None,
            family: FamilyPolicy::default(),
            local_addr: None,
            keep_alive: Some(Duration::from_secs(30)),
            root_certs: Vec::new(),
            insecure: false,
            user_agent: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_policy: RetryPolicy::default(),
            logger: None,
            cookie_store: None,
            preflight: None,
            postflight: None,
        }
    }

    /// Browser profile supplying TLS, HTTP/2 and User-Agent defaults.
    pub fn fingerprint(mut self, fingerprint: FingerprintProfile) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Override the profile's TLS client hello.
    pub fn tls_fingerprint(mut self, fp: TlsFingerprint) -> Self {
        self.tls_fingerprint = Some(fp);
        self
    }

    /// Override the profile's HTTP/2 SETTINGS.
    pub fn http2_settings(mut self, settings: Http2Settings) -> Self {
        self.http2_settings = Some(settings);
        self
    }

    pub fn tcp_fingerprint(mut self, fp: TcpFingerprint) -> Self {
        self.tcp_fingerprint = Some(fp);
        self
    }

    /// Set the default HTTP version preference.
    pub fn http_version(mut self, version: HttpVersion) -> Self {
        self.version = version;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Append a hop to the default proxy chain.
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.proxies.push(url.into());
        self
    }

    /// Replace the default proxy chain.
    pub fn proxies<S: AsRef<str>>(mut self, chain: &[S]) -> Self {
        self.proxies = chain.iter().map(|p| p.as_ref().to_string()).collect();
        self
    }

    /// Resolve through a fixed DNS server instead of the system resolver.
    pub fn dns_server(mut self, server: SocketAddr) -> Self {
        self.dns_server = Some(server);
        self
    }

    pub fn address_family(mut self, family: AddrFamily) -> Self {
        self.family = FamilyPolicy::Fixed(family);
        self
    }

    /// Choose the address family per host.
    pub fn address_family_fn(
        mut self,
        f: impl Fn(&str) -> AddrFamily + Send + Sync + 'static,
    ) -> Self {
        self.family = FamilyPolicy::PerHost(Arc::new(f));
        self
    }

    /// Bind outgoing TCP connections to `addr`.
    pub fn local_address(mut self, addr: IpAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// TCP keep-alive interval; `None` disables it.
    pub fn tcp_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Trust an extra root certificate (DER or PEM).
    pub fn add_root_certificate(mut self, cert: impl Into<Vec<u8>>) -> Self {
        self.root_certs.push(cert.into());
        self
    }

    /// Skip certificate verification. Testing only.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.insecure = accept;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// How long an idle pooled connection is kept.
    pub fn pool_idle_timeout(mut self, idle: Duration) -> Self {
        self.timeouts.pool_idle = Some(idle);
        self
    }

    /// Receive structured dial and response events.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    pub fn preflight(mut self, hook: impl Fn(&mut Request) -> Result<()> + Send + Sync + 'static) -> Self {
        self.preflight = Some(Arc::new(hook));
        self
    }

    pub fn postflight(mut self, hook: impl Fn(&Response) -> Result<()> + Send + Sync + 'static) -> Self {
        self.postflight = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Client> {
        let proxies = self
            .proxies
            .iter()
            .map(|p| Address::parse(p))
            .collect::<Result<Vec<_>>>()?;
        if let Some(hop) = proxies
            .iter()
            .find(|p| !matches!(p.scheme(), Scheme::Http | Scheme::Https | Scheme::Socks5))
        {
            return Err(Error::invalid_request(format!("unsupported proxy {}", hop)));
        }

        let user_agent = self
            .user_agent
            .unwrap_or_else(|| self.fingerprint.user_agent().to_string());
        let dialer = Dialer::new(DialerConfig {
            dns_server: self.dns_server,
            family: self.family,
            tcp: TcpOptions {
                fingerprint: self.tcp_fingerprint,
                keep_alive: self.keep_alive,
                local_addr: self.local_addr,
            },
            tls: TlsConfig {
                fingerprint: self
                    .tls_fingerprint
                    .or_else(|| self.fingerprint.tls_fingerprint()),
                root_certs: self.root_certs,
                insecure: self.insecure,
            },
            http2: self
                .http2_settings
                .unwrap_or_else(|| self.fingerprint.http2_settings()),
            user_agent: user_agent.clone(),
        })?;

        Ok(Client {
            inner: Arc::new(Transport {
                dialer,
                registry: Registry::new(),
                proxies,
                version: self.version,
                timeouts: self.timeouts,
                user_agent,
                max_retries: self.max_retries,
                retry_policy: self.retry_policy,
                logger: self.logger,
                cookie_store: self.cookie_store,
                preflight: self.preflight,
                postflight: self.postflight,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.registry.close_all();
    }
}

static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();

/// Process-wide client with default settings, created on first use and
/// never torn down.
pub fn default_client() -> Result<&'static Client> {
    if let Some(client) = DEFAULT_CLIENT.get() {
        return Ok(client);
    }
    let client = Client::new()?;
    Ok(DEFAULT_CLIENT.get_or_init(|| client))
}

/// GET `url` with the default client.
pub async fn get(url: impl Into<String>) -> Result<Response> {
    default_client()?.get(url).send().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(client: &Client, method: Method, body: RequestBody) -> Prepared {
        let mut request = Request::new(method, Url::parse("http://example.com/").unwrap());
        request.body = body;
        client.inner.prepare(request).unwrap()
    }

    #[test]
    fn test_proxy_chain_changes_pool_key() {
        let client = Client::builder().fingerprint(FingerprintProfile::None).build().unwrap();
        let direct = prepared(&client, Method::GET, RequestBody::empty());

        let mut request = Request::new(Method::GET, Url::parse("http://example.com/").unwrap());
        request.proxies = Some(vec![Address::parse("socks5://127.0.0.1:1080").unwrap()]);
        let proxied = client.inner.prepare(request).unwrap();
        assert_ne!(direct.key, proxied.key);
    }

    #[test]
    fn test_default_user_agent_added_once() {
        let client = Client::builder()
            .fingerprint(FingerprintProfile::None)
            .user_agent("ua-test")
            .build()
            .unwrap();
        let p = prepared(&client, Method::GET, RequestBody::empty());
        let uas: Vec<_> = p
            .head
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("user-agent"))
            .collect();
        assert_eq!(uas.len(), 1);
        assert_eq!(uas[0].1, "ua-test");
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let client = Client::builder().fingerprint(FingerprintProfile::None).build().unwrap();
        let request = Request::new(Method::GET, Url::parse("ftp://example.com/").unwrap());
        assert!(matches!(
            client.inner.prepare(request).err().unwrap(),
            Error::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_retry_rules() {
        let client = Client::builder()
            .fingerprint(FingerprintProfile::None)
            .retry_policy(RetryPolicy::Idempotent)
            .build()
            .unwrap();
        let t = &client.inner;
        let io = || Error::io("reset");

        let get = prepared(&client, Method::GET, RequestBody::empty());
        assert!(t.may_retry(&io(), true, &get).await);
        assert!(!t.may_retry(&Error::UseLastResponse, false, &get).await);
        assert!(!t.may_retry(&Error::invalid_request("bad"), false, &get).await);
        let forced = Error::Canceled {
            stage: "request",
            cause: Arc::new(Error::ForceClosed),
        };
        assert!(!t.may_retry(&forced, false, &get).await);
        assert!(!t.may_retry(&Error::ForceClosed, true, &get).await);

        let post = prepared(&client, Method::POST, RequestBody::from("x"));
        assert!(t.may_retry(&io(), false, &post).await);
        assert!(!t.may_retry(&io(), true, &post).await);

        let stream = prepared(
            &client,
            Method::PUT,
            RequestBody::stream(std::io::Cursor::new(b"abc".to_vec()), None),
        );
        stream.body.lock().await.chunk().await.unwrap();
        assert!(!t.may_retry(&io(), true, &stream).await);
    }

    #[test]
    fn test_default_response_header_timeout() {
        let client = Client::new().unwrap();
        let t = &client.inner.timeouts;
        assert_eq!(t.ttfb, None);
        assert_eq!(t.response_header(), Duration::from_secs(300));
        assert_eq!(t.pool_idle_or_default(), Duration::from_secs(90));
    }
}
