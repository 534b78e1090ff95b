//! Redirect handling for the socket transport.
//!
//! A hop is refused when the chain is longer than the request's redirect
//! limit, when it would leave HTTPS for plain HTTP, or when `same_origin_only`
//! is set and the target is neither same-origin nor allow-listed. A refused
//! hop hands the 3xx back to the adapter, and `validate_status` decides.
//!
//! After the first cross-origin hop, credential headers are removed from
//! every following request.

use super::config::RedirectConfig;
use super::socket::TransportBody;
use http::header::{AUTHORIZATION, COOKIE, HeaderName, PROXY_AUTHORIZATION};
use http::{Request, Uri};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

static CREDENTIAL_HEADERS: [HeaderName; 3] = [AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION];

/// Per-request redirect limit, carried in the request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RedirectLimit(pub(crate) usize);

/// `(scheme, host, port)` with the scheme's default port filled in.
#[derive(Debug, PartialEq, Eq)]
struct Origin<'a> {
    scheme: &'a str,
    host: &'a str,
    port: u16,
}

impl<'a> Origin<'a> {
    fn of(uri: &'a Uri) -> Self {
        let scheme = uri.scheme_str().unwrap_or("https");
        let port = uri.port_u16().unwrap_or(match scheme {
            "http" => 80,
            "https" => 443,
            _ => 0,
        });
        Self {
            scheme,
            host: uri.host().unwrap_or_default(),
            port,
        }
    }

    fn is_secure(&self) -> bool {
        self.scheme == "https"
    }
}

/// Why a hop was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    LimitReached,
    Downgrade,
    CrossOrigin,
}

/// `tower-http` redirect policy enforcing [`RedirectConfig`].
///
/// One instance is cloned per request by `FollowRedirect`, so the hop count
/// and cross-origin flag are per request.
#[derive(Debug, Clone)]
pub struct RedirectGuard {
    config: RedirectConfig,
    limit: Option<usize>,
    hops: usize,
    left_origin: bool,
}

impl RedirectGuard {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        Self {
            config,
            limit: None,
            hops: 0,
            left_origin: false,
        }
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(self.config.max_redirects)
    }

    fn check(&self, from: &Uri, to: &Uri) -> Result<bool, Refusal> {
        if self.hops > self.limit() {
            return Err(Refusal::LimitReached);
        }
        let (from, to_origin) = (Origin::of(from), Origin::of(to));
        if from.is_secure() && !to_origin.is_secure() && !self.config.allow_https_downgrade {
            return Err(Refusal::Downgrade);
        }
        let same_origin = from == to_origin;
        if !same_origin
            && self.config.same_origin_only
            && !self.config.allowed_redirect_hosts.contains(to_origin.host)
        {
            return Err(Refusal::CrossOrigin);
        }
        Ok(same_origin)
    }
}

impl<E> Policy<TransportBody, E> for RedirectGuard {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        self.hops += 1;
        match self.check(attempt.previous(), attempt.location()) {
            Ok(same_origin) => {
                self.left_origin |= !same_origin;
                tracing::debug!(
                    target = %attempt.location(),
                    hop = self.hops,
                    "following redirect"
                );
                Ok(Action::Follow)
            }
            Err(Refusal::LimitReached) => {
                tracing::debug!(limit = self.limit(), "redirect limit reached");
                Ok(Action::Stop)
            }
            Err(reason) => {
                tracing::warn!(
                    from = %attempt.previous(),
                    target = %attempt.location(),
                    ?reason,
                    "redirect refused"
                );
                Ok(Action::Stop)
            }
        }
    }

    fn on_request(&mut self, request: &mut Request<TransportBody>) {
        if self.hops == 0 {
            self.limit = request
                .extensions()
                .get::<RedirectLimit>()
                .map(|RedirectLimit(limit)| *limit);
        }
        if self.left_origin && self.config.strip_sensitive_headers {
            let headers = request.headers_mut();
            for name in &CREDENTIAL_HEADERS {
                headers.remove(name);
            }
        }
    }

    fn clone_body(&self, body: &TransportBody) -> Option<TransportBody> {
        body.try_clone()
    }
}
