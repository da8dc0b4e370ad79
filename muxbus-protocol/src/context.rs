//! Per-call request context.
//!
//! A [`Context`] carries the correlation id, the operation id used to route
//! the reply, the advisory timeout and two header maps: request headers set
//! by the caller and response headers set by the callee.

use crate::headers::Headers;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Correlation id header.
pub const CID_HEADER: &str = "_cid";
/// Operation id header.
pub const OPID_HEADER: &str = "_opid";
/// Timeout header, in milliseconds.
pub const TIMEOUT_HEADER: &str = "_timeout";

/// Timeout applied when none is set (5s).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of operation ids.
pub trait OpIdSource: Send + Sync {
    /// Returns the next operation id.
    fn next_op_id(&self) -> u64;
}

/// Monotonic, atomically incremented operation id allocator.
#[derive(Debug)]
pub struct OpIdAllocator {
    next: AtomicU64,
}

impl OpIdAllocator {
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for OpIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl OpIdSource for OpIdAllocator {
    fn next_op_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Creates contexts from an injected operation id source.
#[derive(Clone)]
pub struct ContextFactory {
    ids: Arc<dyn OpIdSource>,
}

impl ContextFactory {
    pub fn new(ids: Arc<dyn OpIdSource>) -> Self {
        Self { ids }
    }

    /// Returns the process-wide factory used by [`Context::new`].
    pub fn shared() -> &'static ContextFactory {
        static SHARED: OnceLock<ContextFactory> = OnceLock::new();
        SHARED.get_or_init(|| ContextFactory::new(Arc::new(OpIdAllocator::new())))
    }

    /// Creates a context. An empty correlation id is replaced by a random one.
    pub fn create(&self, correlation_id: &str) -> Context {
        let cid = if correlation_id.is_empty() {
            generate_correlation_id()
        } else {
            correlation_id.to_string()
        };

        let mut request = Headers::new();
        request.insert(CID_HEADER.to_string(), cid);
        request.insert(
            TIMEOUT_HEADER.to_string(),
            DEFAULT_TIMEOUT.as_millis().to_string(),
        );

        Context {
            op_id: AtomicU64::new(self.ids.next_op_id()),
            request: RwLock::new(request),
            response: RwLock::new(Headers::new()),
            factory: self.clone(),
        }
    }
}

impl std::fmt::Debug for ContextFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextFactory").finish_non_exhaustive()
    }
}

fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Request context for one logical call.
///
/// All accessors take `&self` and are safe to call concurrently. Header
/// getters return copies, so callers cannot mutate internal state.
pub struct Context {
    op_id: AtomicU64,
    request: RwLock<Headers>,
    response: RwLock<Headers>,
    factory: ContextFactory,
}

impl Context {
    /// Creates a context using the shared factory.
    pub fn new(correlation_id: &str) -> Self {
        ContextFactory::shared().create(correlation_id)
    }

    /// Rebuilds the callee-side context from decoded request headers.
    ///
    /// The wire operation id is kept and mirrored into the response headers
    /// so the reply is routed back to the caller.
    pub(crate) fn from_request(op_id: u64, mut headers: Headers) -> Self {
        headers.remove(OPID_HEADER);
        if !headers.contains_key(CID_HEADER) {
            headers.insert(CID_HEADER.to_string(), generate_correlation_id());
        }
        let cid = headers.get(CID_HEADER).cloned().unwrap_or_default();

        let mut response = Headers::new();
        response.insert(OPID_HEADER.to_string(), op_id.to_string());
        response.insert(CID_HEADER.to_string(), cid);

        Self {
            op_id: AtomicU64::new(op_id),
            request: RwLock::new(headers),
            response: RwLock::new(response),
            factory: ContextFactory::shared().clone(),
        }
    }

    /// Returns the correlation id.
    pub fn correlation_id(&self) -> String {
        self.request
            .read()
            .get(CID_HEADER)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the operation id.
    pub fn op_id(&self) -> u64 {
        self.op_id.load(Ordering::Acquire)
    }

    /// Sets a request header, overwriting any previous value.
    pub fn add_request_header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        let name = name.into();
        if name == OPID_HEADER {
            tracing::warn!("ignoring attempt to overwrite reserved header {}", OPID_HEADER);
            return self;
        }
        self.request.write().insert(name, value.into());
        self
    }

    /// Sets a response header, overwriting any previous value.
    pub fn add_response_header(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &Self {
        let name = name.into();
        if name == OPID_HEADER {
            tracing::warn!("ignoring attempt to overwrite reserved header {}", OPID_HEADER);
            return self;
        }
        self.response.write().insert(name, value.into());
        self
    }

    pub fn request_header(&self, name: &str) -> Option<String> {
        if name == OPID_HEADER {
            return Some(self.op_id().to_string());
        }
        self.request.read().get(name).cloned()
    }

    pub fn response_header(&self, name: &str) -> Option<String> {
        self.response.read().get(name).cloned()
    }

    /// Returns a copy of the request headers, operation id included.
    pub fn request_headers(&self) -> Headers {
        let mut headers = self.request.read().clone();
        headers.insert(OPID_HEADER.to_string(), self.op_id().to_string());
        headers
    }

    /// Returns a copy of the response headers.
    pub fn response_headers(&self) -> Headers {
        self.response.read().clone()
    }

    /// Sets the advisory timeout carried in the `_timeout` header.
    pub fn set_timeout(&self, timeout: Duration) -> &Self {
        self.request
            .write()
            .insert(TIMEOUT_HEADER.to_string(), timeout.as_millis().to_string());
        self
    }

    /// Returns the timeout, or [`DEFAULT_TIMEOUT`] if absent or unparsable.
    pub fn timeout(&self) -> Duration {
        self.request
            .read()
            .get(TIMEOUT_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Copies this context for a new call with a fresh operation id.
    pub fn fork(&self) -> Context {
        let mut response = self.response.read().clone();
        response.remove(OPID_HEADER);
        Context {
            op_id: AtomicU64::new(self.factory.ids.next_op_id()),
            request: RwLock::new(self.request.read().clone()),
            response: RwLock::new(response),
            factory: self.factory.clone(),
        }
    }

    /// Merges decoded response headers, leaving the operation id untouched.
    pub(crate) fn merge_response_headers(&self, headers: Headers) {
        let mut response = self.response.write();
        for (name, value) in headers {
            if name != OPID_HEADER {
                response.insert(name, value);
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("op_id", &self.op_id())
            .field("correlation_id", &self.correlation_id())
            .field("timeout", &self.timeout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn factory_from(first: u64) -> ContextFactory {
        ContextFactory::new(Arc::new(OpIdAllocator::starting_at(first)))
    }

    #[test]
    fn test_create_context() {
        let factory = factory_from(100);
        let ctx = factory.create("cid-1");

        assert_eq!(ctx.correlation_id(), "cid-1");
        assert_eq!(ctx.op_id(), 100);
        assert_eq!(ctx.timeout(), DEFAULT_TIMEOUT);

        let headers = ctx.request_headers();
        assert_eq!(headers.get(CID_HEADER).map(String::as_str), Some("cid-1"));
        assert_eq!(headers.get(OPID_HEADER).map(String::as_str), Some("100"));
        assert_eq!(headers.get(TIMEOUT_HEADER).map(String::as_str), Some("5000"));
    }

    #[test]
    fn test_generated_correlation_id() {
        let factory = factory_from(1);
        let a = factory.create("");
        let b = factory.create("");
        assert_eq!(a.correlation_id().len(), 32);
        assert_ne!(a.correlation_id(), b.correlation_id());
    }

    #[test]
    fn test_op_ids_increase() {
        let factory = factory_from(7);
        let ids: Vec<u64> = (0..3).map(|_| factory.create("x").op_id()).collect();
        assert_eq!(ids, vec![7, 8, 9]);
    }

    #[test]
    fn test_shared_factory_unique_ids() {
        let a = Context::new("a");
        let b = Context::new("b");
        assert!(b.op_id() > a.op_id());
    }

    #[test]
    fn test_headers_overwrite_and_chain() {
        let ctx = factory_from(1).create("cid");
        ctx.add_request_header("foo", "1")
            .add_request_header("foo", "2")
            .add_request_header("bar", "3");
        ctx.add_response_header("status", "ok");

        assert_eq!(ctx.request_header("foo").as_deref(), Some("2"));
        assert_eq!(ctx.request_header("bar").as_deref(), Some("3"));
        assert_eq!(ctx.response_header("status").as_deref(), Some("ok"));
        assert!(ctx.response_header("missing").is_none());
    }

    #[test]
    fn test_reserved_opid_not_overwritten() {
        let ctx = factory_from(5).create("cid");
        ctx.add_request_header(OPID_HEADER, "999");
        assert_eq!(ctx.op_id(), 5);
        assert_eq!(ctx.request_header(OPID_HEADER).as_deref(), Some("5"));
    }

    #[test]
    fn test_header_getters_return_copies() {
        let ctx = factory_from(1).create("cid");
        let mut copy = ctx.request_headers();
        copy.insert("injected".to_string(), "x".to_string());
        assert!(ctx.request_header("injected").is_none());

        let mut response = ctx.response_headers();
        response.insert("injected".to_string(), "x".to_string());
        assert!(ctx.response_header("injected").is_none());
    }

    #[test]
    fn test_timeout() {
        let ctx = factory_from(1).create("cid");
        ctx.set_timeout(Duration::from_millis(1500));
        assert_eq!(ctx.timeout(), Duration::from_millis(1500));
        assert_eq!(ctx.request_header(TIMEOUT_HEADER).as_deref(), Some("1500"));

        ctx.add_request_header(TIMEOUT_HEADER, "not-a-number");
        assert_eq!(ctx.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_fork_assigns_fresh_op_id() {
        let factory = factory_from(10);
        let ctx = factory.create("cid");
        ctx.add_request_header("foo", "bar");
        ctx.add_response_header("status", "done");

        let forked = ctx.fork();
        assert_eq!(forked.op_id(), 11);
        assert_eq!(forked.correlation_id(), "cid");
        assert_eq!(forked.request_header("foo").as_deref(), Some("bar"));
        assert_eq!(forked.response_header("status").as_deref(), Some("done"));

        // Independent maps after the fork
        forked.add_request_header("foo", "changed");
        assert_eq!(ctx.request_header("foo").as_deref(), Some("bar"));
    }

    #[test]
    fn test_from_request_mirrors_op_id() {
        let mut headers = Headers::new();
        headers.insert(CID_HEADER.to_string(), "remote".to_string());
        headers.insert(OPID_HEADER.to_string(), "77".to_string());
        headers.insert("trace".to_string(), "t".to_string());

        let ctx = Context::from_request(77, headers);
        assert_eq!(ctx.op_id(), 77);
        assert_eq!(ctx.correlation_id(), "remote");
        assert_eq!(ctx.request_header("trace").as_deref(), Some("t"));
        assert_eq!(ctx.response_header(OPID_HEADER).as_deref(), Some("77"));
        assert_eq!(ctx.response_header(CID_HEADER).as_deref(), Some("remote"));
    }

    #[test]
    fn test_merge_response_headers_skips_opid() {
        let ctx = factory_from(3).create("cid");
        let mut headers = Headers::new();
        headers.insert(OPID_HEADER.to_string(), "999".to_string());
        headers.insert("status".to_string(), "ok".to_string());
        ctx.merge_response_headers(headers);

        assert_eq!(ctx.response_header("status").as_deref(), Some("ok"));
        assert!(ctx.response_header(OPID_HEADER).is_none());
        assert_eq!(ctx.op_id(), 3);
    }

    #[test]
    fn test_concurrent_access() {
        let ctx = Arc::new(factory_from(1).create("cid"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        ctx.add_request_header(format!("k{}", i), j.to_string());
                        let _ = ctx.request_headers();
                        ctx.add_response_header(format!("r{}", i), j.to_string());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let keys: HashSet<String> = ctx.request_headers().into_keys().collect();
        for i in 0..8 {
            assert!(keys.contains(&format!("k{}", i)));
            assert_eq!(ctx.response_header(&format!("r{}", i)).as_deref(), Some("99"));
        }
    }
}
