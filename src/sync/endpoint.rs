//! Endpoint registry.
//!
//! Queries and mutations are declared up front with their fetch/mutate
//! functions and tag rules. Registration is bookkeeping only: nothing is
//! fetched and no cache entry is created until a consumer asks for data.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::{ApiError, SyncError};
use super::keys::{CacheKey, Tag};
use super::lock::{rw_read, rw_write};
use super::patch::Draft;

const SOURCE: &str = "sync::endpoint";

/// Future returned by fetch and mutate functions.
pub type ApiFuture<T> = BoxFuture<'static, Result<T, ApiError>>;

type FetchFn<P, T> = Arc<dyn Fn(P) -> ApiFuture<T> + Send + Sync>;
type ProvidesFn<P, T> = Arc<dyn Fn(&T, &P) -> Vec<Tag> + Send + Sync>;
type KeyFn<P> = Arc<dyn Fn(&P) -> String + Send + Sync>;
type MutateFn<A, R> = Arc<dyn Fn(A) -> ApiFuture<R> + Send + Sync>;
type OptimisticFn<A> = Arc<dyn Fn(&A, &mut Draft<'_>) + Send + Sync>;
type InvalidatesFn<A, R> = Arc<dyn Fn(Option<&R>, Option<&ApiError>, &A) -> Vec<Tag> + Send + Sync>;

pub(crate) type ErasedFetch =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, SyncError>> + Send + Sync>;
pub(crate) type ErasedProvides = Arc<dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync>;

// ============================================================================
// Queries
// ============================================================================

/// Declaration of a read endpoint with parameters `P` and result `T`.
pub struct QueryEndpoint<P, T> {
    name: String,
    fetch: FetchFn<P, T>,
    provides: ProvidesFn<P, T>,
    key_fn: Option<KeyFn<P>>,
}

impl<P, T> QueryEndpoint<P, T>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            fetch: Arc::new(move |params| fetch(params).boxed()),
            provides: Arc::new(|_, _| Vec::new()),
            key_fn: None,
        }
    }

    /// Tags attached to the entry when it first resolves.
    pub fn provides_tags<F>(mut self, provides: F) -> Self
    where
        F: Fn(&T, &P) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides = Arc::new(provides);
        self
    }

    /// Replace the default parameter serialization used to build cache keys.
    pub fn key_with<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&P) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    fn erase(self) -> (ErasedQuery, QueryHandle<P, T>) {
        let name: Arc<str> = Arc::from(self.name.as_str());

        let fetch = self.fetch;
        let fetch_name = Arc::clone(&name);
        let erased_fetch: ErasedFetch = Arc::new(move |params: Value| {
            let endpoint = Arc::clone(&fetch_name);
            let fetch = Arc::clone(&fetch);
            async move {
                let params: P = serde_json::from_value(params)
                    .map_err(|err| SyncError::codec(&endpoint, err))?;
                let result = fetch(params)
                    .await
                    .map_err(|source| SyncError::fetch(&endpoint, source))?;
                serde_json::to_value(result).map_err(|err| SyncError::codec(&endpoint, err))
            }
            .boxed()
        });

        let provides = self.provides;
        let provides_name = Arc::clone(&name);
        let erased_provides: ErasedProvides = Arc::new(move |data: &Value, params: &Value| {
            let data = serde_json::from_value::<T>(data.clone());
            let params = serde_json::from_value::<P>(params.clone());
            match (data, params) {
                (Ok(data), Ok(params)) => provides(&data, &params),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(
                        endpoint = %provides_name,
                        error = %err,
                        "provides_tags skipped: payload did not decode"
                    );
                    Vec::new()
                }
            }
        });

        let handle = QueryHandle {
            name: Arc::clone(&name),
            key_fn: self.key_fn,
            _marker: PhantomData,
        };
        let erased = ErasedQuery {
            name,
            fetch: erased_fetch,
            provides: erased_provides,
        };
        (erased, handle)
    }
}

/// Type-erased query kept by the registry so entries can be refetched by key.
pub(crate) struct ErasedQuery {
    pub name: Arc<str>,
    pub fetch: ErasedFetch,
    pub provides: ErasedProvides,
}

/// Typed handle to a registered query.
pub struct QueryHandle<P, T> {
    name: Arc<str>,
    key_fn: Option<KeyFn<P>>,
    _marker: PhantomData<fn(P) -> T>,
}

impl<P, T> Clone for QueryHandle<P, T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            key_fn: self.key_fn.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P: Serialize, T> QueryHandle<P, T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_key(&self, params: &P) -> Result<CacheKey, SyncError> {
        self.locate(params).map(|(key, _)| key)
    }

    /// Cache key and JSON parameters for a call.
    pub(crate) fn locate(&self, params: &P) -> Result<(CacheKey, Value), SyncError> {
        let value = serde_json::to_value(params).map_err(|err| SyncError::codec(&self.name, err))?;
        let key = match &self.key_fn {
            Some(key_fn) => CacheKey::new(&self.name, key_fn(params)),
            None => CacheKey::from_params(&self.name, &value),
        };
        Ok((key, value))
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// Declaration of a write endpoint with arguments `A` and result `R`.
pub struct MutationEndpoint<A, R> {
    pub(crate) name: String,
    pub(crate) mutate: MutateFn<A, R>,
    pub(crate) optimistic: Option<OptimisticFn<A>>,
    pub(crate) invalidates: InvalidatesFn<A, R>,
    pub(crate) key_fn: Option<KeyFn<A>>,
}

impl<A, R> MutationEndpoint<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, mutate: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            mutate: Arc::new(move |args| mutate(args).boxed()),
            optimistic: None,
            invalidates: Arc::new(|_, _, _| Vec::new()),
            key_fn: None,
        }
    }

    /// Local cache edit applied before the server answers.
    ///
    /// Runs synchronously while the cache is held; it must not call back into
    /// the client.
    pub fn optimistic<F>(mut self, patch: F) -> Self
    where
        F: Fn(&A, &mut Draft<'_>) + Send + Sync + 'static,
    {
        self.optimistic = Some(Arc::new(patch));
        self
    }

    /// Tags to invalidate once the mutation settles.
    pub fn invalidates_tags<F>(mut self, invalidates: F) -> Self
    where
        F: Fn(Option<&R>, Option<&ApiError>, &A) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.invalidates = Arc::new(invalidates);
        self
    }

    /// Track the latest invocation status under a key derived from the args.
    pub fn key_with<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub(crate) fn tracking_key(&self, args: &A) -> Option<CacheKey> {
        self.key_fn
            .as_ref()
            .map(|key_fn| CacheKey::new(&self.name, key_fn(args)))
    }
}

/// Typed handle to a registered mutation.
pub struct MutationHandle<A, R> {
    endpoint: Arc<MutationEndpoint<A, R>>,
}

impl<A, R> Clone for MutationHandle<A, R> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
        }
    }
}

impl<A, R> MutationHandle<A, R> {
    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub(crate) fn endpoint(&self) -> &MutationEndpoint<A, R> {
        &self.endpoint
    }
}

/// Registry summary of a mutation.
#[derive(Debug, Clone)]
pub struct MutationInfo {
    pub name: Arc<str>,
    pub optimistic: bool,
}

// ============================================================================
// Registry
// ============================================================================

/// Named queries and mutations known to a client.
#[derive(Default)]
pub struct EndpointRegistry {
    queries: RwLock<HashMap<Arc<str>, Arc<ErasedQuery>>>,
    mutations: RwLock<HashMap<Arc<str>, MutationInfo>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_query<P, T>(
        &self,
        endpoint: QueryEndpoint<P, T>,
    ) -> Result<QueryHandle<P, T>, SyncError>
    where
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut queries = rw_write(&self.queries, SOURCE, "register_query");
        if queries.contains_key(endpoint.name.as_str()) || self.has_mutation(&endpoint.name) {
            return Err(SyncError::duplicate_endpoint(&endpoint.name));
        }

        let (erased, handle) = endpoint.erase();
        debug!(endpoint = %erased.name, "Query endpoint registered");
        queries.insert(Arc::clone(&erased.name), Arc::new(erased));
        Ok(handle)
    }

    pub fn register_mutation<A, R>(
        &self,
        endpoint: MutationEndpoint<A, R>,
    ) -> Result<MutationHandle<A, R>, SyncError>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        if self.has_query(&endpoint.name) {
            return Err(SyncError::duplicate_endpoint(&endpoint.name));
        }
        let mut mutations = rw_write(&self.mutations, SOURCE, "register_mutation");
        if mutations.contains_key(endpoint.name.as_str()) {
            return Err(SyncError::duplicate_endpoint(&endpoint.name));
        }

        let name: Arc<str> = Arc::from(endpoint.name.as_str());
        let info = MutationInfo {
            name: Arc::clone(&name),
            optimistic: endpoint.optimistic.is_some(),
        };
        debug!(endpoint = %name, optimistic = info.optimistic, "Mutation endpoint registered");
        mutations.insert(name, info);
        Ok(MutationHandle {
            endpoint: Arc::new(endpoint),
        })
    }

    pub(crate) fn query(&self, name: &str) -> Option<Arc<ErasedQuery>> {
        rw_read(&self.queries, SOURCE, "query").get(name).cloned()
    }

    pub fn mutation(&self, name: &str) -> Option<MutationInfo> {
        rw_read(&self.mutations, SOURCE, "mutation").get(name).cloned()
    }

    pub fn has_query(&self, name: &str) -> bool {
        rw_read(&self.queries, SOURCE, "has_query").contains_key(name)
    }

    pub fn has_mutation(&self, name: &str) -> bool {
        rw_read(&self.mutations, SOURCE, "has_mutation").contains_key(name)
    }

    /// Registered query names, sorted.
    pub fn query_names(&self) -> Vec<String> {
        let mut names: Vec<String> = rw_read(&self.queries, SOURCE, "query_names")
            .keys()
            .map(|name| name.to_string())
            .collect();
        names.sort();
        names
    }

    /// Registered mutation names, sorted.
    pub fn mutation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = rw_read(&self.mutations, SOURCE, "mutation_names")
            .keys()
            .map(|name| name.to_string())
            .collect();
        names.sort();
        names
    }
}
