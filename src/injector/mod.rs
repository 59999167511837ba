//! The injector: a scope-bound container over one resolved provider list.
//!
//! One injector exists per scope level (application, module, route,
//! request), chained to its parent. Lookup walks the chain rootward;
//! construction is lazy and the result is cached **at the level that owns
//! the provider**, so a token resolvable at two levels yields two
//! independent singletons. Parent and child never share a cache.
//!
//! Construction is depth-first over each factory's declared dependency
//! slots. A chain that revisits a token in flight fails with the full path.
//! Graphs containing async constructors resolve through [`Injector::get_async`],
//! where concurrent requests for one uncached token converge on a single
//! shared in-flight construction.
//!
//! Rebuilding a scope (dynamic module add/remove) means resolving a fresh
//! provider list into a new injector; the old cache is dropped wholesale,
//! never patched.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{DiError, DiResult};
use crate::metadata::{InjectArg, MetadataStore};
use crate::provider::Providers;
use crate::resolver::{
    resolve_providers, Construct, Dependency, ResolvedFactory, ResolvedProvider,
};
use crate::token::{intern, AnyArc, DefaultFn, DualKey, TokenId};

type SharedBuild = Shared<BoxFuture<'static, DiResult<AnyArc>>>;

enum Slot {
    Ready(AnyArc),
    InFlight(SharedBuild),
    Failed(DiError),
}

enum Checked {
    Hit(DiResult<AnyArc>),
    Wait(SharedBuild),
    Created(SharedBuild),
}

/// A runtime container bound to one resolved provider list and an optional
/// parent.
///
/// # Examples
///
/// ```rust
/// use trellis_di::{Injector, MetadataStore, Providers, Token};
///
/// let store = MetadataStore::new();
/// let providers = Providers::new().value(Token::str("PORT"), 8080u16);
/// let injector = Injector::resolve_and_create(providers, &store, None).unwrap();
///
/// let port = injector.get_as::<u16>(Token::str("PORT")).unwrap();
/// assert_eq!(*port, 8080);
/// ```
pub struct Injector {
    records: HashMap<TokenId, ResolvedProvider>,
    parent: Option<Arc<Injector>>,
    cache: Mutex<HashMap<TokenId, Slot>>,
    weak: Weak<Injector>,
}

impl Injector {
    /// Resolves `providers` (see [`resolve_providers`]) and returns a new
    /// injector bound to that list and to `parent`.
    ///
    /// When a parent is supplied the full visible chain is known, so every
    /// required, non-defaulted dependency is checked for satisfiability
    /// here, before anything is instantiated. Root-level creation defers
    /// that check to first resolution, since the chain above it is unknown
    /// at this point.
    pub fn resolve_and_create(
        providers: Providers,
        store: &MetadataStore,
        parent: Option<Arc<Injector>>,
    ) -> DiResult<Arc<Injector>> {
        let resolved = resolve_providers(providers, store)?;
        let mut records = HashMap::with_capacity(resolved.len());
        for record in resolved {
            records.insert(record.key(), record);
        }
        debug!(
            tokens = records.len(),
            chained = parent.is_some(),
            "injector created"
        );
        let injector = Arc::new_cyclic(|weak| Injector {
            records,
            parent,
            cache: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        });
        if injector.parent.is_some() {
            injector.check_satisfiable()?;
        }
        Ok(injector)
    }

    /// The parent injector, if any.
    pub fn parent(&self) -> Option<&Arc<Injector>> {
        self.parent.as_ref()
    }

    /// Number of tokens declared at this level.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the token is declared anywhere in the visible chain.
    pub fn has_token(&self, key: impl Into<DualKey>) -> bool {
        self.has(intern(key.into()))
    }

    fn has(&self, id: TokenId) -> bool {
        self.records.contains_key(&id)
            || self.parent.as_deref().map_or(false, |p| p.has(id))
    }

    fn owner(&self, id: TokenId) -> Option<&Injector> {
        if self.records.contains_key(&id) {
            Some(self)
        } else {
            self.parent.as_deref()?.owner(id)
        }
    }

    fn strong(&self) -> Arc<Injector> {
        self.weak.upgrade().expect("injector accessed while alive")
    }

    // ----- Synchronous resolution -----

    /// Resolves a token: cached instance if present, otherwise the owning
    /// record is located (own list first, then the parent chain),
    /// constructed depth-first, cached at the owning level, and returned.
    ///
    /// A missing required token fails with [`DiError::NoProvider`]; a token
    /// carrying a default-value factory constructs the default and caches
    /// it at this level. Multi tokens come back as a type-erased
    /// `Vec<AnyArc>` (see [`Injector::get_multi`]).
    pub fn get(&self, key: impl Into<DualKey>) -> DiResult<AnyArc> {
        let id = intern(key.into());
        let mut path = Vec::new();
        self.lookup_and_construct(id, &mut path, None)
    }

    /// Resolves and downcasts a token.
    pub fn get_as<T: Send + Sync + 'static>(&self, key: impl Into<DualKey>) -> DiResult<Arc<T>> {
        self.get(key)?
            .downcast::<T>()
            .map_err(|_| DiError::TypeMismatch(std::any::type_name::<T>()))
    }

    /// Resolves a concrete type registered under its own type token.
    pub fn get_of<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.get_as::<T>(crate::token::key_of::<T>())
    }

    /// Resolves a multi token into its contributions, registration order
    /// preserved. A declared multi token with no contributors yields an
    /// empty vector.
    pub fn get_multi(&self, key: impl Into<DualKey>) -> DiResult<Vec<AnyArc>> {
        let value = self.get(key)?;
        value
            .downcast::<Vec<AnyArc>>()
            .map(|v| (*v).clone())
            .map_err(|_| DiError::TypeMismatch("multi token"))
    }

    /// Resolves a multi token and downcasts every element.
    pub fn get_multi_as<T: Send + Sync + 'static>(
        &self,
        key: impl Into<DualKey>,
    ) -> DiResult<Vec<Arc<T>>> {
        self.get_multi(key)?
            .into_iter()
            .map(|v| {
                v.downcast::<T>()
                    .map_err(|_| DiError::TypeMismatch(std::any::type_name::<T>()))
            })
            .collect()
    }

    /// Constructs a resolved provider without caching the result.
    ///
    /// Dependencies still resolve (and cache) through the normal chain;
    /// only the provider's own value bypasses the cache. This is the
    /// per-call construction path guard and interceptor execution uses.
    pub fn instantiate_resolved(&self, record: &ResolvedProvider) -> DiResult<AnyArc> {
        let mut path = Vec::new();
        self.construct_record(record, &mut path)
    }

    fn lookup_and_construct(
        &self,
        id: TokenId,
        path: &mut Vec<TokenId>,
        requester: Option<&str>,
    ) -> DiResult<AnyArc> {
        if let Some(owner) = self.owner(id) {
            return owner.construct_cached(id, path);
        }
        if let Some(default) = id.default_factory() {
            return Ok(self.cache_default(id, default));
        }
        Err(DiError::NoProvider {
            token: id.display_name(),
            requester: requester.map(str::to_string),
        })
    }

    fn construct_cached(&self, id: TokenId, path: &mut Vec<TokenId>) -> DiResult<AnyArc> {
        {
            let cache = self.cache.lock();
            match cache.get(&id) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::Failed(error)) => return Err(error.clone()),
                Some(Slot::InFlight(_)) => {
                    return if path.contains(&id) {
                        Err(circular_error(path, id))
                    } else {
                        Err(DiError::AsyncConstruction(id.display_name()))
                    };
                }
                None => {}
            }
        }
        if path.contains(&id) {
            return Err(circular_error(path, id));
        }
        path.push(id);
        trace!(token = %id, "constructing");
        let record = self.records.get(&id).expect("owner holds record");
        let result = self.construct_record(record, path);
        path.pop();
        let value = result?;

        let mut cache = self.cache.lock();
        // Converge on the instance another caller finished first.
        if let Some(Slot::Ready(existing)) = cache.get(&id) {
            return Ok(existing.clone());
        }
        cache.insert(id, Slot::Ready(value.clone()));
        Ok(value)
    }

    fn construct_record(
        &self,
        record: &ResolvedProvider,
        path: &mut Vec<TokenId>,
    ) -> DiResult<AnyArc> {
        if record.multi {
            let mut values = Vec::with_capacity(record.factories.len());
            for factory in &record.factories {
                values.push(self.construct_factory(record, factory, path)?);
            }
            return Ok(Arc::new(values) as AnyArc);
        }
        let factory = record.factories.first().ok_or_else(|| DiError::NoProvider {
            token: record.name.clone(),
            requester: None,
        })?;
        self.construct_factory(record, factory, path)
    }

    fn construct_factory(
        &self,
        record: &ResolvedProvider,
        factory: &ResolvedFactory,
        path: &mut Vec<TokenId>,
    ) -> DiResult<AnyArc> {
        match &factory.construct {
            Construct::Value(value) => Ok(value.clone()),
            Construct::Sync(ctor) => {
                let args = self.resolve_deps(record, factory, path)?;
                ctor(&args)
            }
            Construct::Async(_) => Err(DiError::AsyncConstruction(record.name.clone())),
            Construct::Alias(target) => {
                self.lookup_and_construct(*target, path, Some(record.name.as_str()))
            }
            Construct::Method { host, func } => {
                let host_value =
                    self.lookup_and_construct(*host, path, Some(record.name.as_str()))?;
                let args = self.resolve_deps(record, factory, path)?;
                func(host_value, &args)
            }
        }
    }

    fn resolve_deps(
        &self,
        record: &ResolvedProvider,
        factory: &ResolvedFactory,
        path: &mut Vec<TokenId>,
    ) -> DiResult<Vec<InjectArg>> {
        factory
            .deps
            .iter()
            .map(|dep| self.resolve_dep(record, dep, path))
            .collect()
    }

    fn resolve_dep(
        &self,
        record: &ResolvedProvider,
        dep: &Dependency,
        path: &mut Vec<TokenId>,
    ) -> DiResult<InjectArg> {
        if dep.from_self {
            if self.records.contains_key(&dep.key) {
                return Ok(Some(self.construct_cached(dep.key, path)?));
            }
            if dep.optional {
                return Ok(None);
            }
            return Err(self.missing(dep, record));
        }

        let start = if dep.skip_self {
            self.parent.as_deref()
        } else {
            Some(self)
        };
        if let Some(injector) = start {
            if let Some(owner) = injector.owner(dep.key) {
                return Ok(Some(owner.construct_cached(dep.key, path)?));
            }
        }
        if let Some(default) = dep.key.default_factory() {
            return Ok(Some(self.cache_default(dep.key, default)));
        }
        if dep.optional {
            return Ok(None);
        }
        Err(self.missing(dep, record))
    }

    fn missing(&self, dep: &Dependency, record: &ResolvedProvider) -> DiError {
        DiError::NoProvider {
            token: dep.key.display_name(),
            requester: Some(record.name.clone()),
        }
    }

    // Defaults are owned by the token, not any provider list, so they cache
    // at the level that asked.
    fn cache_default(&self, id: TokenId, default: DefaultFn) -> AnyArc {
        {
            let cache = self.cache.lock();
            if let Some(Slot::Ready(value)) = cache.get(&id) {
                return value.clone();
            }
        }
        let value = default();
        let mut cache = self.cache.lock();
        if let Some(Slot::Ready(existing)) = cache.get(&id) {
            return existing.clone();
        }
        cache.insert(id, Slot::Ready(value.clone()));
        value
    }

    fn check_satisfiable(&self) -> DiResult<()> {
        for record in self.records.values() {
            for factory in &record.factories {
                for dep in &factory.deps {
                    if dep.optional || dep.key.default_factory().is_some() {
                        continue;
                    }
                    let visible = if dep.from_self {
                        self.records.contains_key(&dep.key)
                    } else if dep.skip_self {
                        self.parent.as_deref().map_or(false, |p| p.has(dep.key))
                    } else {
                        self.has(dep.key)
                    };
                    if !visible {
                        return Err(self.missing(dep, record));
                    }
                }
                let referenced = match &factory.construct {
                    Construct::Alias(target) => Some(*target),
                    Construct::Method { host, .. } => Some(*host),
                    _ => None,
                };
                if let Some(id) = referenced {
                    if !self.has(id) && id.default_factory().is_none() {
                        return Err(DiError::NoProvider {
                            token: id.display_name(),
                            requester: Some(record.name.clone()),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ----- Asynchronous resolution -----

    /// Resolves a token through a graph that may contain async
    /// constructors.
    ///
    /// Concurrent calls for one not-yet-cached token converge on a single
    /// in-flight construction: the pending future itself is cached, not
    /// just the eventual value, so a constructor's side effects run at most
    /// once per (token, level) even under interleaving.
    pub async fn get_async(&self, key: impl Into<DualKey>) -> DiResult<AnyArc> {
        let id = intern(key.into());
        lookup_async(self.strong(), id, Vec::new(), None).await
    }

    /// Async counterpart of [`Injector::get_as`].
    pub async fn get_async_as<T: Send + Sync + 'static>(
        &self,
        key: impl Into<DualKey>,
    ) -> DiResult<Arc<T>> {
        self.get_async(key)
            .await?
            .downcast::<T>()
            .map_err(|_| DiError::TypeMismatch(std::any::type_name::<T>()))
    }

    #[cfg(feature = "diagnostics")]
    pub fn to_debug_string(&self) -> String {
        let mut s = String::new();
        s.push_str("=== Injector Debug ===\n");
        for record in self.records.values() {
            s.push_str(&format!(
                "  {}: {} factories, multi={}\n",
                record.name,
                record.factories.len(),
                record.multi
            ));
        }
        s
    }
}

fn circular_error(path: &[TokenId], id: TokenId) -> DiError {
    let mut names: Vec<String> = path.iter().map(|t| t.display_name()).collect();
    names.push(id.display_name());
    DiError::Circular(names)
}

fn owner_arc(start: &Arc<Injector>, id: TokenId) -> Option<Arc<Injector>> {
    let mut current = start.clone();
    loop {
        if current.records.contains_key(&id) {
            return Some(current);
        }
        let next = current.parent.clone()?;
        current = next;
    }
}

fn lookup_async(
    this: Arc<Injector>,
    id: TokenId,
    path: Vec<TokenId>,
    requester: Option<String>,
) -> BoxFuture<'static, DiResult<AnyArc>> {
    async move {
        if let Some(owner) = owner_arc(&this, id) {
            return construct_cached_async(owner, id, path).await;
        }
        if let Some(default) = id.default_factory() {
            return Ok(this.cache_default(id, default));
        }
        Err(DiError::NoProvider {
            token: id.display_name(),
            requester,
        })
    }
    .boxed()
}

fn construct_cached_async(
    this: Arc<Injector>,
    id: TokenId,
    path: Vec<TokenId>,
) -> BoxFuture<'static, DiResult<AnyArc>> {
    async move {
    let checked = {
        let mut cache = this.cache.lock();
        match cache.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(value) => Checked::Hit(Ok(value.clone())),
                Slot::Failed(error) => Checked::Hit(Err(error.clone())),
                Slot::InFlight(shared) => {
                    if path.contains(&id) {
                        Checked::Hit(Err(circular_error(&path, id)))
                    } else {
                        Checked::Wait(shared.clone())
                    }
                }
            },
            std::collections::hash_map::Entry::Vacant(entry) => {
                if path.contains(&id) {
                    Checked::Hit(Err(circular_error(&path, id)))
                } else {
                    let record = this
                        .records
                        .get(&id)
                        .expect("owner holds record")
                        .clone();
                    let mut child_path = path.clone();
                    child_path.push(id);
                    let shared = construct_record_async(this.clone(), record, child_path)
                        .boxed()
                        .shared();
                    entry.insert(Slot::InFlight(shared.clone()));
                    Checked::Created(shared)
                }
            }
        }
    };

    match checked {
        Checked::Hit(result) => result,
        Checked::Wait(shared) => shared.await,
        Checked::Created(shared) => {
            let result = shared.await;
            let mut cache = this.cache.lock();
            match &result {
                Ok(value) => {
                    cache.insert(id, Slot::Ready(value.clone()));
                }
                Err(error) => {
                    cache.insert(id, Slot::Failed(error.clone()));
                }
            }
            result
        }
    }
    }
    .boxed()
}

async fn construct_record_async(
    this: Arc<Injector>,
    record: ResolvedProvider,
    path: Vec<TokenId>,
) -> DiResult<AnyArc> {
    if record.multi {
        let mut values = Vec::with_capacity(record.factories.len());
        for factory in &record.factories {
            values.push(construct_factory_async(&this, &record, factory, &path).await?);
        }
        return Ok(Arc::new(values) as AnyArc);
    }
    let factory = record.factories.first().ok_or_else(|| DiError::NoProvider {
        token: record.name.clone(),
        requester: None,
    })?;
    construct_factory_async(&this, &record, factory, &path).await
}

async fn construct_factory_async(
    this: &Arc<Injector>,
    record: &ResolvedProvider,
    factory: &ResolvedFactory,
    path: &[TokenId],
) -> DiResult<AnyArc> {
    match &factory.construct {
        Construct::Value(value) => Ok(value.clone()),
        Construct::Sync(ctor) => {
            let args = resolve_deps_async(this, record, factory, path).await?;
            ctor(&args)
        }
        Construct::Async(ctor) => {
            let args = resolve_deps_async(this, record, factory, path).await?;
            ctor(args).await
        }
        Construct::Alias(target) => {
            lookup_async(
                this.clone(),
                *target,
                path.to_vec(),
                Some(record.name.clone()),
            )
            .await
        }
        Construct::Method { host, func } => {
            let host_value = lookup_async(
                this.clone(),
                *host,
                path.to_vec(),
                Some(record.name.clone()),
            )
            .await?;
            let args = resolve_deps_async(this, record, factory, path).await?;
            func(host_value, &args)
        }
    }
}

async fn resolve_deps_async(
    this: &Arc<Injector>,
    record: &ResolvedProvider,
    factory: &ResolvedFactory,
    path: &[TokenId],
) -> DiResult<Vec<InjectArg>> {
    let mut args = Vec::with_capacity(factory.deps.len());
    for dep in &factory.deps {
        args.push(resolve_dep_async(this, record, dep, path).await?);
    }
    Ok(args)
}

async fn resolve_dep_async(
    this: &Arc<Injector>,
    record: &ResolvedProvider,
    dep: &Dependency,
    path: &[TokenId],
) -> DiResult<InjectArg> {
    if dep.from_self {
        if this.records.contains_key(&dep.key) {
            return Ok(Some(
                construct_cached_async(this.clone(), dep.key, path.to_vec()).await?,
            ));
        }
        if dep.optional {
            return Ok(None);
        }
        return Err(this.missing(dep, record));
    }

    let start = if dep.skip_self {
        this.parent.clone()
    } else {
        Some(this.clone())
    };
    if let Some(injector) = start {
        if let Some(owner) = owner_arc(&injector, dep.key) {
            return Ok(Some(
                construct_cached_async(owner, dep.key, path.to_vec()).await?,
            ));
        }
    }
    if let Some(default) = dep.key.default_factory() {
        return Ok(Some(this.cache_default(dep.key, default)));
    }
    if dep.optional {
        return Ok(None);
    }
    Err(this.missing(dep, record))
}
