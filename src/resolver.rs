//! Provider resolution: normalizing an ordered provider list into
//! per-token [`ResolvedProvider`] records.
//!
//! Resolution is a left-to-right fold over the flattened list. For a given
//! key the last non-multi registration wins; multi registrations append in
//! declaration order; mixing the two on one key is an error. Each surviving
//! factory's dependency list is derived from the metadata store one level
//! deep; transitive resolution is deferred to the injector so forward
//! references and later overrides need not exist yet.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{DiError, DiResult};
use crate::metadata::{AsyncCtor, Ctor, MetadataStore, MethodFn, ParamMeta, SyncCtor};
use crate::provider::{Provide, Providers};
use crate::token::{intern, AnyArc, DualKey, Token, TokenId};

/// One dependency slot of a resolved factory.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub key: TokenId,
    pub optional: bool,
    pub skip_self: bool,
    pub from_self: bool,
}

impl Dependency {
    fn from_param(param: &ParamMeta) -> Self {
        Self {
            key: intern(param.key.clone()),
            optional: param.optional,
            skip_self: param.skip_self,
            from_self: param.from_self,
        }
    }
}

/// How a resolved factory produces its value.
#[derive(Clone)]
pub(crate) enum Construct {
    Value(AnyArc),
    Sync(SyncCtor),
    Async(AsyncCtor),
    Alias(TokenId),
    Method { host: TokenId, func: MethodFn },
}

/// One construction strategy plus its dependency slots.
#[derive(Clone)]
pub struct ResolvedFactory {
    pub(crate) construct: Construct,
    pub(crate) deps: Vec<Dependency>,
}

impl ResolvedFactory {
    pub fn deps(&self) -> &[Dependency] {
        &self.deps
    }

    pub(crate) fn is_async(&self) -> bool {
        matches!(self.construct, Construct::Async(_))
    }
}

/// The normalized record for one token: its interned key and one factory,
/// or several for an aggregated multi token.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub(crate) key: TokenId,
    pub(crate) name: String,
    pub(crate) multi: bool,
    pub(crate) factories: Vec<ResolvedFactory>,
}

impl ResolvedProvider {
    pub fn key(&self) -> TokenId {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    pub fn factories(&self) -> &[ResolvedFactory] {
        &self.factories
    }
}

fn lower(provide: &Provide, store: &MetadataStore) -> DiResult<Option<ResolvedFactory>> {
    match provide {
        Provide::Class {
            class, class_name, ..
        } => {
            let meta = store
                .class(*class)
                .ok_or(DiError::UnknownClass(class_name.to_string()))?;
            let ctor = meta
                .ctor()
                .ok_or(DiError::NoConstructor(class_name.to_string()))?
                .clone();
            let deps = meta.params().iter().map(Dependency::from_param).collect();
            let construct = match ctor {
                Ctor::Sync(f) => Construct::Sync(f),
                Ctor::Async(f) => Construct::Async(f),
            };
            Ok(Some(ResolvedFactory { construct, deps }))
        }
        Provide::Value { value, .. } => Ok(Some(ResolvedFactory {
            construct: Construct::Value(value.clone()),
            deps: Vec::new(),
        })),
        Provide::Alias { target, .. } => Ok(Some(ResolvedFactory {
            construct: Construct::Alias(intern(target.clone())),
            deps: Vec::new(),
        })),
        Provide::FnFactory { deps, factory, .. } => {
            let deps = deps.iter().map(Dependency::from_param).collect();
            let construct = match factory {
                Ctor::Sync(f) => Construct::Sync(f.clone()),
                Ctor::Async(f) => Construct::Async(f.clone()),
            };
            Ok(Some(ResolvedFactory { construct, deps }))
        }
        Provide::MethodFactory {
            class,
            class_name,
            method,
            ..
        } => {
            let meta = store
                .class(*class)
                .ok_or(DiError::UnknownClass(class_name.to_string()))?;
            let method_meta = meta.find_method(method).ok_or(DiError::NoMethod {
                class: class_name.to_string(),
                method: method.to_string(),
            })?;
            let host = intern(DualKey::new(Token::Type(*class, *class_name)));
            Ok(Some(ResolvedFactory {
                construct: Construct::Method {
                    host,
                    func: method_meta.func.clone(),
                },
                deps: method_meta.params.iter().map(Dependency::from_param).collect(),
            }))
        }
        Provide::EmptyMulti { .. } => Ok(None),
    }
}

/// Folds an ordered provider list into one record per distinct key.
pub fn resolve_providers(
    providers: Providers,
    store: &MetadataStore,
) -> DiResult<Vec<ResolvedProvider>> {
    let items = providers.into_items();
    let mut order: Vec<TokenId> = Vec::new();
    let mut records: HashMap<TokenId, ResolvedProvider> = HashMap::new();

    for provide in &items {
        let key = provide.key().clone();
        let id = intern(key.clone());
        let multi = provide.is_multi();
        let factory = lower(provide, store)?;

        match records.entry(id) {
            Entry::Vacant(entry) => {
                order.push(id);
                entry.insert(ResolvedProvider {
                    key: id,
                    name: key.display_name(),
                    multi,
                    factories: factory.into_iter().collect(),
                });
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.multi != multi {
                    return Err(DiError::MixedMulti(record.name.clone()));
                }
                if multi {
                    record.factories.extend(factory);
                } else {
                    // Later registration overrides: user overrides default.
                    record.factories = factory.into_iter().collect();
                }
            }
        }
    }

    debug!(
        providers = items.len(),
        tokens = order.len(),
        "resolved provider list"
    );
    Ok(order
        .into_iter()
        .map(|id| records.remove(&id).expect("record for ordered key"))
        .collect())
}

/// Merges per-module provider lists contributed at one scope level.
///
/// A non-multi key contributed by two or more distinct imported lists and
/// not re-declared by the local list has no declared resolution: that is a
/// [`DiError::Collision`], raised before any injector is built. Multi keys
/// accumulate and never collide. The merged order is every imported list in
/// sequence followed by the local list, so the local list's entries win the
/// resolution fold.
pub fn merge_provider_lists(imported: &[Providers], local: &Providers) -> DiResult<Providers> {
    let mut seen_in: HashMap<TokenId, (usize, String)> = HashMap::new();
    for (index, list) in imported.iter().enumerate() {
        let mut keys_here: HashSet<TokenId> = HashSet::new();
        for provide in list.items() {
            if provide.is_multi() {
                continue;
            }
            let id = intern(provide.key().clone());
            if !keys_here.insert(id) {
                continue; // same list overriding itself is fine
            }
            let first_seen = seen_in.get(&id).map(|(first, _)| *first);
            match first_seen {
                Some(first) if first != index => {
                    seen_in.insert(id, (usize::MAX, provide.key().display_name()));
                }
                Some(_) => {}
                None => {
                    seen_in.insert(id, (index, provide.key().display_name()));
                }
            }
        }
    }

    let local_keys: HashSet<TokenId> = local
        .items()
        .iter()
        .filter(|p| !p.is_multi())
        .map(|p| intern(p.key().clone()))
        .collect();

    for (id, (marker, name)) in &seen_in {
        if *marker == usize::MAX && !local_keys.contains(id) {
            return Err(DiError::Collision(name.clone()));
        }
    }

    let mut merged = Providers::new();
    for list in imported {
        merged = merged.add_all(list.clone());
    }
    Ok(merged.add_all(local.clone()))
}
