//! Provider declarations: how a token gets its value.
//!
//! A provider is a closed tagged union checked once at resolution time:
//! class construction, pre-seeded value, alias delegation, or a factory
//! (free function or a named method on another resolved class). Any variant
//! may be flagged `multi`, in which case every registration for the token
//! contributes one element to an array instead of overriding.
//!
//! [`Providers`] is the ordered list builder the module layer hands to the
//! injector; nested lists flatten in place so declaration order is the only
//! override mechanism.

use std::any::{Any, TypeId};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{DiError, DiResult};
use crate::metadata::{Ctor, InjectArg, ParamMeta};
use crate::token::{AnyArc, DualKey};

/// A single provider declaration.
#[derive(Clone)]
pub enum Provide {
    /// Construct the registered class, resolving its declared ctor params.
    Class {
        key: DualKey,
        class: TypeId,
        class_name: &'static str,
        multi: bool,
    },
    /// Pre-seeded value, no construction.
    Value {
        key: DualKey,
        value: AnyArc,
        multi: bool,
    },
    /// Delegate to another key.
    Alias {
        key: DualKey,
        target: DualKey,
        multi: bool,
    },
    /// Invoke a function with resolved arguments.
    FnFactory {
        key: DualKey,
        deps: Vec<ParamMeta>,
        factory: Ctor,
        multi: bool,
    },
    /// Invoke a named factory method on another resolved class instance.
    MethodFactory {
        key: DualKey,
        class: TypeId,
        class_name: &'static str,
        method: &'static str,
        multi: bool,
    },
    /// Declares a multi token with no contributors; resolves to an empty
    /// array rather than a missing-provider error.
    EmptyMulti { key: DualKey },
}

impl Provide {
    pub fn key(&self) -> &DualKey {
        match self {
            Provide::Class { key, .. }
            | Provide::Value { key, .. }
            | Provide::Alias { key, .. }
            | Provide::FnFactory { key, .. }
            | Provide::MethodFactory { key, .. }
            | Provide::EmptyMulti { key } => key,
        }
    }

    pub fn is_multi(&self) -> bool {
        match self {
            Provide::Class { multi, .. }
            | Provide::Value { multi, .. }
            | Provide::Alias { multi, .. }
            | Provide::FnFactory { multi, .. }
            | Provide::MethodFactory { multi, .. } => *multi,
            Provide::EmptyMulti { .. } => true,
        }
    }

    fn set_multi(&mut self) {
        match self {
            Provide::Class { multi, .. }
            | Provide::Value { multi, .. }
            | Provide::Alias { multi, .. }
            | Provide::FnFactory { multi, .. }
            | Provide::MethodFactory { multi, .. } => *multi = true,
            Provide::EmptyMulti { .. } => {}
        }
    }
}

/// Ordered provider list builder.
///
/// Later entries override earlier ones for the same non-multi key ("user
/// overrides default"); multi entries accumulate. Nested lists flatten via
/// [`Providers::add_all`], so the fold order the resolver sees is exactly
/// the declaration order written here.
///
/// # Examples
///
/// ```rust
/// use trellis_di::{Providers, Token};
///
/// let defaults = Providers::new().value(Token::str("GREETING"), "hello".to_string());
/// let providers = Providers::new()
///     .add_all(defaults)
///     .value(Token::str("GREETING"), "hi".to_string()); // overrides
/// assert_eq!(providers.len(), 2);
/// ```
#[derive(Default, Clone)]
pub struct Providers {
    items: Vec<Provide>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw provider declaration.
    pub fn add(mut self, provider: Provide) -> Self {
        self.items.push(provider);
        self
    }

    /// Flattens another list onto the end of this one.
    pub fn add_all(mut self, other: Providers) -> Self {
        self.items.extend(other.items);
        self
    }

    /// Class provider: `key` is satisfied by constructing `T` per its
    /// registered metadata.
    pub fn class<T: 'static>(self, key: impl Into<DualKey>) -> Self {
        self.add(Provide::Class {
            key: key.into(),
            class: TypeId::of::<T>(),
            class_name: std::any::type_name::<T>(),
            multi: false,
        })
    }

    /// Class provider registered under its own type token.
    pub fn class_of<T: 'static>(self) -> Self {
        self.class::<T>(crate::token::key_of::<T>())
    }

    /// Value provider.
    pub fn value<V: Any + Send + Sync>(self, key: impl Into<DualKey>, value: V) -> Self {
        self.add(Provide::Value {
            key: key.into(),
            value: Arc::new(value),
            multi: false,
        })
    }

    /// Value provider from an already type-erased value.
    pub fn value_arc(self, key: impl Into<DualKey>, value: AnyArc) -> Self {
        self.add(Provide::Value {
            key: key.into(),
            value,
            multi: false,
        })
    }

    /// Alias provider: `key` delegates to `target`.
    pub fn alias(self, key: impl Into<DualKey>, target: impl Into<DualKey>) -> Self {
        self.add(Provide::Alias {
            key: key.into(),
            target: target.into(),
            multi: false,
        })
    }

    /// Factory provider: invoke `f` with arguments resolved from `deps`.
    pub fn factory<T, F>(self, key: impl Into<DualKey>, deps: Vec<ParamMeta>, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&[InjectArg]) -> DiResult<T> + Send + Sync + 'static,
    {
        self.add(Provide::FnFactory {
            key: key.into(),
            deps,
            factory: Ctor::of(f),
            multi: false,
        })
    }

    /// Async factory provider. The future owns its arguments.
    pub fn async_factory<F>(self, key: impl Into<DualKey>, deps: Vec<ParamMeta>, f: F) -> Self
    where
        F: Fn(Vec<InjectArg>) -> BoxFuture<'static, DiResult<AnyArc>> + Send + Sync + 'static,
    {
        self.add(Provide::FnFactory {
            key: key.into(),
            deps,
            factory: Ctor::Async(Arc::new(f)),
            multi: false,
        })
    }

    /// Method factory provider: resolve `T`, then call its registered
    /// factory method `method`.
    pub fn method_factory<T: 'static>(
        self,
        key: impl Into<DualKey>,
        method: &'static str,
    ) -> Self {
        self.add(Provide::MethodFactory {
            key: key.into(),
            class: TypeId::of::<T>(),
            class_name: std::any::type_name::<T>(),
            method,
            multi: false,
        })
    }

    /// Declares a multi token with no contributors of its own.
    pub fn empty_multi(self, key: impl Into<DualKey>) -> Self {
        self.add(Provide::EmptyMulti { key: key.into() })
    }

    /// Flags the most recently added provider as multi.
    pub fn multi(mut self) -> Self {
        if let Some(last) = self.items.last_mut() {
            last.set_multi();
        }
        self
    }

    /// Appends only when no non-multi provider for the key exists yet.
    pub fn try_add(mut self, provider: Provide) -> Self {
        let exists = self
            .items
            .iter()
            .any(|p| !p.is_multi() && p.key() == provider.key());
        if !exists {
            self.items.push(provider);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_items(self) -> Vec<Provide> {
        self.items
    }

    pub(crate) fn items(&self) -> &[Provide] {
        &self.items
    }
}

/// Downcasts a required argument at `index`.
pub fn required_arg<T: Send + Sync + 'static>(args: &[InjectArg], index: usize) -> DiResult<Arc<T>> {
    match args.get(index) {
        Some(Some(value)) => value
            .clone()
            .downcast::<T>()
            .map_err(|_| DiError::TypeMismatch(std::any::type_name::<T>())),
        _ => Err(DiError::NoProvider {
            token: std::any::type_name::<T>().to_string(),
            requester: None,
        }),
    }
}

/// Downcasts an optional argument at `index`; `Ok(None)` when the provider
/// was absent.
pub fn optional_arg<T: Send + Sync + 'static>(
    args: &[InjectArg],
    index: usize,
) -> DiResult<Option<Arc<T>>> {
    match args.get(index) {
        Some(Some(value)) => value
            .clone()
            .downcast::<T>()
            .map(Some)
            .map_err(|_| DiError::TypeMismatch(std::any::type_name::<T>())),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;

    #[test]
    fn multi_flags_the_last_entry_only() {
        let providers = Providers::new()
            .value(Token::str("A"), 1u32)
            .value(Token::str("B"), 2u32)
            .multi();
        assert!(!providers.items()[0].is_multi());
        assert!(providers.items()[1].is_multi());
    }

    #[test]
    fn try_add_skips_present_keys() {
        let providers = Providers::new()
            .value(Token::str("A"), 1u32)
            .try_add(Provide::Value {
                key: Token::str("A").into(),
                value: Arc::new(2u32),
                multi: false,
            })
            .try_add(Provide::Value {
                key: Token::str("B").into(),
                value: Arc::new(3u32),
                multi: false,
            });
        assert_eq!(providers.len(), 2);
    }

    #[test]
    fn add_all_preserves_declaration_order() {
        let inner = Providers::new().value(Token::str("B"), 2u32);
        let providers = Providers::new()
            .value(Token::str("A"), 1u32)
            .add_all(inner)
            .value(Token::str("C"), 3u32);
        let names: Vec<_> = providers
            .items()
            .iter()
            .map(|p| p.key().display_name())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }
}
