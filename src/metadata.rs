//! Declaration-time metadata: annotations, constructor parameters, factory
//! methods.
//!
//! The store is a pure lookup table. Classes register a [`ClassMeta`] built
//! explicitly (the attachment mechanism itself is out of scope; only what it
//! stores matters): ordered annotation records per class and per member,
//! ordered constructor parameter descriptors, and named factory methods.
//! The provider resolver consumes this table to derive dependency lists; it
//! never inspects values by shape afterwards.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::DiResult;
use crate::token::{AnyArc, DualKey, Token};

/// One resolved constructor/factory argument. `None` means an optional
/// dependency with no visible provider.
pub type InjectArg = Option<AnyArc>;

/// Synchronous constructor: resolved arguments in, type-erased value out.
pub type SyncCtor = Arc<dyn Fn(&[InjectArg]) -> DiResult<AnyArc> + Send + Sync>;

/// Asynchronous constructor. Takes the arguments by value so the returned
/// future is `'static`.
pub type AsyncCtor =
    Arc<dyn Fn(Vec<InjectArg>) -> BoxFuture<'static, DiResult<AnyArc>> + Send + Sync>;

/// Factory method on a resolved host instance: host first, then arguments.
pub type MethodFn = Arc<dyn Fn(AnyArc, &[InjectArg]) -> DiResult<AnyArc> + Send + Sync>;

/// A construction strategy, sync or async.
#[derive(Clone)]
pub enum Ctor {
    Sync(SyncCtor),
    Async(AsyncCtor),
}

impl Ctor {
    /// Wraps a typed synchronous constructor.
    pub fn of<T, F>(f: F) -> Ctor
    where
        T: Send + Sync + 'static,
        F: Fn(&[InjectArg]) -> DiResult<T> + Send + Sync + 'static,
    {
        Ctor::Sync(Arc::new(move |args| Ok(Arc::new(f(args)?) as AnyArc)))
    }
}

/// One annotation attached at declaration time: who produced it plus an
/// opaque payload.
#[derive(Clone)]
pub struct AnnotationRecord {
    pub producer: &'static str,
    pub payload: AnyArc,
}

impl AnnotationRecord {
    /// Downcasts the payload.
    pub fn payload_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.payload.clone().downcast::<T>().ok()
    }
}

/// One constructor/factory parameter: the requested key plus resolution
/// modifiers.
#[derive(Clone, Debug)]
pub struct ParamMeta {
    pub key: DualKey,
    pub optional: bool,
    pub skip_self: bool,
    pub from_self: bool,
}

impl ParamMeta {
    pub fn new(key: impl Into<DualKey>) -> Self {
        Self {
            key: key.into(),
            optional: false,
            skip_self: false,
            from_self: false,
        }
    }

    /// Missing provider resolves the argument to `None` instead of erroring.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Resolution starts at the parent injector, never satisfied locally.
    pub fn skip_self(mut self) -> Self {
        self.skip_self = true;
        self
    }

    /// Resolution is confined to the asking injector's own provider list.
    pub fn from_self(mut self) -> Self {
        self.from_self = true;
        self
    }
}

impl From<DualKey> for ParamMeta {
    fn from(key: DualKey) -> Self {
        ParamMeta::new(key)
    }
}

impl From<Token> for ParamMeta {
    fn from(token: Token) -> Self {
        ParamMeta::new(token)
    }
}

pub(crate) struct MethodMeta {
    pub(crate) params: Vec<ParamMeta>,
    pub(crate) func: MethodFn,
}

/// Everything declared about one class.
pub struct ClassMeta {
    type_id: TypeId,
    name: &'static str,
    annotations: Vec<AnnotationRecord>,
    member_annotations: HashMap<&'static str, Vec<AnnotationRecord>>,
    params: Vec<ParamMeta>,
    ctor: Option<Ctor>,
    methods: HashMap<&'static str, MethodMeta>,
}

impl ClassMeta {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            annotations: Vec::new(),
            member_annotations: HashMap::new(),
            params: Vec::new(),
            ctor: None,
            methods: HashMap::new(),
        }
    }

    /// Appends a class-level annotation record; order is preserved.
    pub fn annotate<P: Any + Send + Sync>(mut self, producer: &'static str, payload: P) -> Self {
        self.annotations.push(AnnotationRecord {
            producer,
            payload: Arc::new(payload),
        });
        self
    }

    /// Appends an annotation record on a named member.
    pub fn annotate_member<P: Any + Send + Sync>(
        mut self,
        member: &'static str,
        producer: &'static str,
        payload: P,
    ) -> Self {
        self.member_annotations
            .entry(member)
            .or_default()
            .push(AnnotationRecord {
                producer,
                payload: Arc::new(payload),
            });
        self
    }

    /// Appends a constructor parameter; declaration order is the argument
    /// order the constructor receives.
    pub fn param(mut self, param: impl Into<ParamMeta>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Registers the constructor, receiving arguments in `param` order.
    pub fn constructor<T, F>(mut self, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&[InjectArg]) -> DiResult<T> + Send + Sync + 'static,
    {
        self.ctor = Some(Ctor::of(f));
        self
    }

    /// Registers an asynchronous constructor.
    pub fn async_constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<InjectArg>) -> BoxFuture<'static, DiResult<AnyArc>> + Send + Sync + 'static,
    {
        self.ctor = Some(Ctor::Async(Arc::new(f)));
        self
    }

    /// Registers a named factory method with its own parameter list. The
    /// function receives the resolved host instance first.
    pub fn method<F>(mut self, name: &'static str, params: Vec<ParamMeta>, f: F) -> Self
    where
        F: Fn(AnyArc, &[InjectArg]) -> DiResult<AnyArc> + Send + Sync + 'static,
    {
        self.methods.insert(
            name,
            MethodMeta {
                params,
                func: Arc::new(f),
            },
        );
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn params(&self) -> &[ParamMeta] {
        &self.params
    }

    pub(crate) fn ctor(&self) -> Option<&Ctor> {
        self.ctor.as_ref()
    }

    pub(crate) fn find_method(&self, name: &str) -> Option<&MethodMeta> {
        self.methods.get(name)
    }
}

/// Lookup table over every registered [`ClassMeta`].
pub struct MetadataStore {
    classes: RwLock<HashMap<TypeId, Arc<ClassMeta>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) a class declaration.
    pub fn add(&self, meta: ClassMeta) -> &Self {
        self.classes.write().insert(meta.type_id, Arc::new(meta));
        self
    }

    pub(crate) fn class(&self, type_id: TypeId) -> Option<Arc<ClassMeta>> {
        self.classes.read().get(&type_id).cloned()
    }

    /// Ordered class-level annotation records, empty when unregistered.
    pub fn annotations_of<T: 'static>(&self) -> Vec<AnnotationRecord> {
        self.class(TypeId::of::<T>())
            .map(|m| m.annotations.clone())
            .unwrap_or_default()
    }

    /// Ordered annotation records on one member.
    pub fn member_annotations_of<T: 'static>(&self, member: &str) -> Vec<AnnotationRecord> {
        self.class(TypeId::of::<T>())
            .and_then(|m| m.member_annotations.get(member).cloned())
            .unwrap_or_default()
    }

    /// Declared constructor parameters for a class.
    pub fn params_of<T: 'static>(&self) -> Vec<ParamMeta> {
        self.class(TypeId::of::<T>())
            .map(|m| m.params.clone())
            .unwrap_or_default()
    }

    /// Declared parameter list of a named factory method, `None` when the
    /// class or method is unregistered.
    pub fn method_params_of<T: 'static>(&self, name: &str) -> Option<Vec<ParamMeta>> {
        self.class(TypeId::of::<T>())
            .and_then(|m| m.methods.get(name).map(|meta| meta.params.clone()))
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}
