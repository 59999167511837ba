//! Token identities, dual keys, and the process-wide intern table.
//!
//! Every injectable reference is named by a [`Token`]: a concrete type, a
//! string, or an explicit injection token minted at runtime. A [`DualKey`]
//! pairs a token with an optional context discriminator so the same class
//! can be registered under more than one role. Keys are interned once into
//! a process-wide table; everything downstream (provider records, injector
//! caches, extension groups) works on the resulting [`TokenId`] handle, so
//! hot-path lookups are integer comparisons.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Type-erased shared value, the currency of the container.
pub type AnyArc = Arc<dyn Any + Send + Sync>;

/// Factory producing a token's default value when no provider is visible.
pub type DefaultFn = Arc<dyn Fn() -> AnyArc + Send + Sync>;

static NEXT_INJECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity used to request a value from the container.
///
/// Tokens are compared by identity, never structurally: type tokens by
/// `TypeId`, string tokens by content, injection tokens by the unique id
/// minted at creation. The human-readable name rides along for diagnostics
/// only and never participates in equality.
#[derive(Clone)]
pub enum Token {
    /// A concrete type used as its own token.
    Type(TypeId, &'static str),
    /// A plain string token.
    Str(&'static str),
    /// An explicit injection token: unique id plus description.
    Injection(u64, &'static str),
}

impl Token {
    /// Token for a concrete type.
    pub fn of<T: 'static>() -> Token {
        Token::Type(TypeId::of::<T>(), std::any::type_name::<T>())
    }

    /// String token.
    pub fn str(s: &'static str) -> Token {
        Token::Str(s)
    }

    /// Mints a fresh injection token. Two calls with the same description
    /// produce two distinct tokens.
    pub fn injection(description: &'static str) -> Token {
        Token::Injection(NEXT_INJECTION_ID.fetch_add(1, Ordering::Relaxed), description)
    }

    /// Mints a fresh injection token carrying a default-value factory.
    ///
    /// When a dependency on this token finds no provider in the visible
    /// chain, the injector constructs the default instead of failing, and
    /// caches it at the asking level.
    pub fn injection_with_default<F>(description: &'static str, default: F) -> Token
    where
        F: Fn() -> AnyArc + Send + Sync + 'static,
    {
        let token = Token::injection(description);
        REGISTRY.write().token_defaults.insert(token.clone(), Arc::new(default));
        token
    }

    /// Human-readable name for diagnostics.
    pub fn display_name(&self) -> &'static str {
        match self {
            Token::Type(_, name) => name,
            Token::Str(name) => name,
            Token::Injection(_, description) => description,
        }
    }
}

impl PartialEq for Token {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Identity comparisons: the name strings never participate.
            (Token::Type(a, _), Token::Type(b, _)) => a == b,
            (Token::Str(a), Token::Str(b)) => a == b,
            (Token::Injection(a, _), Token::Injection(b, _)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Token {}

impl Hash for Token {
    #[inline(always)]
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Token::Type(id, _) => {
                0u8.hash(state);
                id.hash(state);
            }
            Token::Str(s) => {
                1u8.hash(state);
                s.hash(state);
            }
            Token::Injection(id, _) => {
                2u8.hash(state);
                id.hash(state);
            }
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Type(_, name) => write!(f, "Type({})", name),
            Token::Str(s) => write!(f, "Str({:?})", s),
            Token::Injection(id, d) => write!(f, "Injection({}, {:?})", id, d),
        }
    }
}

/// A token plus an optional context discriminator.
///
/// The context distinguishes otherwise-identical tokens registered in
/// different roles, e.g. a class registered both as itself and as a
/// metadata key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DualKey {
    pub token: Token,
    pub context: Option<&'static str>,
}

impl DualKey {
    pub fn new(token: Token) -> Self {
        Self { token, context: None }
    }

    pub fn with_context(token: Token, context: &'static str) -> Self {
        Self { token, context: Some(context) }
    }

    /// Diagnostic name, context included when present.
    pub fn display_name(&self) -> String {
        match self.context {
            Some(ctx) => format!("{} @{}", self.token.display_name(), ctx),
            None => self.token.display_name().to_string(),
        }
    }
}

impl From<Token> for DualKey {
    fn from(token: Token) -> Self {
        DualKey::new(token)
    }
}

/// Dual key for a concrete type, no context.
pub fn key_of<T: 'static>() -> DualKey {
    DualKey::new(Token::of::<T>())
}

/// Interned handle for a [`DualKey`]. Copyable, compared as an integer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TokenId(u32);

impl TokenId {
    /// Diagnostic name of the interned key.
    pub fn display_name(self) -> String {
        REGISTRY.read().entries[self.0 as usize].name.clone()
    }

    pub(crate) fn default_factory(self) -> Option<DefaultFn> {
        REGISTRY.read().entries[self.0 as usize].default.clone()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

struct TokenEntry {
    name: String,
    default: Option<DefaultFn>,
}

#[derive(Default)]
struct TokenTable {
    ids: HashMap<DualKey, TokenId>,
    entries: Vec<TokenEntry>,
    token_defaults: HashMap<Token, DefaultFn>,
}

static REGISTRY: Lazy<RwLock<TokenTable>> = Lazy::new(|| RwLock::new(TokenTable::default()));

/// Interns a dual key, returning its stable handle. Idempotent.
pub fn intern(key: impl Into<DualKey>) -> TokenId {
    let key = key.into();
    {
        let table = REGISTRY.read();
        if let Some(&id) = table.ids.get(&key) {
            return id;
        }
    }
    let mut table = REGISTRY.write();
    if let Some(&id) = table.ids.get(&key) {
        return id; // lost the write race
    }
    let id = TokenId(table.entries.len() as u32);
    let default = table.token_defaults.get(&key.token).cloned();
    table.entries.push(TokenEntry {
        name: key.display_name(),
        default,
    });
    table.ids.insert(key, id);
    id
}
