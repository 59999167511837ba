//! Error types for the dependency injection container.

use std::fmt;

/// Dependency injection and extension orchestration errors.
///
/// Every failure the container can produce is surfaced through this enum,
/// detected as early as possible: provider-list normalization reports
/// collisions and single/multi conflicts before an injector exists,
/// injector construction reports unsatisfiable dependencies before any
/// instantiation, and instantiation reports circular chains with the full
/// path rather than a bare "cycle detected".
///
/// The type is `Clone` because a failed shared construction fans the same
/// error out to every pending caller.
///
/// # Examples
///
/// ```rust
/// use trellis_di::{DiError, Injector, MetadataStore, Providers, Token};
///
/// let store = MetadataStore::new();
/// let injector = Injector::resolve_and_create(Providers::new(), &store, None).unwrap();
/// match injector.get(Token::str("MISSING")) {
///     Err(DiError::NoProvider { token, .. }) => assert_eq!(token, "MISSING"),
///     other => panic!("expected NoProvider, got {:?}", other.err()),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiError {
    /// No provider for a required token anywhere in the visible chain.
    /// `requester` names the provider (or class) that asked, when known.
    NoProvider {
        token: String,
        requester: Option<String>,
    },
    /// A class provider references a class with no metadata registration.
    UnknownClass(String),
    /// A class is registered but carries no constructor.
    NoConstructor(String),
    /// A method factory references a method the target class does not declare.
    NoMethod { class: String, method: String },
    /// One token carries both single and multi registrations.
    MixedMulti(String),
    /// Two imported provider lists contribute the same non-multi token
    /// without a local override.
    Collision(String),
    /// Circular provider instantiation chain (full path, first token repeated).
    Circular(Vec<String>),
    /// The token's construction chain is asynchronous; use `get_async`.
    AsyncConstruction(String),
    /// Type downcast failed.
    TypeMismatch(&'static str),
    /// Extension group ordering edges form a cycle (full path, first group repeated).
    GroupCycle(Vec<String>),
    /// An extension's initialization step failed.
    ExtensionFailed {
        group: String,
        extension: String,
        message: String,
    },
}

impl fmt::Display for DiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiError::NoProvider { token, requester } => match requester {
                Some(r) => write!(f, "No provider for {} (required by {})", token, r),
                None => write!(f, "No provider for {}", token),
            },
            DiError::UnknownClass(name) => {
                write!(f, "Class {} has no metadata registration", name)
            }
            DiError::NoConstructor(name) => {
                write!(f, "Class {} has no registered constructor", name)
            }
            DiError::NoMethod { class, method } => {
                write!(f, "Class {} has no factory method {:?}", class, method)
            }
            DiError::MixedMulti(name) => {
                write!(f, "Token {} mixes single and multi providers", name)
            }
            DiError::Collision(name) => {
                write!(f, "Provider collision for {} between imported lists", name)
            }
            DiError::Circular(path) => {
                write!(f, "Circular dependency: {}", path.join(" -> "))
            }
            DiError::AsyncConstruction(name) => {
                write!(f, "{} requires async construction; use get_async", name)
            }
            DiError::TypeMismatch(name) => write!(f, "Type mismatch for: {}", name),
            DiError::GroupCycle(path) => {
                write!(f, "Extension group cycle: {}", path.join(" -> "))
            }
            DiError::ExtensionFailed {
                group,
                extension,
                message,
            } => {
                write!(
                    f,
                    "Extension {} (group {}) failed: {}",
                    extension, group, message
                )
            }
        }
    }
}

impl std::error::Error for DiError {}

/// Result type for DI operations.
pub type DiResult<T> = Result<T, DiError>;
