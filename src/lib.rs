//! # trellis-di
//!
//! Hierarchical dependency injection and extension orchestration for
//! modular Rust applications.
//!
//! ## Features
//!
//! - **Provider model**: class, value, alias and factory providers,
//!   normalized by a deterministic fold where later registrations override
//!   earlier ones and multi providers accumulate into arrays
//! - **Injector chains**: one container per scope level (application,
//!   module, route, request), child injectors delegating rootward while
//!   each level keeps its own singleton cache
//! - **Resolution modifiers**: optional, skip-self and self-only
//!   dependencies, plus token-owned default values
//! - **Fail-fast diagnostics**: missing providers named with their
//!   requester, circular chains reported with the full path
//! - **Async construction**: factories may be async; concurrent requests
//!   converge on one shared in-flight construction
//! - **Extension orchestration**: named groups ordered by before/after
//!   edges, cycle detection with the exact cycle path, and exactly-once
//!   async initialization per bootstrap
//!
//! ## Quick Start
//!
//! ```rust
//! use trellis_di::{required_arg, Injector, MetadataStore, ParamMeta, Providers, Token};
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: Arc<String>,
//! }
//!
//! let store = MetadataStore::new();
//! let providers = Providers::new()
//!     .value(Token::str("DB_URL"), "postgres://localhost".to_string())
//!     .factory(
//!         Token::of::<Database>(),
//!         vec![ParamMeta::new(Token::str("DB_URL"))],
//!         |args| {
//!             Ok(Database {
//!                 url: required_arg::<String>(args, 0)?,
//!             })
//!         },
//!     );
//!
//! let injector = Injector::resolve_and_create(providers, &store, None).unwrap();
//! let db = injector.get_as::<Database>(Token::of::<Database>()).unwrap();
//! assert_eq!(&**db.url, "postgres://localhost");
//! ```
//!
//! ## Injector Chains
//!
//! A child injector resolves what it does not declare through its parent;
//! a token declared at both levels yields one independent instance per
//! level.
//!
//! ```rust
//! use trellis_di::{Injector, MetadataStore, Providers, Token};
//!
//! let store = MetadataStore::new();
//! let app = Injector::resolve_and_create(
//!     Providers::new().value(Token::str("NAME"), "app".to_string()),
//!     &store,
//!     None,
//! )
//! .unwrap();
//! let request = Injector::resolve_and_create(Providers::new(), &store, Some(app)).unwrap();
//!
//! let name = request.get_as::<String>(Token::str("NAME")).unwrap();
//! assert_eq!(&*name, "app");
//! ```
//!
//! ## Extension Groups
//!
//! Extensions are async initialization steps grouped under named phases.
//! Groups declare before/after edges; the manager computes a safe order (or
//! reports the exact cycle) and runs every extension exactly once per
//! bootstrap.

// Module declarations
pub mod error;
pub mod extensions;
pub mod injector;
pub mod metadata;
pub mod provider;
pub mod resolver;
pub mod token;

// Re-export core types
pub use error::{DiError, DiResult};
pub use extensions::{
    Extension, ExtensionRegistration, ExtensionsManager, GroupData, InitContext,
};
pub use extensions::graph::GroupGraph;
pub use injector::Injector;
pub use metadata::{
    AnnotationRecord, ClassMeta, Ctor, InjectArg, MetadataStore, ParamMeta,
};
pub use provider::{optional_arg, required_arg, Provide, Providers};
pub use resolver::{
    merge_provider_lists, resolve_providers, Dependency, ResolvedFactory, ResolvedProvider,
};
pub use token::{intern, key_of, AnyArc, DualKey, Token, TokenId};
