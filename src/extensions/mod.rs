//! Extension orchestration: running module-contributed initialization
//! steps in a safe order, exactly once per bootstrap.
//!
//! Modules register extensions under named groups with declared
//! before/after edges. The manager builds the [`graph::GroupGraph`] up
//! front (reporting the exact cycle if the edges are unsound), then drives
//! each group's extensions through their async [`Extension::init`] on
//! demand: the first `stage1` call for a group runs it behind a shared
//! future, every later or concurrent call observes the same completed
//! result. Extensions pull other groups' finalized output through the
//! [`InitContext`] handed to `init`, and learn from it whether they are the
//! last initialization of the bootstrap, the signal stateful accumulators
//! use to flush instead of defer.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DiError, DiResult};
use crate::injector::Injector;
use crate::provider::Providers;
use crate::token::{intern, AnyArc, DualKey, TokenId};

pub mod graph;

use graph::GroupGraph;

type SharedGroup = Shared<BoxFuture<'static, Result<GroupData, DiError>>>;
type SharedExt = Shared<BoxFuture<'static, DiResult<AnyArc>>>;

/// The finalized output of one extension group.
#[derive(Clone)]
pub struct GroupData {
    /// One payload per contributing extension, registration order.
    pub group_data: Vec<AnyArc>,
}

impl GroupData {
    /// Downcasts every payload to `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> DiResult<Vec<Arc<T>>> {
        self.group_data
            .iter()
            .map(|v| {
                v.clone()
                    .downcast::<T>()
                    .map_err(|_| DiError::TypeMismatch(std::any::type_name::<T>()))
            })
            .collect()
    }
}

/// A module-contributed asynchronous initialization step.
///
/// `init` runs at most once per bootstrap, no matter how many groups
/// transitively require the extension. The payload it returns becomes one
/// element of its group's [`GroupData`].
#[async_trait]
pub trait Extension: Send + Sync {
    async fn init(&self, cx: &InitContext) -> DiResult<AnyArc>;
}

/// One extension registration, as contributed by a module.
#[derive(Clone)]
pub struct ExtensionRegistration {
    /// Token under which the extension instance resolves from the injector.
    pub extension: DualKey,
    /// The group this extension contributes to.
    pub group: DualKey,
    /// Groups that must run after this one.
    pub before_groups: Vec<DualKey>,
    /// Groups that must run before this one.
    pub after_groups: Vec<DualKey>,
    /// Initialized and ordered normally, but excluded from the group data
    /// handed to local consumers.
    pub export_only: bool,
}

impl ExtensionRegistration {
    pub fn new(extension: impl Into<DualKey>, group: impl Into<DualKey>) -> Self {
        Self {
            extension: extension.into(),
            group: group.into(),
            before_groups: Vec::new(),
            after_groups: Vec::new(),
            export_only: false,
        }
    }

    pub fn before_group(mut self, group: impl Into<DualKey>) -> Self {
        self.before_groups.push(group.into());
        self
    }

    pub fn after_group(mut self, group: impl Into<DualKey>) -> Self {
        self.after_groups.push(group.into());
        self
    }

    pub fn export_only(mut self) -> Self {
        self.export_only = true;
        self
    }
}

impl Providers {
    /// Registers an extension instance as a value provider under `key`.
    pub fn extension(self, key: impl Into<DualKey>, ext: Arc<dyn Extension>) -> Self {
        self.value_arc(key, Arc::new(ext) as AnyArc)
    }
}

struct RegRecord {
    extension_key: DualKey,
    ext: TokenId,
    ext_name: String,
    export_only: bool,
}

enum GroupSlot {
    InFlight(SharedGroup),
    Done(Result<GroupData, DiError>),
}

enum ExtSlot {
    InFlight(SharedExt),
    Done(DiResult<AnyArc>),
}

enum GroupChecked {
    Hit(Result<GroupData, DiError>),
    Wait(SharedGroup),
    Created(SharedGroup),
}

enum ExtChecked {
    Hit(DiResult<AnyArc>),
    Wait(SharedExt),
    Created(SharedExt),
}

/// Orchestrates extension execution across one bootstrap.
pub struct ExtensionsManager {
    injector: Arc<Injector>,
    regs: Vec<RegRecord>,
    by_group: HashMap<TokenId, Vec<usize>>,
    graph: GroupGraph,
    order: Vec<TokenId>,
    groups: Mutex<HashMap<TokenId, GroupSlot>>,
    exts: Mutex<HashMap<TokenId, ExtSlot>>,
    remaining: Mutex<usize>,
    weak: Weak<ExtensionsManager>,
}

impl ExtensionsManager {
    /// Builds the group graph from the aggregated registrations and
    /// validates it; an unsound edge set fails here with the exact cycle,
    /// before any extension runs.
    pub fn new(
        injector: Arc<Injector>,
        registrations: Vec<ExtensionRegistration>,
    ) -> DiResult<Arc<Self>> {
        let mut regs = Vec::with_capacity(registrations.len());
        let mut by_group: HashMap<TokenId, Vec<usize>> = HashMap::new();
        let mut graph = GroupGraph::new();
        let mut distinct: HashSet<TokenId> = HashSet::new();

        for registration in registrations {
            let group = intern(registration.group.clone());
            graph.add_node(group);
            for before in &registration.before_groups {
                graph.add_edge(group, intern(before.clone()));
            }
            for after in &registration.after_groups {
                graph.add_edge(intern(after.clone()), group);
            }

            let ext = intern(registration.extension.clone());
            distinct.insert(ext);
            by_group.entry(group).or_default().push(regs.len());
            regs.push(RegRecord {
                ext_name: registration.extension.display_name(),
                extension_key: registration.extension,
                ext,
                export_only: registration.export_only,
            });
        }

        let order = graph.topo_order().map_err(|cycle| {
            DiError::GroupCycle(cycle.into_iter().map(|id| id.display_name()).collect())
        })?;

        let total = distinct.len();
        debug!(
            extensions = regs.len(),
            groups = order.len(),
            "extensions manager ready"
        );
        Ok(Arc::new_cyclic(|weak| ExtensionsManager {
            injector,
            regs,
            by_group,
            graph,
            order,
            groups: Mutex::new(HashMap::new()),
            exts: Mutex::new(HashMap::new()),
            remaining: Mutex::new(total),
            weak: weak.clone(),
        }))
    }

    fn strong(&self) -> Arc<ExtensionsManager> {
        self.weak.upgrade().expect("manager accessed while alive")
    }

    /// The computed group execution order, predecessors first.
    pub fn group_order(&self) -> &[TokenId] {
        &self.order
    }

    /// Runs every extension registered under `group` exactly once per
    /// bootstrap, serialized behind the group's declared predecessors, and
    /// returns the accumulated group data. Repeated and concurrent calls
    /// observe the same completed result without re-running side effects.
    pub async fn stage1(&self, group: impl Into<DualKey>) -> DiResult<GroupData> {
        let gid = intern(group.into());
        self.stage1_inner(gid, Vec::new()).await
    }

    /// Drives every registered group in topological order. The bootstrap
    /// entry point.
    pub async fn run_all(&self) -> DiResult<()> {
        for gid in self.order.clone() {
            if self.by_group.contains_key(&gid) {
                self.stage1_inner(gid, Vec::new()).await?;
            }
        }
        Ok(())
    }

    fn stage1_inner(
        &self,
        gid: TokenId,
        chain: Vec<TokenId>,
    ) -> BoxFuture<'static, Result<GroupData, DiError>> {
        let this = self.strong();
        async move {
            if chain.contains(&gid) {
                let mut names: Vec<String> =
                    chain.iter().map(|id| id.display_name()).collect();
                names.push(gid.display_name());
                return Err(DiError::GroupCycle(names));
            }

            // Groups related by an edge serialize in declared order; a
            // predecessor already mid-flight in this very chain is the
            // puller's own responsibility and is skipped. Predecessors with
            // no registrations of their own still run (to an empty result)
            // so ordering stays transitive through them.
            for pred in this.graph.predecessors(gid) {
                if !chain.contains(&pred) {
                    let mut pred_chain = chain.clone();
                    pred_chain.push(gid);
                    this.stage1_inner(pred, pred_chain).await?;
                }
            }

            let checked = {
                let mut groups = this.groups.lock();
                match groups.entry(gid) {
                    Entry::Occupied(entry) => match entry.get() {
                        GroupSlot::Done(result) => GroupChecked::Hit(result.clone()),
                        GroupSlot::InFlight(shared) => GroupChecked::Wait(shared.clone()),
                    },
                    Entry::Vacant(entry) => {
                        let mut run_chain = chain.clone();
                        run_chain.push(gid);
                        let shared = run_group(this.clone(), gid, run_chain).boxed().shared();
                        entry.insert(GroupSlot::InFlight(shared.clone()));
                        GroupChecked::Created(shared)
                    }
                }
            };

            match checked {
                GroupChecked::Hit(result) => result,
                GroupChecked::Wait(shared) => shared.await,
                GroupChecked::Created(shared) => {
                    let result = shared.await;
                    this.groups
                        .lock()
                        .insert(gid, GroupSlot::Done(result.clone()));
                    result
                }
            }
        }
        .boxed()
    }
}

async fn run_group(
    this: Arc<ExtensionsManager>,
    gid: TokenId,
    chain: Vec<TokenId>,
) -> Result<GroupData, DiError> {
    let indices = this.by_group.get(&gid).cloned().unwrap_or_default();
    debug!(group = %gid, extensions = indices.len(), "running extension group");
    let mut group_data = Vec::new();
    for idx in indices {
        let export_only = this.regs[idx].export_only;
        let payload = run_extension(&this, idx, gid, chain.clone()).await?;
        if !export_only {
            group_data.push(payload);
        }
    }
    Ok(GroupData { group_data })
}

async fn run_extension(
    this: &Arc<ExtensionsManager>,
    idx: usize,
    gid: TokenId,
    chain: Vec<TokenId>,
) -> DiResult<AnyArc> {
    let ext_id = this.regs[idx].ext;
    let checked = {
        let mut exts = this.exts.lock();
        match exts.entry(ext_id) {
            Entry::Occupied(entry) => match entry.get() {
                ExtSlot::Done(result) => ExtChecked::Hit(result.clone()),
                ExtSlot::InFlight(shared) => ExtChecked::Wait(shared.clone()),
            },
            Entry::Vacant(entry) => {
                let shared = init_extension(this.clone(), idx, gid, chain)
                    .boxed()
                    .shared();
                entry.insert(ExtSlot::InFlight(shared.clone()));
                ExtChecked::Created(shared)
            }
        }
    };

    match checked {
        ExtChecked::Hit(result) => result,
        ExtChecked::Wait(shared) => shared.await,
        ExtChecked::Created(shared) => {
            let result = shared.await;
            this.exts.lock().insert(ext_id, ExtSlot::Done(result.clone()));
            result
        }
    }
}

async fn init_extension(
    this: Arc<ExtensionsManager>,
    idx: usize,
    gid: TokenId,
    chain: Vec<TokenId>,
) -> DiResult<AnyArc> {
    let extension_key = this.regs[idx].extension_key.clone();
    let ext_name = this.regs[idx].ext_name.clone();

    let instance = this
        .injector
        .get_async(extension_key)
        .await
        .map_err(|err| DiError::ExtensionFailed {
            group: gid.display_name(),
            extension: ext_name.clone(),
            message: err.to_string(),
        })?;
    let ext = instance
        .downcast::<Arc<dyn Extension>>()
        .map_err(|_| DiError::TypeMismatch("Arc<dyn Extension>"))?;

    // Count down before invoking so the final pending init observes it.
    let is_last = {
        let mut left = this.remaining.lock();
        *left = left.saturating_sub(1);
        *left == 0
    };
    debug!(extension = %ext_name, group = %gid, is_last, "initializing extension");
    let cx = InitContext {
        manager: this.clone(),
        chain,
        is_last,
    };
    match ext.init(&cx).await {
        Ok(payload) => Ok(payload),
        // A failure surfaced by a pulled group keeps its original
        // attribution.
        Err(err @ DiError::ExtensionFailed { .. }) => Err(err),
        Err(err) => Err(DiError::ExtensionFailed {
            group: gid.display_name(),
            extension: ext_name,
            message: err.to_string(),
        }),
    }
}

/// The handle an extension receives while initializing: pulls other
/// groups' finalized output and exposes bootstrap-wide signals.
pub struct InitContext {
    manager: Arc<ExtensionsManager>,
    chain: Vec<TokenId>,
    is_last: bool,
}

impl InitContext {
    /// Pulls another group's finalized data, running it first if needed.
    /// Pull chains that loop back into a group currently in flight fail
    /// with the full chain.
    pub async fn stage1(&self, group: impl Into<DualKey>) -> DiResult<GroupData> {
        let gid = intern(group.into());
        self.manager.stage1_inner(gid, self.chain.clone()).await
    }

    /// Whether this is the final extension initialization expected this
    /// bootstrap, the point at which cross-module accumulators can flush.
    pub fn is_last_extension_call(&self) -> bool {
        self.is_last
    }

    /// The injector the manager itself resolves extensions from.
    pub fn injector(&self) -> &Arc<Injector> {
        &self.manager.injector
    }
}
