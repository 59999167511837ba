use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use trellis_di::{
    AnyArc, DiError, DiResult, Extension, ExtensionRegistration, ExtensionsManager, InitContext,
    Injector, MetadataStore, Providers, Token,
};

type Log = Arc<Mutex<Vec<(String, bool)>>>;

struct Recorder {
    name: &'static str,
    log: Log,
    counter: Arc<AtomicUsize>,
}

#[async_trait]
impl Extension for Recorder {
    async fn init(&self, cx: &InitContext) -> DiResult<AnyArc> {
        // Yield once so interleaved callers genuinely overlap.
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.counter.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push((self.name.to_string(), cx.is_last_extension_call()));
        Ok(Arc::new(self.name.to_string()) as AnyArc)
    }
}

fn recorder(name: &'static str, log: &Log, counter: &Arc<AtomicUsize>) -> Arc<dyn Extension> {
    Arc::new(Recorder {
        name,
        log: log.clone(),
        counter: counter.clone(),
    })
}

#[tokio::test]
async fn test_groups_run_in_declared_before_after_order() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new()
            .extension(Token::str("order.routes_ext"), recorder("routes", &log, &counter))
            .extension(Token::str("order.server_ext"), recorder("server", &log, &counter))
            .extension(Token::str("order.openapi_ext"), recorder("openapi", &log, &counter)),
        &store,
        None,
    )
    .unwrap();

    // server runs after routes; openapi declares itself before server.
    let manager = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("order.server_ext"), Token::str("order.SERVER"))
                .after_group(Token::str("order.ROUTES")),
            ExtensionRegistration::new(Token::str("order.routes_ext"), Token::str("order.ROUTES")),
            ExtensionRegistration::new(
                Token::str("order.openapi_ext"),
                Token::str("order.OPENAPI"),
            )
            .before_group(Token::str("order.SERVER")),
        ],
    )
    .unwrap();

    manager.run_all().await.unwrap();

    let order: Vec<String> = log.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert_eq!(order.len(), 3);
    assert!(pos("routes") < pos("server"));
    assert!(pos("openapi") < pos("server"));
}

#[tokio::test]
async fn test_ordering_stays_transitive_through_an_empty_group() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new()
            .extension(Token::str("gap.first_ext"), recorder("first", &log, &counter))
            .extension(Token::str("gap.third_ext"), recorder("third", &log, &counter)),
        &store,
        None,
    )
    .unwrap();

    // gap.MIDDLE has edges but no extensions of its own; first -> MIDDLE ->
    // third must still serialize first before third.
    let manager = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("gap.first_ext"), Token::str("gap.FIRST"))
                .before_group(Token::str("gap.MIDDLE")),
            ExtensionRegistration::new(Token::str("gap.third_ext"), Token::str("gap.THIRD"))
                .after_group(Token::str("gap.MIDDLE")),
        ],
    )
    .unwrap();

    manager.stage1(Token::str("gap.THIRD")).await.unwrap();

    let order: Vec<String> = log.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(order, vec!["first".to_string(), "third".to_string()]);
}

#[tokio::test]
async fn test_concurrent_stage1_runs_the_group_once() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new().extension(Token::str("once.ext"), recorder("once", &log, &counter)),
        &store,
        None,
    )
    .unwrap();
    let manager = ExtensionsManager::new(
        injector,
        vec![ExtensionRegistration::new(
            Token::str("once.ext"),
            Token::str("once.GROUP"),
        )],
    )
    .unwrap();

    // Two unrelated consumers awaiting the same group concurrently.
    let (a, b) = tokio::join!(
        manager.stage1(Token::str("once.GROUP")),
        manager.stage1(Token::str("once.GROUP")),
    );

    assert_eq!(a.unwrap().group_data.len(), 1);
    assert_eq!(b.unwrap().group_data.len(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // A later call still observes the completed result.
    manager.stage1(Token::str("once.GROUP")).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_group_cycle_reports_exact_path() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new()
            .extension(Token::str("cycle.e1"), recorder("e1", &log, &counter))
            .extension(Token::str("cycle.e2"), recorder("e2", &log, &counter))
            .extension(Token::str("cycle.e3"), recorder("e3", &log, &counter)),
        &store,
        None,
    )
    .unwrap();

    let result = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("cycle.e1"), Token::str("cycle.G1"))
                .before_group(Token::str("cycle.G2")),
            ExtensionRegistration::new(Token::str("cycle.e2"), Token::str("cycle.G2"))
                .before_group(Token::str("cycle.G3")),
            ExtensionRegistration::new(Token::str("cycle.e3"), Token::str("cycle.G3"))
                .before_group(Token::str("cycle.G1")),
        ],
    );

    match result {
        Err(DiError::GroupCycle(path)) => {
            // A rotation of G1 -> G2 -> G3 -> G1, first node repeated.
            assert_eq!(path.len(), 4);
            assert_eq!(path.first(), path.last());
            let mut members = path[..3].to_vec();
            members.sort();
            assert_eq!(members, vec!["cycle.G1", "cycle.G2", "cycle.G3"]);
        }
        other => panic!("expected GroupCycle, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_self_edge_is_reported_as_one_node_cycle() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new().extension(Token::str("selfe.ext"), recorder("selfe", &log, &counter)),
        &store,
        None,
    )
    .unwrap();

    let result = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("selfe.ext"), Token::str("selfe.G"))
                .before_group(Token::str("selfe.G")),
        ],
    );
    assert!(matches!(
        result,
        Err(DiError::GroupCycle(path)) if path == vec!["selfe.G", "selfe.G"]
    ));
}

#[tokio::test]
async fn test_is_last_extension_call_marks_only_the_final_init() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new()
            .extension(Token::str("last.a"), recorder("a", &log, &counter))
            .extension(Token::str("last.b"), recorder("b", &log, &counter))
            .extension(Token::str("last.c"), recorder("c", &log, &counter)),
        &store,
        None,
    )
    .unwrap();
    let manager = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("last.a"), Token::str("last.G1")),
            ExtensionRegistration::new(Token::str("last.b"), Token::str("last.G1")),
            ExtensionRegistration::new(Token::str("last.c"), Token::str("last.G2"))
                .after_group(Token::str("last.G1")),
        ],
    )
    .unwrap();

    manager.run_all().await.unwrap();

    let flags: Vec<bool> = log.lock().unwrap().iter().map(|(_, last)| *last).collect();
    assert_eq!(flags, vec![false, false, true]);
}

#[tokio::test]
async fn test_extension_shared_by_two_groups_runs_once() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new().extension(Token::str("shared.ext"), recorder("shared", &log, &counter)),
        &store,
        None,
    )
    .unwrap();
    let manager = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("shared.ext"), Token::str("shared.G1")),
            ExtensionRegistration::new(Token::str("shared.ext"), Token::str("shared.G2")),
        ],
    )
    .unwrap();

    manager.run_all().await.unwrap();

    // The side effect ran once; both groups still observe the payload.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let g1 = manager.stage1(Token::str("shared.G1")).await.unwrap();
    let g2 = manager.stage1(Token::str("shared.G2")).await.unwrap();
    assert_eq!(g1.downcast::<String>().unwrap().len(), 1);
    assert_eq!(g2.downcast::<String>().unwrap().len(), 1);
}

struct Collector {
    source_group: Token,
}

#[async_trait]
impl Extension for Collector {
    async fn init(&self, cx: &InitContext) -> DiResult<AnyArc> {
        let upstream = cx.stage1(self.source_group.clone()).await?;
        let names = upstream.downcast::<String>()?;
        let combined: Vec<String> = names.iter().map(|n| format!("seen:{}", n)).collect();
        Ok(Arc::new(combined) as AnyArc)
    }
}

#[tokio::test]
async fn test_extension_pulls_another_groups_finalized_data() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new()
            .extension(Token::str("pull.producer"), recorder("routes", &log, &counter))
            .extension(
                Token::str("pull.consumer"),
                Arc::new(Collector {
                    source_group: Token::str("pull.SOURCE"),
                }),
            ),
        &store,
        None,
    )
    .unwrap();
    let manager = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("pull.producer"), Token::str("pull.SOURCE")),
            ExtensionRegistration::new(Token::str("pull.consumer"), Token::str("pull.SINK")),
        ],
    )
    .unwrap();

    let sink = manager.stage1(Token::str("pull.SINK")).await.unwrap();
    let combined = sink.downcast::<Vec<String>>().unwrap();
    assert_eq!(*combined[0], vec!["seen:routes".to_string()]);
    // The pulled group ran exactly once and is memoized.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    manager.stage1(Token::str("pull.SOURCE")).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pull_chain_looping_back_is_a_group_cycle() {
    let store = MetadataStore::new();

    let injector = Injector::resolve_and_create(
        Providers::new().extension(
            Token::str("loopy.ext"),
            Arc::new(Collector {
                source_group: Token::str("loopy.G"),
            }),
        ),
        &store,
        None,
    )
    .unwrap();
    let manager = ExtensionsManager::new(
        injector,
        vec![ExtensionRegistration::new(
            Token::str("loopy.ext"),
            Token::str("loopy.G"),
        )],
    )
    .unwrap();

    match manager.stage1(Token::str("loopy.G")).await {
        Err(DiError::ExtensionFailed { message, .. }) => {
            assert!(message.contains("cycle"), "message was: {}", message);
        }
        Err(DiError::GroupCycle(_)) => {}
        other => panic!("expected a cycle failure, got {:?}", other.err()),
    }
}

struct Failing;

#[async_trait]
impl Extension for Failing {
    async fn init(&self, _cx: &InitContext) -> DiResult<AnyArc> {
        Err(DiError::NoProvider {
            token: "fail.upstream".to_string(),
            requester: None,
        })
    }
}

#[tokio::test]
async fn test_failure_is_attributed_and_memoized() {
    let store = MetadataStore::new();
    let injector = Injector::resolve_and_create(
        Providers::new().extension(Token::str("fail.ext"), Arc::new(Failing)),
        &store,
        None,
    )
    .unwrap();
    let manager = ExtensionsManager::new(
        injector,
        vec![ExtensionRegistration::new(
            Token::str("fail.ext"),
            Token::str("fail.G"),
        )],
    )
    .unwrap();

    let (a, b) = tokio::join!(
        manager.stage1(Token::str("fail.G")),
        manager.stage1(Token::str("fail.G")),
    );

    for result in [a, b] {
        match result {
            Err(DiError::ExtensionFailed { group, extension, .. }) => {
                assert_eq!(group, "fail.G");
                assert_eq!(extension, "fail.ext");
            }
            other => panic!("expected ExtensionFailed, got {:?}", other.err()),
        }
    }
}

#[tokio::test]
async fn test_export_only_payload_is_excluded_from_group_data() {
    let store = MetadataStore::new();
    let log: Log = Arc::new(Mutex::new(vec![]));
    let counter = Arc::new(AtomicUsize::new(0));

    let injector = Injector::resolve_and_create(
        Providers::new()
            .extension(Token::str("exp.visible"), recorder("visible", &log, &counter))
            .extension(Token::str("exp.hidden"), recorder("hidden", &log, &counter)),
        &store,
        None,
    )
    .unwrap();
    let manager = ExtensionsManager::new(
        injector,
        vec![
            ExtensionRegistration::new(Token::str("exp.visible"), Token::str("exp.G")),
            ExtensionRegistration::new(Token::str("exp.hidden"), Token::str("exp.G"))
                .export_only(),
        ],
    )
    .unwrap();

    let data = manager.stage1(Token::str("exp.G")).await.unwrap();
    let names = data.downcast::<String>().unwrap();
    assert_eq!(names.len(), 1);
    assert_eq!(*names[0], "visible");
    // Export-only extensions still initialize.
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stage1_on_group_with_no_registrations_is_empty() {
    let store = MetadataStore::new();
    let injector = Injector::resolve_and_create(Providers::new(), &store, None).unwrap();
    let manager = ExtensionsManager::new(injector, vec![]).unwrap();

    let data = manager.stage1(Token::str("empty.G")).await.unwrap();
    assert!(data.group_data.is_empty());
}
