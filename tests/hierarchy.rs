use std::sync::{Arc, Mutex};

use trellis_di::{
    required_arg, DiError, Injector, MetadataStore, ParamMeta, Providers, Token,
};

#[test]
fn test_parent_chain_resolution_caches_at_owner() {
    let store = MetadataStore::new();
    let app = Injector::resolve_and_create(
        Providers::new().factory(Token::str("hier.db"), vec![], |_| {
            Ok("connection".to_string())
        }),
        &store,
        None,
    )
    .unwrap();
    let request =
        Injector::resolve_and_create(Providers::new(), &store, Some(app.clone())).unwrap();

    // Resolved through the child, constructed and cached at the parent.
    let via_child = request.get_as::<String>(Token::str("hier.db")).unwrap();
    let via_parent = app.get_as::<String>(Token::str("hier.db")).unwrap();
    assert!(Arc::ptr_eq(&via_child, &via_parent));
}

#[test]
fn test_both_levels_declaring_a_token_yield_independent_singletons() {
    let store = MetadataStore::new();
    let counter = Arc::new(Mutex::new(0));

    let make_providers = |counter: Arc<Mutex<i32>>| {
        Providers::new().factory(Token::str("hier.ctx"), vec![], move |_| {
            let mut c = counter.lock().unwrap();
            *c += 1;
            Ok(*c)
        })
    };

    let app = Injector::resolve_and_create(make_providers(counter.clone()), &store, None).unwrap();
    let module =
        Injector::resolve_and_create(make_providers(counter.clone()), &store, Some(app.clone()))
            .unwrap();

    let module_value = module.get_as::<i32>(Token::str("hier.ctx")).unwrap();
    let app_value = app.get_as::<i32>(Token::str("hier.ctx")).unwrap();

    assert!(!Arc::ptr_eq(&module_value, &app_value));
    assert_eq!(*counter.lock().unwrap(), 2);
}

#[test]
fn test_skip_self_resolves_to_parent_instance() {
    struct Guard {
        label: Arc<String>,
    }

    let store = MetadataStore::new();
    let app = Injector::resolve_and_create(
        Providers::new().value(Token::str("hier.limit"), "app-wide".to_string()),
        &store,
        None,
    )
    .unwrap();

    // The module both provides the token and consumes the application-wide
    // one: the classic decorator-override shape.
    let module = Injector::resolve_and_create(
        Providers::new()
            .value(Token::str("hier.limit"), "module-local".to_string())
            .factory(
                Token::of::<Guard>(),
                vec![ParamMeta::new(Token::str("hier.limit")).skip_self()],
                |args| {
                    Ok(Guard {
                        label: required_arg::<String>(args, 0)?,
                    })
                },
            ),
        &store,
        Some(app),
    )
    .unwrap();

    let guard = module.get_of::<Guard>().unwrap();
    assert_eq!(&**guard.label, "app-wide");

    // A plain lookup on the module still sees the local value.
    let local = module.get_as::<String>(Token::str("hier.limit")).unwrap();
    assert_eq!(&*local, "module-local");
}

#[test]
fn test_from_self_is_confined_to_the_own_list() {
    struct Reader {
        source: Arc<String>,
    }

    let store = MetadataStore::new();
    let app = Injector::resolve_and_create(
        Providers::new().value(Token::str("hier.source"), "parent".to_string()),
        &store,
        None,
    )
    .unwrap();

    let module = Injector::resolve_and_create(
        Providers::new()
            .value(Token::str("hier.source"), "local".to_string())
            .factory(
                Token::of::<Reader>(),
                vec![ParamMeta::new(Token::str("hier.source")).from_self()],
                |args| {
                    Ok(Reader {
                        source: required_arg::<String>(args, 0)?,
                    })
                },
            ),
        &store,
        Some(app),
    )
    .unwrap();

    assert_eq!(&**module.get_of::<Reader>().unwrap().source, "local");
}

#[test]
fn test_from_self_with_no_local_provider_fails_at_creation() {
    let store = MetadataStore::new();
    let app = Injector::resolve_and_create(
        Providers::new().value(Token::str("hier.only_above"), 1u8),
        &store,
        None,
    )
    .unwrap();

    // The parent provides the token, but a self-only dependency must not
    // see it; this is a resolution-time error, not a runtime crash.
    let result = Injector::resolve_and_create(
        Providers::new().factory(
            Token::str("hier.wants_local"),
            vec![ParamMeta::new(Token::str("hier.only_above")).from_self()],
            |_| Ok(0u8),
        ),
        &store,
        Some(app),
    );

    assert!(matches!(
        result,
        Err(DiError::NoProvider { token, .. }) if token == "hier.only_above"
    ));
}

#[test]
fn test_skip_self_with_no_parent_provider_fails_at_creation() {
    let store = MetadataStore::new();
    let app = Injector::resolve_and_create(Providers::new(), &store, None).unwrap();

    let result = Injector::resolve_and_create(
        Providers::new()
            .value(Token::str("hier.shadow"), 1u8)
            .factory(
                Token::str("hier.wants_outer"),
                vec![ParamMeta::new(Token::str("hier.shadow")).skip_self()],
                |_| Ok(0u8),
            ),
        &store,
        Some(app),
    );

    assert!(matches!(result, Err(DiError::NoProvider { .. })));
}

#[test]
fn test_reinit_reconstructs_fresh_state() {
    let store = MetadataStore::new();
    let counter = Arc::new(Mutex::new(0));
    let counter_clone = counter.clone();

    let providers = Providers::new().factory(Token::str("hier.session"), vec![], move |_| {
        let mut c = counter_clone.lock().unwrap();
        *c += 1;
        Ok(*c)
    });

    let first = Injector::resolve_and_create(providers.clone(), &store, None).unwrap();
    let before = first.get_as::<i32>(Token::str("hier.session")).unwrap();
    assert_eq!(*before, 1);
    drop(first);

    // Scope teardown plus rebuild: the old cache must not leak in.
    let second = Injector::resolve_and_create(providers, &store, None).unwrap();
    let after = second.get_as::<i32>(Token::str("hier.session")).unwrap();
    assert_eq!(*after, 2);
    assert_eq!(*counter.lock().unwrap(), 2);
}

#[test]
fn test_three_level_chain_resolves_through_grandparent() {
    let store = MetadataStore::new();
    let app = Injector::resolve_and_create(
        Providers::new().value(Token::str("hier.root_cfg"), 99u32),
        &store,
        None,
    )
    .unwrap();
    let module = Injector::resolve_and_create(Providers::new(), &store, Some(app)).unwrap();
    let request = Injector::resolve_and_create(Providers::new(), &store, Some(module)).unwrap();

    assert_eq!(*request.get_as::<u32>(Token::str("hier.root_cfg")).unwrap(), 99);
}

#[test]
fn test_has_token_walks_the_chain() {
    let store = MetadataStore::new();
    let app = Injector::resolve_and_create(
        Providers::new().value(Token::str("hier.present"), 1u8),
        &store,
        None,
    )
    .unwrap();
    let child = Injector::resolve_and_create(Providers::new(), &store, Some(app)).unwrap();

    assert!(child.has_token(Token::str("hier.present")));
    assert!(!child.has_token(Token::str("hier.absent")));
}
