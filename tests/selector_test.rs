//! Backend selection through the public registry API

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::ScriptedBackend;
use orbweaver::backend::{Backend, BackendCriteria, BackendRegistry, BackendSelector, BackendSource};

fn register(registry: &BackendRegistry, name: &str, criteria: BackendCriteria) {
    registry
        .register_backend(
            name,
            BackendSource::Instance(Arc::new(ScriptedBackend::new(name))),
            Some(criteria),
        )
        .unwrap();
}

#[test]
fn test_equal_patterns_pick_higher_priority_every_time() {
    let registry = Arc::new(BackendRegistry::new());
    register(&registry, "low", BackendCriteria::new().with_priority(5).with_url_patterns(["*"]));
    register(&registry, "high", BackendCriteria::new().with_priority(10).with_url_patterns(["*"]));
    let selector = BackendSelector::new(registry);

    for url in ["https://a.test/", "http://b.test/x?y=1", "https://c.test/deep/path"] {
        for _ in 0..5 {
            assert_eq!(selector.select(url, None).as_deref(), Some("high"));
        }
    }
}

#[test]
fn test_name_breaks_priority_ties_regardless_of_registration_order() {
    let registry = Arc::new(BackendRegistry::new());
    register(&registry, "b1", BackendCriteria::new().with_priority(10));
    register(&registry, "b2", BackendCriteria::new().with_priority(5));
    register(&registry, "b0", BackendCriteria::new().with_priority(10));
    let selector = BackendSelector::new(registry);

    for _ in 0..10 {
        assert_eq!(selector.select("https://x.test/", None).as_deref(), Some("b0"));
    }
}

#[test]
fn test_glob_patterns() {
    let registry = Arc::new(BackendRegistry::new());
    register(
        &registry,
        "docs",
        BackendCriteria::new()
            .with_priority(5)
            .with_url_patterns(["https://docs.*/*", "*.pdf"]),
    );
    register(&registry, "general", BackendCriteria::new());
    let selector = BackendSelector::new(registry);

    assert_eq!(
        selector.select("https://docs.example.com/guide", None).as_deref(),
        Some("docs")
    );
    assert_eq!(
        selector.select("https://www.example.com/guide", None).as_deref(),
        Some("general")
    );
}

#[tokio::test]
async fn test_unregistered_backend_is_no_longer_selected() {
    let registry = Arc::new(BackendRegistry::new());
    register(&registry, "a", BackendCriteria::new().with_priority(9));
    register(&registry, "b", BackendCriteria::new());
    let selector = BackendSelector::new(Arc::clone(&registry));

    assert_eq!(selector.select("https://x.test/", None).as_deref(), Some("a"));

    assert!(registry.unregister_backend("a").await);

    assert_eq!(selector.select("https://x.test/", None).as_deref(), Some("b"));
}

#[tokio::test]
async fn test_factory_builds_once_and_unregister_closes() {
    let registry = Arc::new(BackendRegistry::new());
    let built = Arc::new(AtomicUsize::new(0));
    let instance = Arc::new(ScriptedBackend::new("lazy"));

    let counter = Arc::clone(&built);
    let shared = Arc::clone(&instance);
    registry
        .register_backend(
            "lazy",
            BackendSource::factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let backend: Arc<dyn Backend> = shared.clone();
                Ok(backend)
            }),
            None,
        )
        .unwrap();

    assert!(!registry.all_backends()[0].instantiated);

    let selector = BackendSelector::new(Arc::clone(&registry));
    for _ in 0..3 {
        let backend = selector.select_backend("https://x.test/", None).unwrap().unwrap();
        assert_eq!(backend.name(), "lazy");
    }
    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(registry.all_backends()[0].instantiated);

    assert!(registry.unregister_backend("lazy").await);
    assert_eq!(instance.closed.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[test]
fn test_content_type_parameters_are_ignored() {
    let registry = Arc::new(BackendRegistry::new());
    register(
        &registry,
        "json",
        BackendCriteria::new().with_content_types(["application/json"]),
    );
    register(&registry, "html", BackendCriteria::new().with_priority(50));
    let selector = BackendSelector::new(registry);

    assert_eq!(
        selector
            .select("https://api.test/v1", Some("Application/JSON; charset=utf-8"))
            .as_deref(),
        Some("json")
    );
}
