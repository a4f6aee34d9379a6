//! Full lifecycle scenarios: augment, start, live-reload into a fresh
//! generation, and tear down, the way a dev-mode session drives the engine.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use reforge::{
    ApplicationEntryPoint, AppState, AugmentorConfig, Augmentor, ClassPathMode, EntryPointItem,
    GeneratedResource, LaunchMode, LiveReload, RuntimeContext, StepBuilder, TransformedResource,
};

/// Entry point that signals readiness and parks until told to stop.
struct ParkedApp;

impl ApplicationEntryPoint for ParkedApp {
    fn run(&self, context: RuntimeContext) -> anyhow::Result<i32> {
        let (tx, rx) = mpsc::channel::<()>();
        context.on_stop(move || {
            let _ = tx.send(());
        });
        context.notify_started();
        let _ = rx.recv();
        Ok(0)
    }
}

fn entry_step() -> StepBuilder {
    StepBuilder::from_fn("entry_point", |cx| async move {
        cx.produce(EntryPointItem(Arc::new(ParkedApp)))?;
        Ok(())
    })
    .produces::<EntryPointItem>()
}

fn dev_config() -> AugmentorConfig {
    AugmentorConfig {
        class_path_mode: ClassPathMode::Isolated,
        launch_mode: LaunchMode::Development,
        worker_threads: 2,
        ..AugmentorConfig::default()
    }
}

#[tokio::test]
async fn augment_start_reload_stop_round_trip() {
    let mut augmentor = Augmentor::new(dev_config());
    augmentor.add_step(entry_step()).add_step(
        StepBuilder::from_fn("emit_greeting", |cx| async move {
            let live = cx.consume::<LiveReload>()?;
            let text = if live.is_reload() { "hello v2" } else { "hello" };
            cx.produce(GeneratedResource::application(
                "greeting.txt",
                text.as_bytes().to_vec(),
            ))?;
            Ok(())
        })
        .consumes::<LiveReload>()
        .produces::<GeneratedResource>(),
    );

    let first = augmentor.augment().await.unwrap().start().unwrap();
    assert_eq!(first.state(), AppState::Running);
    let first_loader = first.loader();
    assert_eq!(
        &first_loader.resource("greeting.txt").unwrap().unwrap()[..],
        b"hello"
    );

    // the old application keeps running while the next generation augments
    let second_action = augmentor
        .reload(BTreeSet::from(["greeting.txt".to_string()]))
        .await
        .unwrap();
    assert_eq!(first.state(), AppState::Running);
    assert!(!first_loader.is_closed());

    let second = second_action.start().unwrap();
    assert_eq!(
        &second.loader().resource("greeting.txt").unwrap().unwrap()[..],
        b"hello v2"
    );

    first.stop();
    second.stop();
    assert_eq!(first.state(), AppState::Stopped);
    assert_eq!(second.state(), AppState::Stopped);
    augmentor.close();
}

#[tokio::test]
async fn reload_state_survives_runs_but_not_augmentors() {
    struct ScanCache(Vec<String>);

    fn caching_step() -> StepBuilder {
        StepBuilder::from_fn("cached_scan", |cx| async move {
            let live = cx.consume::<LiveReload>()?;
            let lines = match live.context().get::<ScanCache>() {
                Some(cached) => cached.0.clone(),
                None => {
                    let fresh = vec!["scanned".to_string()];
                    live.context().put(ScanCache(fresh.clone()));
                    fresh
                }
            };
            cx.produce(GeneratedResource::application(
                "scan.txt",
                lines.join("\n").into_bytes(),
            ))?;
            Ok(())
        })
        .consumes::<LiveReload>()
        .produces::<GeneratedResource>()
    }

    let mut augmentor = Augmentor::new(dev_config());
    augmentor.add_step(entry_step()).add_step(caching_step());

    augmentor.augment().await.unwrap();
    assert!(augmentor.reload_context().get::<ScanCache>().is_some());
    augmentor
        .reload(BTreeSet::from(["src/lib.rs".to_string()]))
        .await
        .unwrap();
    augmentor.close();

    // a fresh augmentor is a fresh logical application: no carried state
    let mut fresh = Augmentor::new(dev_config());
    fresh.add_step(entry_step()).add_step(caching_step());
    assert!(fresh.reload_context().get::<ScanCache>().is_none());
    fresh.augment().await.unwrap();
    fresh.close();
}

#[tokio::test]
async fn transformed_resources_shadow_generated_ones() {
    let mut augmentor = Augmentor::new(dev_config());
    augmentor
        .add_step(entry_step())
        .add_step(
            StepBuilder::from_fn("emit_original", |cx| async move {
                cx.produce(GeneratedResource::application(
                    "service.conf",
                    b"mode=plain".to_vec(),
                ))?;
                Ok(())
            })
            .produces::<GeneratedResource>(),
        )
        .add_step(
            StepBuilder::from_fn("instrument", |cx| async move {
                cx.produce(TransformedResource {
                    name: "service.conf".to_string(),
                    bytes: b"mode=instrumented".to_vec(),
                })?;
                Ok(())
            })
            .produces::<TransformedResource>(),
        );

    let action = augmentor.augment().await.unwrap();
    assert_eq!(
        &action.loader().resource("service.conf").unwrap().unwrap()[..],
        b"mode=instrumented"
    );
    augmentor.close();
}

#[tokio::test]
async fn flat_classpath_reuses_one_loader_across_reloads() {
    let mut augmentor = Augmentor::new(AugmentorConfig {
        class_path_mode: ClassPathMode::Flat,
        launch_mode: LaunchMode::Test,
        keep_alive: true,
        worker_threads: 1,
        ..AugmentorConfig::default()
    });
    augmentor.add_step(entry_step()).add_step(
        StepBuilder::from_fn("emit_marker", |cx| async move {
            let live = cx.consume::<LiveReload>()?;
            let generation = if live.is_reload() { "2" } else { "1" };
            cx.produce(GeneratedResource::application(
                "gen.txt",
                generation.as_bytes().to_vec(),
            ))?;
            Ok(())
        })
        .consumes::<LiveReload>()
        .produces::<GeneratedResource>(),
    );

    let first = augmentor.augment().await.unwrap();
    let first_loader = first.loader().clone();
    assert_eq!(&first_loader.resource("gen.txt").unwrap().unwrap()[..], b"1");

    let second = augmentor.reload(BTreeSet::new()).await.unwrap();
    assert!(Arc::ptr_eq(&first_loader, second.loader()));
    assert_eq!(&first_loader.resource("gen.txt").unwrap().unwrap()[..], b"2");
    augmentor.close();
}

#[tokio::test]
async fn shutdown_tasks_registered_by_steps_run_on_stop_in_reverse_order() {
    use reforge::ShutdownContextItem;

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicUsize::new(0));

    let mut augmentor = Augmentor::new(dev_config());
    let step_order = Arc::clone(&order);
    augmentor.add_step(entry_step()).add_step(
        StepBuilder::from_fn("open_resources", move |cx| {
            let order = Arc::clone(&step_order);
            async move {
                let shutdown = cx.consume::<ShutdownContextItem>()?;
                let first = Arc::clone(&order);
                shutdown.0.register("close-db", move || {
                    first.lock().unwrap().push("db");
                });
                let second = Arc::clone(&order);
                shutdown.0.register("close-cache", move || {
                    second.lock().unwrap().push("cache");
                });
                cx.produce(GeneratedResource::application(
                    "db.conf",
                    b"pool=2".to_vec(),
                ))?;
                Ok(())
            }
        })
        .consumes::<ShutdownContextItem>()
        .produces::<GeneratedResource>(),
    );

    let app = augmentor.augment().await.unwrap().start().unwrap();
    {
        let closed = Arc::clone(&closed);
        app.add_close_task("count", move || {
            closed.fetch_add(1, Ordering::SeqCst);
        });
    }

    // repeated stops tear down once
    app.stop();
    app.stop();
    assert_eq!(*order.lock().unwrap(), vec!["cache", "db"]);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    augmentor.close();
}
