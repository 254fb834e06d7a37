use std::sync::{Arc, Mutex};
use std::time::Duration;

use query_engine::mutation::options::MutationOptions;
use query_engine::query::client::QueryClient;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// S6: `onMutate` resolves after 500ms with a context value, `mutationFn`
/// resolves after another 1s with `"result:" + variables`; at t=0 the
/// mutation is pending with `variables` already recorded, at t=500ms
/// `onMutateResult` has landed, and by t=1.5s the mutation has succeeded with
/// `onSettled` observing the same data/variables/context.
#[tokio::test(start_paused = true)]
async fn optimistic_context_then_delayed_success_settles_with_full_context() {
    let client = QueryClient::new();

    let mutation_fn = Arc::new(move |variables: String, _ctx: query_engine::mutation::context::MutationFnContext| -> futures::future::BoxFuture<'static, Result<String, String>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(format!("result:{variables}"))
        })
    });

    let settled: Arc<Mutex<Option<(Option<String>, Option<String>, String, Option<String>)>>> = Arc::new(Mutex::new(None));
    let settled_clone = settled.clone();

    let options = MutationOptions {
        on_mutate: Some(Arc::new(|_variables: String, _ctx: query_engine::mutation::context::MutationFnContext| -> futures::future::BoxFuture<'static, Result<String, String>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok("ctx".to_string())
            })
        })),
        on_settled: Some(Arc::new(move |data: Option<String>, error: Option<String>, variables: String, on_mutate_result: Option<String>| {
            let settled_clone = settled_clone.clone();
            Box::pin(async move {
                *settled_clone.lock().unwrap() = Some((data, error, variables, on_mutate_result));
            })
        })),
        ..client.default_mutation_options::<String, String, String, String>()
    };

    let observer = client.build_mutation_observer(mutation_fn, options);
    let handle = tokio::spawn({
        let observer = observer.clone();
        async move { observer.mutate("x".to_string()).await }
    });

    settle().await;
    let result = observer.result();
    assert!(result.is_pending);
    assert_eq!(result.variables, Some("x".to_string()));
    assert_eq!(result.on_mutate_result, None);

    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(observer.result().on_mutate_result, Some("ctx".to_string()));
    assert!(observer.result().is_pending, "mutationFn is still in flight at t=500ms");

    tokio::time::advance(Duration::from_secs(1)).await;
    let outcome = handle.await.unwrap();
    assert_eq!(outcome.unwrap(), "result:x");

    let result = observer.result();
    assert!(result.is_success);
    assert_eq!(result.data, Some("result:x".to_string()));

    let settled = settled.lock().unwrap().clone().expect("onSettled must have run");
    assert_eq!(settled, (Some("result:x".to_string()), None, "x".to_string(), Some("ctx".to_string())));
}

/// Property 8: callback ordering for a successful mutation is
/// `onMutate, mutationFn, onSuccess, onSettled`.
#[tokio::test(start_paused = true)]
async fn successful_mutation_runs_callbacks_in_order() {
    let client = QueryClient::new();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mutation_fn = {
        let order = order.clone();
        Arc::new(move |variables: String, _ctx: query_engine::mutation::context::MutationFnContext| -> futures::future::BoxFuture<'static, Result<String, String>> {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push("mutationFn");
                Ok(format!("ok:{variables}"))
            })
        })
    };

    let options = MutationOptions {
        on_mutate: Some(Arc::new({
            let order = order.clone();
            move |_variables: String, _ctx: query_engine::mutation::context::MutationFnContext| -> futures::future::BoxFuture<'static, Result<(), String>> {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("onMutate");
                    Ok(())
                })
            }
        })),
        on_success: Some(Arc::new({
            let order = order.clone();
            move |_data: String, _variables: String, _ctx: Option<()>| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("onSuccess");
                }) as futures::future::BoxFuture<'static, ()>
            }
        })),
        on_settled: Some(Arc::new({
            let order = order.clone();
            move |_data: Option<String>, _error: Option<String>, _variables: String, _ctx: Option<()>| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("onSettled");
                }) as futures::future::BoxFuture<'static, ()>
            }
        })),
        ..client.default_mutation_options::<String, String, (), String>()
    };

    let observer = client.build_mutation_observer(mutation_fn, options);
    observer.mutate("x".to_string()).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["onMutate", "mutationFn", "onSuccess", "onSettled"]);
}

/// Property 8: callback ordering for a failing mutation is
/// `onMutate, mutationFn, onError, onSettled`.
#[tokio::test(start_paused = true)]
async fn failing_mutation_runs_callbacks_in_order() {
    let client = QueryClient::new();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mutation_fn = {
        let order = order.clone();
        Arc::new(move |_variables: String, _ctx: query_engine::mutation::context::MutationFnContext| -> futures::future::BoxFuture<'static, Result<String, String>> {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push("mutationFn");
                Err("boom".to_string())
            })
        })
    };

    let options = MutationOptions {
        on_mutate: Some(Arc::new({
            let order = order.clone();
            move |_variables: String, _ctx: query_engine::mutation::context::MutationFnContext| -> futures::future::BoxFuture<'static, Result<(), String>> {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("onMutate");
                    Ok(())
                })
            }
        })),
        on_error: Some(Arc::new({
            let order = order.clone();
            move |_error: String, _variables: String, _ctx: Option<()>| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("onError");
                }) as futures::future::BoxFuture<'static, ()>
            }
        })),
        on_settled: Some(Arc::new({
            let order = order.clone();
            move |_data: Option<String>, _error: Option<String>, _variables: String, _ctx: Option<()>| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("onSettled");
                }) as futures::future::BoxFuture<'static, ()>
            }
        })),
        retry: query_engine::retry::no_retry_policy(),
        ..client.default_mutation_options::<String, String, (), String>()
    };

    let observer = client.build_mutation_observer(mutation_fn, options);
    let result = observer.mutate("x".to_string()).await;

    assert!(result.is_err());
    assert_eq!(*order.lock().unwrap(), vec!["onMutate", "mutationFn", "onError", "onSettled"]);
}

/// A mutation's `invalidates` filters run once it succeeds, flipping the
/// matching queries' `isInvalidated` flag.
#[tokio::test(start_paused = true)]
async fn successful_mutation_invalidates_matching_queries() {
    let client = QueryClient::new();
    let key = query_engine::key!["todos"];

    let _ = client.set_query_data::<String, String>(&key, |_| Some("cached".to_string()), None);

    let mutation_fn = Arc::new(|variables: String, _ctx: query_engine::mutation::context::MutationFnContext| -> futures::future::BoxFuture<'static, Result<String, String>> {
        Box::pin(async move { Ok(format!("added:{variables}")) })
    });

    let filter = query_engine::query::cache::Filter::by_key(key.clone());
    let options = MutationOptions::<String, String, (), String> {
        invalidates: vec![filter],
        ..client.default_mutation_options()
    };

    let observer = client.build_mutation_observer(mutation_fn, options);
    observer.mutate("todo-1".to_string()).await.unwrap();

    let state = client.get_query_state::<String, String>(&key).unwrap();
    assert!(state.is_invalidated, "a successful mutation must invalidate queries matched by its `invalidates` filters");
}
