
use bellwork::{JobCounts, NewJob, QueueEventKind, QueueService, handler_fn};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use test_utils::{collect_events, memory_service};

#[tokio::test(start_paused = true)]
async fn test_at_most_concurrency_jobs_run_at_once() {
    let (_, service) = memory_service("test");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (now_running, max_seen) = (running.clone(), peak.clone());
    service
        .process_job(
            "default",
            handler_fn(move |_ctx| {
                let running = now_running.clone();
                let peak = max_seen.clone();
                async move {
                    let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            5,
        )
        .await
        .unwrap();

    let mut events = service.subscribe("default").await.unwrap();
    for n in 0..10 {
        service
            .add_job(
                "default",
                NewJob::new(json!({"type": "user.reminder", "n": n})),
            )
            .await
            .unwrap();
    }

    collect_events(&mut events, QueueEventKind::Completed, 10).await;
    assert_eq!(peak.load(Ordering::SeqCst), 5);
    assert_eq!(running.load(Ordering::SeqCst), 0);

    let counts = service.job_counts("default").await.unwrap();
    assert_eq!(
        counts,
        JobCounts {
            completed: 10,
            ..Default::default()
        }
    );

    service.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_of_one_runs_jobs_in_order() {
    let (_, service) = memory_service("test");
    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let seen = order.clone();

    service
        .process_job(
            "default",
            handler_fn(move |ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().await.push(ctx.id().to_string());
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            }),
            1,
        )
        .await
        .unwrap();

    let mut events = service.subscribe("default").await.unwrap();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            service
                .add_job("default", NewJob::new(json!({"type": "user.reminder"})))
                .await
                .unwrap(),
        );
    }

    collect_events(&mut events, QueueEventKind::Completed, 3).await;
    assert_eq!(*order.lock().await, ids);

    service.close().await.unwrap();
}
