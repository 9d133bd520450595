use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use ulid::Ulid;

use onduty::config::Config;
use onduty::engine::now_ms;
use onduty::model::{AvailabilityStatus, Ms, Span};
use onduty::reconciler::{ReconcileMode, ReconcileOptions};
use onduty::service::AvailabilityService;

const HOUR: Ms = 3_600_000; // 1 hour in ms

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn open(mode: ReconcileMode) -> Arc<AvailabilityService> {
    let config = Config {
        data_dir: std::env::temp_dir().join(format!("onduty_bench_{}", Ulid::new())),
        reconcile: ReconcileOptions {
            mode,
            ..ReconcileOptions::default()
        },
        ..Config::default()
    };
    let service = AvailabilityService::open(&config, None).expect("open service");
    service.start(&config).await;
    Arc::new(service)
}

async fn professional(service: &AvailabilityService) -> Ulid {
    let pid = Ulid::new();
    service
        .register_professional(pid, None)
        .await
        .expect("register professional");
    pid
}

async fn phase1_sequential(base: Ms) {
    let service = open(ReconcileMode::Inline).await;
    let pid = professional(&service).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = base + (i as Ms) * HOUR;
        let t = Instant::now();
        let booking = service
            .create_booking(Ulid::new(), pid, Ulid::new(), Span::new(s, s + HOUR))
            .await
            .expect("create booking");
        service.confirm_booking(booking.id).await.expect("confirm booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} create+confirm in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(base: Ms) {
    let service = open(ReconcileMode::Queued).await;
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let tasks = (0..n_tasks).map(|_| {
        let service = service.clone();
        tokio::spawn(async move {
            let pid = professional(&service).await;
            for j in 0..n_per_task {
                let s = base + (j as Ms) * HOUR;
                service
                    .create_booking(Ulid::new(), pid, Ulid::new(), Span::new(s, s + HOUR))
                    .await
                    .expect("create booking");
            }
        })
    });
    for r in join_all(tasks).await {
        r.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} professionals x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_resolve_under_load(base: Ms) {
    let service = open(ReconcileMode::Queued).await;
    let pid = professional(&service).await;
    for i in 0..500 {
        let s = base + (i as Ms) * HOUR;
        service
            .upsert_calendar_entry(
                Ulid::new(),
                pid,
                Span::new(s, s + HOUR / 2),
                onduty::model::CalendarSource::External,
                Some(format!("evt-{i}")),
            )
            .await
            .expect("seed calendar");
    }

    let writer = {
        let service = service.clone();
        tokio::spawn(async move {
            for i in 0..1000 {
                let s = base + (i as Ms) * HOUR + HOUR / 2;
                let _ = service
                    .create_booking(Ulid::new(), pid, Ulid::new(), Span::new(s, s + HOUR / 4))
                    .await;
            }
        })
    };

    let mut latencies = Vec::with_capacity(2000);
    let mut busy = 0;
    for i in 0..2000 {
        let as_of = base + (i as Ms % 500) * HOUR + 10;
        let t = Instant::now();
        let r = service
            .resolve_availability(pid, Some(as_of))
            .await
            .expect("resolve");
        latencies.push(t.elapsed());
        if r.status == AvailabilityStatus::Busy {
            busy += 1;
        }
    }
    writer.await.expect("writer panicked");

    println!("  2000 resolves, {busy} busy");
    print_latency("resolve latency", &mut latencies);
}

async fn phase4_reconcile_storm() {
    let service = open(ReconcileMode::Queued).await;
    let n = 1000;
    let start = Instant::now();
    let ids = join_all((0..n).map(|_| professional(&service))).await;

    // Wait for the worker to catch up on every professional.
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut done = 0;
    while Instant::now() < deadline {
        done = 0;
        for id in &ids {
            if matches!(service.latest_availability(*id).await, Ok(Some(_))) {
                done += 1;
            }
        }
        if done == n {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    println!(
        "  {done}/{n} professionals reconciled in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    // Well clear of now so the sweeper has nothing to flip mid-run.
    let base = now_ms() + 24 * HOUR;

    println!("=== onduty stress benchmark ===\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(base).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(base).await;

    println!("\n[phase 3] resolve latency under write load");
    phase3_resolve_under_load(base).await;

    println!("\n[phase 4] reconcile storm");
    phase4_reconcile_storm().await;

    println!("\n=== benchmark complete ===");
}
