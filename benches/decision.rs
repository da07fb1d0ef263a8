//! Benchmarks for the admission decision path.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quotagate::quota::{evaluate, CapMode, DecisionEngine, PeriodPolicy, PlanType, Provisioner};
use quotagate::store::{LocalRecordStore, QuotaRecordStore};
use tokio::runtime::Runtime;

fn bench_evaluate(c: &mut Criterion) {
    let provisioner = Provisioner::new(
        Arc::new(LocalRecordStore::new_in_memory()),
        PeriodPolicy::default(),
    );
    let mut group = c.benchmark_group("evaluate");

    for (label, plan, cap_mode, used) in [
        ("free_fresh", PlanType::Free, CapMode::Hard, 0),
        ("free_warning", PlanType::Free, CapMode::Hard, 9),
        ("pro_soft_grace", PlanType::Pro, CapMode::Soft, 21),
        ("enterprise_denied", PlanType::Enterprise, CapMode::Soft, 500),
    ] {
        let mut record = provisioner.build_record("bench-user", plan);
        record.cap_mode = cap_mode;
        record.daily_requests_used = used;
        record.daily_tokens_used = used * 1_000;
        group.bench_with_input(BenchmarkId::from_parameter(label), &record, |b, record| {
            b.iter(|| black_box(evaluate(black_box(record))))
        });
    }
    group.finish();
}

fn bench_check(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = Arc::new(LocalRecordStore::new_in_memory());
    rt.block_on(async {
        let provisioner = Provisioner::new(store.clone(), PeriodPolicy::default());
        for i in 0..10_000 {
            provisioner
                .provision(&format!("user-{i}"), PlanType::Basic)
                .await
                .unwrap();
        }
        store.add_usage("user-4242", 3, 9_000).await.unwrap();
    });
    let engine = DecisionEngine::new(store);

    c.bench_function("check_10k_users", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(engine.check("user-4242").await.unwrap()) })
    });
}

criterion_group!(benches, bench_evaluate, bench_check);
criterion_main!(benches);
