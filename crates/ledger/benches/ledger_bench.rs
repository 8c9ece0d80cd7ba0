use chrono::Utc;
use common::{OrderId, OrderItemId, ProductId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{FulfillmentJob, JobType, StockItem};
use ledger::{InMemoryLedger, JobStore, StockStore};

fn seeded_stock(n: usize) -> Vec<StockItem> {
    (0..n)
        .map(|i| StockItem::new("SKU-BENCH", format!("CODE-{i}")))
        .collect()
}

fn bench_claim_single_unit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let product = ProductId::new("SKU-BENCH");

    c.bench_function("ledger/claim_single_unit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ledger = InMemoryLedger::new();
                ledger.insert_stock(&seeded_stock(10)).await.unwrap();
                ledger
                    .claim_stock(&product, 1, OrderId::new(), OrderItemId::new(), Utc::now())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_claim_from_large_pool(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = InMemoryLedger::new();
    let product = ProductId::new("SKU-BENCH");

    rt.block_on(async {
        ledger.insert_stock(&seeded_stock(10_000)).await.unwrap();
    });

    c.bench_function("ledger/claim_from_10k_pool", |b| {
        b.iter(|| {
            rt.block_on(async {
                let order_id = OrderId::new();
                let claimed = ledger
                    .claim_stock(&product, 1, order_id, OrderItemId::new(), Utc::now())
                    .await
                    .unwrap();
                if claimed.is_some() {
                    ledger.release_stock(order_id).await.unwrap();
                }
            });
        });
    });
}

fn bench_claim_due_jobs(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("ledger/claim_due_jobs_batch_50", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ledger = InMemoryLedger::new();
                let now = Utc::now();
                for _ in 0..100 {
                    let job = FulfillmentJob::new(
                        OrderId::new(),
                        OrderItemId::new(),
                        JobType::Stock,
                        5,
                        now,
                    );
                    ledger.insert_job(&job).await.unwrap();
                }
                let claimed = ledger.claim_due_jobs(now, 50).await.unwrap();
                assert_eq!(claimed.len(), 50);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_claim_single_unit,
    bench_claim_from_large_pool,
    bench_claim_due_jobs,
);
criterion_main!(benches);
