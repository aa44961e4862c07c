use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ledger_anchor::domain::NewLedgerTransaction;
use ledger_anchor::domain::hash::{hmac_signature, merkle_root, transaction_hash};
use serde_json::json;
use std::hint::black_box;

fn bench_transaction_hash(c: &mut Criterion) {
    let data = json!({
        "amount": 1000.00,
        "currency": "USD",
        "description": "Consulting, March",
        "lines": [{"sku": "HR-1", "qty": 3}, {"sku": "HR-2", "qty": 1}],
    });

    c.bench_function("transaction_hash", |b| {
        b.iter(|| {
            transaction_hash(
                black_box("invoice"),
                black_box("finance"),
                black_box("INV-001"),
                black_box(&data),
                black_box("org-1"),
            )
        })
    });

    let new = NewLedgerTransaction::new("invoice", "finance", "INV-001", data, Some("org-1".into()));
    c.bench_function("validate_new_transaction", |b| {
        b.iter(|| {
            let _ = black_box(&new).check();
        })
    });
}

fn bench_merkle_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_root");
    for size in [10usize, 100, 1000] {
        let leaves: Vec<String> = (0..size).map(|i| format!("{:064x}", i)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &leaves, |b, leaves| {
            b.iter(|| merkle_root(black_box(leaves)))
        });
    }
    group.finish();
}

fn bench_hmac(c: &mut Criterion) {
    let payload = r#"{"source_id":"INV-001","transaction_hash":"ab"}"#;
    c.bench_function("hmac_signature", |b| {
        b.iter(|| hmac_signature(black_box(payload), black_box(b"secret-key")))
    });
}

criterion_group!(benches, bench_transaction_hash, bench_merkle_root, bench_hmac);
criterion_main!(benches);
