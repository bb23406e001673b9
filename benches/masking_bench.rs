//! 脱敏性能基准测试

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ironlog::infrastructure::masking::DataMasker;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Payment {
    card_number: String,
    cvv: String,
    iban: String,
    customer_email: String,
    amount_cents: u64,
}

fn bench_mask_text(c: &mut Criterion) {
    let masker = DataMasker::with_default_rules().expect("built-in rules compile");
    let mut group = c.benchmark_group("mask_text");

    let inputs = [
        ("clean", "payment accepted for order 8812, amount 42.00 EUR".to_string()),
        (
            "sensitive",
            "card 4111111234561234 cvv: 123 iban FR7630006000011234567890189 mail john.doe@example.com"
                .to_string(),
        ),
        ("long", "ordinary log text without secrets ".repeat(64)),
    ];
    for (name, input) in inputs.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            b.iter(|| masker.mask(black_box(input)))
        });
    }
    group.finish();
}

fn bench_mask_loggable(c: &mut Criterion) {
    let masker = DataMasker::with_default_rules().expect("built-in rules compile");
    let payment = Payment {
        card_number: "4111111234561234".into(),
        cvv: "123".into(),
        iban: "FR7630006000011234567890189".into(),
        customer_email: "john.doe@example.com".into(),
        amount_cents: 4200,
    };

    c.bench_function("mask_loggable_payment", |b| {
        b.iter(|| masker.mask_loggable(black_box(&payment)))
    });

    let disabled = DataMasker::disabled();
    c.bench_function("mask_loggable_disabled", |b| {
        b.iter(|| disabled.mask_loggable(black_box(&payment)))
    });
}

criterion_group!(benches, bench_mask_text, bench_mask_loggable);
criterion_main!(benches);
