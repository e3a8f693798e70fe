use criterion::{Criterion, criterion_group, criterion_main};
use custody_settlement::app::orchestrator::to_base_units;
use custody_settlement::domain::{SubmitWithdrawalRequest, TransactionStatus};
use rust_decimal_macros::dec;
use std::hint::black_box;
use validator::Validate;

fn bench_validation(c: &mut Criterion) {
    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(105.5),
        to_address: "0x00000000000000000000000000000000000000bb".to_string(),
        address_tag: None,
        note: None,
    };

    c.bench_function("validate_withdrawal_request", |b| {
        b.iter(|| {
            let _ = black_box(&request).validate();
        })
    });
}

fn bench_status_transitions(c: &mut Criterion) {
    let transitions = [
        (TransactionStatus::Created, TransactionStatus::Accepted),
        (TransactionStatus::Accepted, TransactionStatus::Processing),
        (TransactionStatus::Processing, TransactionStatus::Completed),
        (TransactionStatus::Completed, TransactionStatus::Fail),
    ];

    c.bench_function("status_can_transition", |b| {
        b.iter(|| {
            for (from, to) in black_box(&transitions) {
                let _ = from.can_transition(*to);
            }
        })
    });
}

fn bench_base_unit_conversion(c: &mut Criterion) {
    c.bench_function("to_base_units_18_decimals", |b| {
        b.iter(|| {
            let _ = to_base_units(black_box(dec!(1234.56789)), black_box(18));
        })
    });
}

criterion_group!(
    benches,
    bench_validation,
    bench_status_transitions,
    bench_base_unit_conversion
);
criterion_main!(benches);
