use criterion::{black_box, criterion_group, criterion_main, Criterion};
use partcomm_benchmark::metrics::{RoundTiming, SampleBatch};
use partcomm_benchmark::stats::{t_quantile, AggregateStat, RerunPolicy, TransferEstimate};
use partcomm_benchmark::utils::format_scientific;

fn benchmark_statistics(c: &mut Criterion) {
    let samples: Vec<f64> = (0..150).map(|i| 1.0e-5 + (i % 7) as f64 * 1.0e-7).collect();

    c.bench_function("aggregate_150_samples", |b| {
        b.iter(|| AggregateStat::from_samples(black_box(&samples)))
    });

    c.bench_function("t_quantile_interpolated", |b| b.iter(|| t_quantile(black_box(149))));

    let sender = AggregateStat::from_samples(&samples);
    let compute = AggregateStat {
        mean: 1.0e-6,
        std_dev: 1.0e-8,
    };
    let policy = RerunPolicy::default();
    c.bench_function("estimate_and_decide", |b| {
        b.iter(|| {
            let estimate = TransferEstimate::compute(black_box(1 << 20), sender, compute, sender, 150);
            policy.decide(estimate.ci_time, estimate.adjusted_time, black_box(3))
        })
    });

    c.bench_function("record_batch", |b| {
        b.iter(|| {
            let mut batch = SampleBatch::new(1, 150).unwrap();
            for &elapsed in &samples {
                batch.record(RoundTiming { elapsed, compute: 0.0 });
            }
            black_box(batch.distribution())
        })
    });

    c.bench_function("format_scientific", |b| b.iter(|| format_scientific(black_box(1.234567e-5))));
}

criterion_group!(benches, benchmark_statistics);
criterion_main!(benches);
