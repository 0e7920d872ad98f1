use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hmc_rs::{
    chain_rng, HmcChain, HmcSettings, InitStrategy, LogpError, LogpFunc, MetricKind, SampleRecord,
};
use thiserror::Error;

struct NormalLogp {
    dim: usize,
    mu: f64,
}

#[derive(Error, Debug)]
enum NormalLogpError {}

impl LogpError for NormalLogpError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

impl LogpFunc for NormalLogp {
    type LogpError = NormalLogpError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
        let mut logp = 0f64;
        for (p, g) in position.iter().zip(gradient.iter_mut()) {
            let val = self.mu - p;
            logp -= val * val / 2.;
            *g = val;
        }
        Ok(logp)
    }
}

fn make_chain(dim: usize, metric: MetricKind) -> HmcChain<NormalLogp, rand_chacha::ChaCha8Rng> {
    let settings = HmcSettings {
        metric,
        num_warmup: 0,
        step_size: Some(0.5),
        ..Default::default()
    };
    let mut chain = HmcChain::new(NormalLogp { dim, mu: 3. }, &settings, chain_rng(42, 0), 0)
        .expect("valid settings");
    chain
        .initialize(&InitStrategy::User(vec![3.5; dim]))
        .expect("finite initial point");
    chain
}

fn draw_n(chain: &mut HmcChain<NormalLogp, rand_chacha::ChaCha8Rng>, n: usize) -> SampleRecord {
    let mut last = chain.draw().expect("draw");
    for _ in 1..n {
        last = chain.draw().expect("draw");
    }
    last
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [10, 1000] {
        c.bench_function(&format!("sample normal {dim}"), |b| {
            b.iter_batched(
                || make_chain(dim, MetricKind::Diag),
                |mut chain| black_box(draw_n(&mut chain, 10)),
                BatchSize::SmallInput,
            )
        });
    }

    c.bench_function("sample normal dense 50", |b| {
        b.iter_batched(
            || make_chain(50, MetricKind::Dense),
            |mut chain| black_box(draw_n(&mut chain, 10)),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("warm-up normal 10", |b| {
        b.iter(|| {
            let settings = HmcSettings {
                num_warmup: 200,
                num_draws: 100,
                refresh: 0,
                ..Default::default()
            };
            let mut trace: Vec<SampleRecord> = vec![];
            hmc_rs::sample(
                NormalLogp { dim: 10, mu: 3. },
                &settings,
                &InitStrategy::default(),
                &mut trace,
            )
            .expect("sampling");
            black_box(trace.len())
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
