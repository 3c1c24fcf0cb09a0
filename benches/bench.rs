use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use ibfexpr::{
    BinCounts, BuildConfig, EstimateConfig, Estimator, IndexBuilder, InterleavedBloomFilter,
    LevelSpec, LevelStore, Membership, MinimiserConfig, MinimiserSource, QueryTranscript,
    WindowMinimiser,
};

const BIN_COUNTS: &[usize] = &[64, 1024];

fn random_dna(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

fn bench_bulk_contains(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut group = c.benchmark_group("bulk_contains");

    for &bins in BIN_COUNTS {
        let mut ibf = InterleavedBloomFilter::new(bins, 1 << 16, 2).unwrap();
        for _ in 0..50_000 {
            ibf.insert(rng.gen(), rng.gen_range(0..bins)).unwrap();
        }
        let compressed = ibf.compress();
        let probes: Vec<u64> = (0..1000).map(|_| rng.gen()).collect();
        let mut counts = vec![0u32; bins];

        group.bench_with_input(BenchmarkId::new("uncompressed", bins), &probes, |b, probes| {
            b.iter(|| {
                for &hash in probes {
                    ibf.count_into(hash, &mut counts);
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("compressed", bins), &probes, |b, probes| {
            b.iter(|| {
                for &hash in probes {
                    compressed.count_into(hash, &mut counts);
                }
            });
        });
    }
    group.finish();
}

fn bench_estimate(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("Bench_");

    let minimiser_config = MinimiserConfig::new(20, 40);
    let source = WindowMinimiser::new(minimiser_config).unwrap();
    let transcripts: Vec<QueryTranscript> = (0..200)
        .map(|i| QueryTranscript::new(format!("t{}", i), random_dna(&mut rng, 1500)))
        .collect();
    let bins: Vec<BinCounts> = (0..16)
        .map(|bin| {
            let minimisers = transcripts
                .iter()
                .filter_map(|t| rng.gen_bool(0.5).then(|| (t, rng.gen_range(1..8))))
                .flat_map(|(t, copies)| {
                    let minimisers = source.minimisers(&t.sequence);
                    std::iter::repeat(minimisers).take(copies).flatten()
                })
                .collect::<Vec<u64>>();
            BinCounts::from_minimisers(format!("bin{}", bin), minimisers)
        })
        .collect();

    let config = BuildConfig::new(LevelSpec::Global(vec![1, 2, 4, 8])).with_fpr(vec![0.05]);
    IndexBuilder::new(config, minimiser_config)
        .build(&bins, &prefix)
        .unwrap();
    let store = LevelStore::open(&prefix).unwrap();

    let mut group = c.benchmark_group("estimate");
    group.sample_size(10);
    for threads in [1, 4] {
        let estimator = Estimator::new(&store, EstimateConfig::new().with_threads(threads)).unwrap();
        group.bench_with_input(BenchmarkId::new("threads", threads), &transcripts, |b, transcripts| {
            b.iter(|| estimator.estimate(transcripts, &source).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bulk_contains, bench_estimate);
criterion_main!(benches);
