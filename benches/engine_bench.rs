//! Hybrid logical clock and collective tree computation overhead
//! benchmarking.

use std::fmt;
use std::time::Duration;

use cartwright::{Hlc, TreeDescriptor, TreeKind, TreeTopo};

use rand::Rng;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

use lazy_static::lazy_static;

static TOPOS: [(TreeKind, u32); 4] = [
    (TreeKind::Flat, 0),
    (TreeKind::Kary, 2),
    (TreeKind::Kary, 8),
    (TreeKind::Knomial, 4),
];
static SIZES: [u32; 4] = [16, 256, 4096, 65536];

struct BenchId(pub u32, pub (TreeKind, u32));

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@({:?},{})", self.0, self.1 .0, self.1 .1)
    }
}

lazy_static!(
    /// Pre-generated remote timestamps around the local physical time.
    static ref REMOTE_HLCS: Vec<u64> = {
        let base = Hlc::new(0).now();
        let mut rng = rand::thread_rng();
        (0..4096)
            .map(|_| base.saturating_sub(rng.gen_range(0..(1 << 30))))
            .collect()
    };
);

fn walk_tree(size: u32, topo: (TreeKind, u32)) -> u32 {
    let topo = TreeTopo::new(topo.0, topo.1).unwrap();
    let mut visited = 0;
    for me in 0..size.min(1024) {
        let tree = TreeDescriptor::new(topo, size, 0, me).unwrap();
        visited += tree.child_count();
        black_box(tree.children());
    }
    visited
}

fn hlc_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("hlc_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    let hlc = Hlc::new(1_000_000_000);
    group.bench_function("now", |b| b.iter(|| black_box(hlc.now())));
    group.bench_function("merge", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % REMOTE_HLCS.len();
            black_box(hlc.merge(REMOTE_HLCS[i]))
        })
    });

    group.finish();
}

fn tree_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    for size in SIZES {
        for topo in TOPOS {
            group.bench_with_input(
                BenchmarkId::from_parameter(BenchId(size, topo)),
                &BenchId(size, topo),
                |b, bench_id| {
                    b.iter(|| walk_tree(bench_id.0, bench_id.1));
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, hlc_bench_group, tree_bench_group);
criterion_main!(benches);
