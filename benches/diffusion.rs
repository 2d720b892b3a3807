use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use diffgat::core::Mode;
use diffgat::gnn::{GatNet, NetworkConfig};
use diffgat::graph::RelationalGraph;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIM: usize = 32;

fn random_graph(num_nodes: usize, num_edges: usize, rng: &mut StdRng) -> RelationalGraph {
    let triplets: Vec<(usize, usize, usize)> = (0..num_edges)
        .map(|_| {
            (
                rng.gen_range(0..num_nodes),
                rng.gen_range(0..4),
                rng.gen_range(0..num_nodes),
            )
        })
        .collect();
    let table = Array2::from_shape_fn((8, DIM), |_| rng.gen::<f32>() - 0.5);
    RelationalGraph::from_triplets(num_nodes, 4, &triplets, table, true).unwrap()
}

fn bench_forward(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut group = c.benchmark_group("gatnet_forward");

    for &num_nodes in &[100usize, 1_000] {
        let graph = random_graph(num_nodes, num_nodes * 8, &mut rng);
        let features = Array2::from_shape_fn((num_nodes, DIM), |_| rng.gen::<f32>());
        let net = GatNet::with_rng(
            NetworkConfig {
                num_feats: DIM,
                num_hidden: DIM,
                num_classes: DIM,
                num_layers: 2,
                k: 3,
                num_heads: 2,
                dropout: 0.0,
                ..Default::default()
            },
            &mut rng,
        )
        .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(num_nodes), &num_nodes, |b, _| {
            b.iter(|| {
                net.forward(black_box(&graph), black_box(&features), Mode::Inference)
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut group = c.benchmark_group("gatnet_backward");

    for &num_nodes in &[100usize, 1_000] {
        let graph = random_graph(num_nodes, num_nodes * 8, &mut rng);
        let features = Array2::from_shape_fn((num_nodes, DIM), |_| rng.gen::<f32>());
        let upstream = Array2::from_elem((num_nodes, DIM), 1.0 / num_nodes as f32);
        let net = GatNet::with_rng(
            NetworkConfig {
                num_feats: DIM,
                num_hidden: DIM,
                num_classes: DIM,
                num_layers: 2,
                k: 3,
                num_heads: 2,
                dropout: 0.2,
                ..Default::default()
            },
            &mut rng,
        )
        .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(num_nodes), &num_nodes, |b, _| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(7);
                let (_, tape) = net
                    .forward_recorded(&graph, black_box(&features), Mode::Training, &mut rng)
                    .unwrap();
                net.backward(&graph, &tape, black_box(&upstream)).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_forward, bench_backward);
criterion_main!(benches);
