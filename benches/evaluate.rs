use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lazy_phylo::{
    share, CheckpointManager, EvaluatorOptions, ModelRef, StrictClock, SymmetricKernel,
    TreeLikelihood, TreeModel, Variable,
};

fn balanced(first: usize, count: usize) -> String {
    if count == 1 {
        format!("T{}:0.05", first)
    } else {
        let half = count / 2;
        format!(
            "({},{}):0.05",
            balanced(first, half),
            balanced(first + half, count - half)
        )
    }
}

fn make_graph(
    leaves: usize,
    sites: usize,
) -> (ModelRef<TreeModel>, ModelRef<TreeLikelihood<SymmetricKernel>>) {
    let mut newick = balanced(0, leaves);
    newick.truncate(newick.len() - ":0.05".len());
    newick.push(';');

    let alphabet = ['A', 'C', 'G', 'T'];
    let sequences: Vec<String> = (0..leaves)
        .map(|taxon| {
            (0..sites)
                .map(|site| alphabet[(site * 31 + taxon * (site % 5 + 1)) % 4])
                .collect()
        })
        .collect();
    let sequences: Vec<&str> = sequences.iter().map(String::as_str).collect();

    let tree = share(TreeModel::from_newick("tree", &newick).unwrap()).unwrap();
    let rate = Variable::new("clock.rate", vec![1.0]).into_parameter();
    let clock = share(StrictClock::new("clock", rate).unwrap())
        .unwrap()
        .into_branch_rates();
    let kernel = SymmetricKernel::from_alignment("ACGT", &sequences).unwrap();
    let likelihood = share(
        TreeLikelihood::new("likelihood", tree.clone(), clock, kernel, EvaluatorOptions::default())
            .unwrap(),
    )
    .unwrap();
    (tree, likelihood)
}

fn criterion_benchmark(c: &mut Criterion) {
    for leaves in [16, 256] {
        let (tree, likelihood) = make_graph(leaves, 200);
        likelihood.evaluate().unwrap();

        c.bench_function(&format!("full evaluation {}", leaves), |b| {
            b.iter(|| {
                likelihood.make_dirty().unwrap();
                black_box(likelihood.evaluate().unwrap())
            })
        });

        let mut checkpoint = CheckpointManager::new();
        checkpoint.add_root(&likelihood);
        let leaf = leaves / 3;
        let length = tree.borrow().unwrap().branch_length(leaf);
        c.bench_function(&format!("one branch proposal {}", leaves), |b| {
            b.iter(|| {
                checkpoint.store_state().unwrap();
                tree.set_branch_length(leaf, black_box(length * 1.1)).unwrap();
                let value = likelihood.evaluate().unwrap();
                checkpoint.restore_state().unwrap();
                value
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
