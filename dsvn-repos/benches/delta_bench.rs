use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dsvn_repos::{DumpOptions, NoHooks, Repository, apply_delta, compute_delta, dump_fs, never_cancel};

fn sample_text(len: usize) -> Vec<u8> {
    (0..len).map(|i| b"abcdefghijklmnopqrstuvwxyz\n"[(i * 7 + i / 13) % 27]).collect()
}

fn edited(base: &[u8]) -> Vec<u8> {
    let mut target = base.to_vec();
    let step = (target.len() / 16).max(1);
    for i in (0..target.len()).step_by(step) {
        target[i] = b'#';
    }
    target.extend_from_slice(b"appended tail\n");
    target
}

fn bench_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta");
    for len in [4 * 1024, 256 * 1024, 2 * 1024 * 1024] {
        let base = sample_text(len);
        let target = edited(&base);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("compute", len), &len, |b, _| {
            b.iter(|| compute_delta(black_box(&base), black_box(&target)))
        });
        let delta = compute_delta(&base, &target);
        group.bench_with_input(BenchmarkId::new("apply", len), &len, |b, _| {
            b.iter(|| apply_delta(black_box(&base), black_box(&delta)).unwrap())
        });
    }
    group.finish();
}

fn bench_dump(c: &mut Criterion) {
    let repos = Repository::in_memory();
    let mut text = sample_text(64 * 1024);
    for rev in 0..50 {
        let mut txn = repos.begin_txn_for_commit(None, Some("bench"), "edit", &NoHooks).unwrap();
        if rev == 0 {
            txn.make_file("/data.txt").unwrap();
        }
        text = edited(&text);
        txn.set_contents("/data.txt", text.clone()).unwrap();
        repos.commit(&mut txn, &NoHooks).unwrap();
    }

    let mut group = c.benchmark_group("dump");
    for use_deltas in [false, true] {
        let options = DumpOptions {
            use_deltas,
            ..Default::default()
        };
        group.bench_function(if use_deltas { "deltas" } else { "full_text" }, |b| {
            b.iter(|| {
                let mut out = Vec::new();
                dump_fs(&repos, &mut out, &options, &never_cancel, &mut |_| {}).unwrap();
                out
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_delta, bench_dump);
criterion_main!(benches);
