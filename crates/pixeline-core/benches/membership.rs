use pixeline_core::{BloomFilter, MembershipFilter};

fn urls(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("https://img.example.com/photos/{i}/original.jpg"))
        .collect()
}

#[divan::bench(args = [10_000, 100_000])]
fn bloom_insert(bencher: divan::Bencher, n: usize) {
    let keys = urls(n);
    bencher.bench(|| {
        let mut bloom = BloomFilter::with_rate(n, 0.0001);
        for key in &keys {
            bloom.insert(key);
        }
        bloom
    });
}

#[divan::bench(args = [10_000, 100_000])]
fn bloom_lookup_miss(bencher: divan::Bencher, n: usize) {
    let mut bloom = BloomFilter::with_rate(n, 0.0001);
    for key in urls(n) {
        bloom.insert(&key);
    }
    let probes: Vec<String> = (0..1000).map(|i| format!("https://other.example/{i}")).collect();
    bencher.bench(|| probes.iter().filter(|p| bloom.contains(p)).count());
}

#[divan::bench(threads = [1, 4])]
fn shared_filter_check_and_insert(bencher: divan::Bencher) {
    let filter = MembershipFilter::new(1_000_000, 0.0001);
    let keys = urls(1000);
    bencher.bench(|| keys.iter().filter(|k| filter.check_and_insert(k)).count());
}

fn main() {
    divan::main();
}
