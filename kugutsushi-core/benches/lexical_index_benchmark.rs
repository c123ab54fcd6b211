//! Lexical Index (BM25) performance benchmarks.
//!
//! Benchmarks the operations that dominate indexing and query cost at
//! corpus scale:
//! - 2-gram tokenisation of Japanese text
//! - batched `add` + `flush` (posting-blob rewrite, `min_df` pruning)
//! - `search` over a pre-populated index
//!
//! Run with: `cargo bench --bench lexical_index_benchmark`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kugutsushi_core::config::LexicalIndexConfig;
use kugutsushi_core::lexical_index::{tokenize, LexicalIndex};
use kugutsushi_core::types::PassageId;

const SAMPLE_SENTENCES: &[&str] = &[
    "機械学習は統計と最適化の交点にある手法である",
    "自然言語処理は人間の言語をコンピュータで扱う研究分野である",
    "深層学習はニューラルネットワークを多層に重ねた手法である",
    "検索エンジンは大量の文書から関連する情報を見つけ出す",
    "今日の天気は晴れで気温も穏やかだった",
];

fn passage_text(i: usize) -> String {
    SAMPLE_SENTENCES[i % SAMPLE_SENTENCES.len()].repeat(1 + i % 3)
}

fn bench_tokenize(c: &mut Criterion) {
    let mut group = c.benchmark_group("tokenize");
    for len in [1usize, 4, 16] {
        let text = passage_text(0).repeat(len);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &text, |b, text| {
            b.iter(|| black_box(tokenize(black_box(text))));
        });
    }
    group.finish();
}

fn bench_add_and_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_and_flush");
    for batch_size in [64usize, 256, 1024] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            b.iter_batched(
                || LexicalIndex::open_in_memory(LexicalIndexConfig::default()).unwrap(),
                |mut index| {
                    for i in 0..batch_size {
                        index.add(PassageId(i as u64), &passage_text(i));
                    }
                    index.flush().unwrap();
                    black_box(index);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    for corpus_size in [1_000usize, 10_000] {
        let mut index = LexicalIndex::open_in_memory(LexicalIndexConfig::default()).unwrap();
        for i in 0..corpus_size {
            index.add(PassageId(i as u64), &passage_text(i));
        }
        index.flush().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(corpus_size), &index, |b, index| {
            b.iter(|| black_box(index.search(black_box("機械学習"), black_box(10)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(lexical_index_benches, bench_tokenize, bench_add_and_flush, bench_search);
criterion_main!(lexical_index_benches);
