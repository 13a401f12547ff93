use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use taxokernel_core::{detect_rank, parse_name, strip_author_candidates, NameTables};

const NAMES: [&str; 10] = [
    "Pinus",
    "Pinus merkusii",
    "Pinus merkusii Jungh. & de Vriese",
    "Pinus merkusii subsp. sumatrana",
    "Coelogyne Lindl.",
    "Malaxis Sol. ex Sw.",
    "Mammalia",
    "Ficus benjamina var. nuda (Miq.) Barrett",
    "Canis lupus familiaris",
    "Mangifera indica L.",
];

fn load_tables() -> NameTables {
    NameTables::builtin().unwrap_or_else(|err| panic!("builtin name tables failed to load: {err}"))
}

fn bench_parse_and_detect(c: &mut Criterion) {
    let tables = load_tables();

    c.bench_function("parse_and_detect_rank_10_names", |b| {
        b.iter(|| {
            for raw in NAMES {
                match parse_name(raw, &tables) {
                    Ok(parsed) => {
                        black_box(detect_rank(&parsed, None, &tables));
                    }
                    Err(err) => panic!("rank benchmark parse failed for {raw}: {err}"),
                }
            }
        });
    });
}

fn bench_strip_authors(c: &mut Criterion) {
    let tables = load_tables();

    c.bench_function("strip_author_candidates_10_names", |b| {
        b.iter(|| {
            for raw in NAMES {
                black_box(strip_author_candidates(black_box(raw), &tables));
            }
        });
    });
}

criterion_group!(resolver_benches, bench_parse_and_detect, bench_strip_authors);
criterion_main!(resolver_benches);
