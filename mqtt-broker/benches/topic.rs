use criterion::{black_box, criterion_group, criterion_main, Criterion};

use mqtt_broker::topic::{filter_valid, matches};

fn bench_filter_valid(c: &mut Criterion) {
    let filters = [
        "sport/tennis/player1",
        "sport/+/player1",
        "sport/#",
        "+/+/+/+/+/+/+",
        "$SYS/broker/clients/#",
    ];

    c.bench_function("filter_valid", |b| {
        b.iter(|| {
            for f in filters.iter() {
                black_box(filter_valid(black_box(f)));
            }
        })
    });
}

fn bench_matches(c: &mut Criterion) {
    let cases = [
        ("sport/tennis/player1", "sport/tennis/player1"),
        ("sport/+/player1", "sport/tennis/player1"),
        ("sport/#", "sport/tennis/player1/ranking/history"),
        ("+/monitor/Clients", "$SYS/monitor/Clients"),
        ("#", "a/b/c/d/e/f/g/h"),
    ];

    c.bench_function("matches", |b| {
        b.iter(|| {
            for (filter, topic) in cases.iter() {
                black_box(matches(black_box(filter), black_box(topic)));
            }
        })
    });
}

criterion_group!(benches, bench_filter_valid, bench_matches);
criterion_main!(benches);
