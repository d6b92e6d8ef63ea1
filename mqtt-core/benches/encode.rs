use criterion::{black_box, criterion_group, criterion_main, Criterion};

use mqtt_core::{Publish, QoS, SubscribeAck, SubscribeReturnCode};

fn bench_encode(c: &mut Criterion) {
    let publish = Publish {
        dup: true,
        retain: true,
        qos: QoS::ExactlyOnce,
        topic: "topic",
        packet_id: Some(0x4321),
        payload: b"data",
    };
    let subscribe_ack = SubscribeAck {
        packet_id: 0x1234,
        status: vec![
            SubscribeReturnCode::Success(QoS::AtLeastOnce),
            SubscribeReturnCode::Failure,
            SubscribeReturnCode::Success(QoS::ExactlyOnce),
        ],
    };

    let mut buf = [0u8; 256];

    c.bench_function("encode publish", |b| {
        b.iter(|| publish.encode(black_box(&mut buf)).unwrap())
    });
    c.bench_function("encode subscribe_ack", |b| {
        b.iter(|| subscribe_ack.encode(black_box(&mut buf)).unwrap())
    });
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
