//! Framing and transaction throughput

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vfd_spindle::adu::{crc16, AduBuilder};
use vfd_spindle::sim::{ManualClock, SimTransport, SimulatedVfd};
use vfd_spindle::{Context, ModbusBus, ModbusConfig, ModbusEngine, ModbusMessage};

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    group.bench_function("crc16_8_bytes", |b| {
        let frame = [0x01u8, 0x10, 0x09, 0x01, 0x00, 0x01, 0x02, 0x13];
        b.iter(|| crc16(black_box(&frame)))
    });

    group.bench_function("build_write_register_frame", |b| {
        b.iter(|| {
            AduBuilder::build_write_single_register(black_box(1), 0x2001, black_box(5000))
                .and_then(|adu| adu.to_frame())
        })
    });

    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let device = SimulatedVfd::new(1).with_register(0x2103, 5000).shared();
    let clock = ManualClock::new();
    let transport = SimTransport::new(clock.clone(), SimulatedVfd::responder(&device));
    let mut engine = ModbusEngine::new(transport.clone(), clock, ModbusConfig::default());

    c.bench_function("blocking_read_round_trip", |b| {
        b.iter(|| {
            let message =
                ModbusMessage::read_holding_registers(Context::GetRpm, 1, 0x2103, 1).unwrap();
            let outcome = engine.transact(message).unwrap();
            transport.clear_requests();
            black_box(outcome)
        })
    });
}

criterion_group!(benches, bench_framing, bench_engine);
criterion_main!(benches);
