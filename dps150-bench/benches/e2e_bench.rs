//! End-to-end session benchmarks against the simulated device.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dps150_client::{Client, ConnectionConfig, SerialConfig, SimulatedDevice};
use dps150_protocol::codes;
use std::time::Duration;
use tokio::runtime::Runtime;

struct TestSetup {
    _device: SimulatedDevice,
    client: Client,
}

fn setup_session(rt: &Runtime) -> TestSetup {
    let device = SimulatedDevice::new();

    // No settle delay, so the numbers reflect the client itself
    let config = ConnectionConfig::new(SerialConfig::new("sim"))
        .with_settle_delay(Duration::ZERO)
        .with_request_timeout(Duration::from_secs(1));
    let client = Client::new(config);

    rt.block_on(async {
        client.connect_stream(device.stream()).await.unwrap();
    });

    TestSetup {
        _device: device,
        client,
    }
}

fn bench_set_voltage(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_session(&rt);

    let mut group = c.benchmark_group("e2e_set");
    group.throughput(Throughput::Elements(1));

    let mut step = 0u32;
    group.bench_function("set_voltage", |b| {
        b.to_async(&rt).iter(|| {
            step = (step + 1) % 100;
            let client = &setup.client;
            async move { black_box(client.set_voltage(step as f32 * 0.1).await.unwrap()) }
        });
    });

    group.finish();
}

fn bench_request_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_session(&rt);

    let mut group = c.benchmark_group("e2e_latency");

    group.bench_function("get_float", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(setup.client.get_float(codes::VOLTAGE_SET).await.unwrap())
        });
    });

    group.bench_function("get_all", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.get_all().await.unwrap()) });
    });

    group.finish();
}

fn bench_concurrent_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_session(&rt);

    let mut group = c.benchmark_group("e2e_concurrent");
    group.sample_size(20);
    group.throughput(Throughput::Elements(3));

    // Distinct type codes, so none of the requests supersede each other
    group.bench_function("three_types", |b| {
        b.to_async(&rt).iter(|| {
            let client = &setup.client;
            async move {
                black_box(tokio::join!(
                    client.get_float(codes::VOLTAGE_SET),
                    client.get_float(codes::CURRENT_SET),
                    client.get_all(),
                ))
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set_voltage,
    bench_request_latency,
    bench_concurrent_requests,
);

criterion_main!(benches);
